//! Persisted per-actor configuration (spec.md §6 "Persisted configuration",
//! grounded in `original_source`'s `qtproperties.cpp`/
//! `qtpropertymanager_extensions.cpp` key/value serialization layer). A
//! one-shot load/save data shape, not a live property binding -- the
//! original's Qt widget binding is out of scope (spec.md Non-goals:
//! "session persistence").

use serde::{Deserialize, Serialize};

/// One repeated seed-actor block (spec.md §6:
/// `computationSeedActorName{i}`, `...StepSizeLon{i}`, `...StepSizeLat{i}`,
/// `...PressureLevels{i}`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeedActorConfig {
    pub name: String,
    pub step_size_lon: f64,
    pub step_size_lat: f64,
    pub pressure_levels: Vec<f64>,
}

/// Stable, persisted per-actor configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActorConfig {
    pub data_source_id: String,
    pub render_mode: String,
    pub render_color_mode: String,
    pub sync_enabled: bool,
    pub filter_pressure_time: String,
    pub filter_bbox: String,
    pub filter_timestep: String,
    pub transfer_function_name: String,
    pub multi_variable_enabled: bool,
    pub line_type: String,
    pub integration_method: String,
    pub interpolation_method: String,
    pub subtimesteps_per_datatimestep: u32,
    pub streamline_delta_s: f64,
    pub streamline_length: f64,
    pub seed_type: String,
    pub seed_actors: Vec<SeedActorConfig>,
}

impl ActorConfig {
    pub fn to_ron(&self) -> Result<String, ron::Error> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
    }

    pub fn from_ron(text: &str) -> Result<Self, ron::error::SpannedError> {
        ron::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ActorConfig {
        ActorConfig {
            data_source_id: "ECMWF_ENS".to_string(),
            render_mode: "TUBES".to_string(),
            render_color_mode: "VARIABLE".to_string(),
            sync_enabled: true,
            filter_pressure_time: "50/6".to_string(),
            filter_bbox: "-10/30/40/60".to_string(),
            filter_timestep: "ALL".to_string(),
            transfer_function_name: "RdBu".to_string(),
            multi_variable_enabled: false,
            line_type: "STREAMLINE".to_string(),
            integration_method: "RUNGE_KUTTA".to_string(),
            interpolation_method: "LINEAR".to_string(),
            subtimesteps_per_datatimestep: 4,
            streamline_delta_s: 3600.0,
            streamline_length: 72.0,
            seed_type: "GRID".to_string(),
            seed_actors: vec![SeedActorConfig {
                name: "seed0".to_string(),
                step_size_lon: 1.0,
                step_size_lat: 1.0,
                pressure_levels: vec![850.0, 700.0, 500.0],
            }],
        }
    }

    #[test]
    fn round_trips_through_ron_text() {
        let config = sample();
        let text = config.to_ron().unwrap();
        let parsed = ActorConfig::from_ron(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
