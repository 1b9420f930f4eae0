//! A synthetic trajectory generator standing in for the LAGRANTO/streamline
//! file-format reader that spec.md §1 places out of scope.
//!
//! Grounded in `trajectories.cpp`'s `MTrajectories` layout (contiguous
//! `[traj0_t0..traj0_tN, traj1_t0..traj1_tN, ...]` vertices, one start index
//! per trajectory) and `trajectoryactor.cpp`'s seed-grid request keys
//! (`SEED_MIN_POSITION`/`SEED_MAX_POSITION`/`SEED_STEP_SIZE_LON_LAT`/
//! `SEED_PRESSURE_LEVELS`). The actual vertex positions are a deterministic
//! synthetic drift, not an integrated wind field -- there is no NWP velocity
//! field in this workspace to integrate.

use std::sync::{Arc, Weak};

use wxvis_cache::HostCache;
use wxvis_core::error::PipelineError;
use wxvis_core::item::{DataItem, TrajectoryVertex, Trajectories};
use wxvis_core::keys::{
    END_TIME, INIT_TIME, INTEGRATION_METHOD, INTERPOLATION_METHOD, LINE_TYPE, MEMBER,
    SEED_MAX_POSITION, SEED_MIN_POSITION, SEED_PRESSURE_LEVELS, SEED_STEP_SIZE_LON_LAT, SEED_TYPE,
    STREAMLINE_DELTA_S, STREAMLINE_LENGTH, SUBTIMESTEPS_PER_DATATIMESTEP, TRY_PRECOMPUTED,
};
use wxvis_core::request::Request;
use wxvis_scheduler::{Scheduler, TaskSource};

use crate::source::{DataSource, SourceCore};

const OWN_KEYS: &[&str] = &[
    LINE_TYPE,
    INIT_TIME,
    END_TIME,
    MEMBER,
    INTEGRATION_METHOD,
    INTERPOLATION_METHOD,
    SUBTIMESTEPS_PER_DATATIMESTEP,
    STREAMLINE_DELTA_S,
    STREAMLINE_LENGTH,
    SEED_TYPE,
    SEED_MIN_POSITION,
    SEED_MAX_POSITION,
    SEED_STEP_SIZE_LON_LAT,
    SEED_PRESSURE_LEVELS,
    TRY_PRECOMPUTED,
];

/// Per-source behavior toggled by a request rather than compiled in (spec.md
/// §9 open question on `TRY_PRECOMPUTED`, resolved in SPEC_FULL.md §4.3).
#[derive(Clone, Copy, Debug, Default)]
pub struct ConformanceOptions {
    pub try_precomputed: bool,
}

impl ConformanceOptions {
    pub fn from_request(request: &Request) -> Self {
        let try_precomputed = matches!(request.get(TRY_PRECOMPUTED), Some("1") | Some("true"));
        ConformanceOptions { try_precomputed }
    }
}

fn parse_triplet(raw: &str) -> Result<(f64, f64, f64), PipelineError> {
    let mut parts = raw.splitn(3, '/');
    let lon = parts
        .next()
        .ok_or_else(|| PipelineError::Value(format!("malformed position triplet: {}", raw)))?
        .parse::<f64>()
        .map_err(|_| PipelineError::Value(format!("malformed position triplet: {}", raw)))?;
    let lat = parts
        .next()
        .ok_or_else(|| PipelineError::Value(format!("malformed position triplet: {}", raw)))?
        .parse::<f64>()
        .map_err(|_| PipelineError::Value(format!("malformed position triplet: {}", raw)))?;
    let pressure = parts
        .next()
        .ok_or_else(|| PipelineError::Value(format!("malformed position triplet: {}", raw)))?
        .parse::<f64>()
        .map_err(|_| PipelineError::Value(format!("malformed position triplet: {}", raw)))?;
    Ok((lon, lat, pressure))
}

fn parse_pair(raw: &str) -> Result<(f64, f64), PipelineError> {
    let mut parts = raw.splitn(2, '/');
    let a = parts
        .next()
        .ok_or_else(|| PipelineError::Value(format!("malformed pair: {}", raw)))?
        .parse::<f64>()
        .map_err(|_| PipelineError::Value(format!("malformed pair: {}", raw)))?;
    let b = parts
        .next()
        .ok_or_else(|| PipelineError::Value(format!("malformed pair: {}", raw)))?
        .parse::<f64>()
        .map_err(|_| PipelineError::Value(format!("malformed pair: {}", raw)))?;
    Ok((a, b))
}

fn parse_levels(raw: &str) -> Result<Vec<f64>, PipelineError> {
    raw.split('/')
        .map(|p| p.parse::<f64>().map_err(|_| PipelineError::Value(format!("malformed pressure level list: {}", raw))))
        .collect()
}

/// Synthesizes a regular lon/lat/pressure seed grid and drifts each seed
/// point deterministically, producing something with the right shape
/// (vertex layout, start indices, time axis) for the orchestrator and
/// exporter to exercise without a real streamline integrator.
pub struct PrecomputedTrajectorySource {
    core: SourceCore,
    self_weak: Weak<PrecomputedTrajectorySource>,
}

impl PrecomputedTrajectorySource {
    pub fn new(id: impl Into<String>, cache: Arc<HostCache>, scheduler: Arc<Scheduler>) -> Arc<Self> {
        let id = id.into();
        Arc::new_cyclic(|weak| PrecomputedTrajectorySource {
            core: SourceCore::new(id, cache, scheduler),
            self_weak: weak.clone(),
        })
    }

    fn self_handle(&self) -> Arc<dyn TaskSource> {
        self.self_weak.upgrade().expect("source dropped while request in flight")
    }

    fn produce_and_store(&self, request: &Request) -> Result<(), PipelineError> {
        let filtered = SourceCore::filter(request, OWN_KEYS);
        let _conformance = ConformanceOptions::from_request(&filtered);

        let (lon_min, lat_min, _) = parse_triplet(
            filtered.get(SEED_MIN_POSITION).ok_or_else(|| PipelineError::Key(SEED_MIN_POSITION.to_string()))?,
        )?;
        let (lon_max, lat_max, _) = parse_triplet(
            filtered.get(SEED_MAX_POSITION).ok_or_else(|| PipelineError::Key(SEED_MAX_POSITION.to_string()))?,
        )?;
        let (dlon, dlat) = parse_pair(
            filtered
                .get(SEED_STEP_SIZE_LON_LAT)
                .ok_or_else(|| PipelineError::Key(SEED_STEP_SIZE_LON_LAT.to_string()))?,
        )?;
        let levels = parse_levels(
            filtered
                .get(SEED_PRESSURE_LEVELS)
                .ok_or_else(|| PipelineError::Key(SEED_PRESSURE_LEVELS.to_string()))?,
        )?;
        if dlon <= 0.0 || dlat <= 0.0 {
            return Err(PipelineError::Value("seed step size must be positive".to_string()));
        }

        let init_time = filtered.get_timestamp(INIT_TIME)?;
        let end_time = filtered.get_timestamp(END_TIME)?;
        let delta_s = filtered.get_f64(STREAMLINE_DELTA_S).unwrap_or(3600.0).max(1.0);
        let duration = (end_time - init_time) as f64;
        let timesteps_per_trajectory = if duration <= 0.0 { 1 } else { (duration / delta_s).round() as usize + 1 };

        let mut seeds: Vec<(f64, f64, f64)> = Vec::new();
        let mut lon = lon_min;
        while lon <= lon_max + 1e-9 {
            let mut lat = lat_min;
            while lat <= lat_max + 1e-9 {
                for &pressure in &levels {
                    seeds.push((lon, lat, pressure));
                }
                lat += dlat;
            }
            lon += dlon;
        }
        if seeds.is_empty() {
            return Err(PipelineError::Value("seed grid produced no trajectories".to_string()));
        }

        let num_trajectories = seeds.len();
        let mut vertices = Vec::with_capacity(num_trajectories * timesteps_per_trajectory);
        let mut times_seconds = Vec::with_capacity(timesteps_per_trajectory);
        for t in 0..timesteps_per_trajectory {
            times_seconds.push((t as f64) * delta_s);
        }

        for (idx, &(seed_lon, seed_lat, seed_pressure)) in seeds.iter().enumerate() {
            // Deterministic synthetic drift: each seed advects eastward at a
            // fixed rate and its pressure oscillates about its seed level.
            // This stands in for a real streamline integration.
            let drift_rate_deg_per_hour = 0.5;
            let oscillation_amplitude_hpa = (idx as f64 % 5.0 + 1.0) * 10.0;
            for t in 0..timesteps_per_trajectory {
                let hours = times_seconds[t] / 3600.0;
                let lon = seed_lon + drift_rate_deg_per_hour * hours;
                let lat = seed_lat;
                let phase = (idx as f64) * 0.3 + hours * 0.25;
                let pressure = (seed_pressure - oscillation_amplitude_hpa * phase.sin()).max(1.0);
                vertices.push(TrajectoryVertex { lon, lat, pressure });
            }
        }

        let trajectories = Trajectories {
            vertices,
            times_seconds,
            aux_variables: Vec::new(),
            aux_variable_names: Vec::new(),
            num_trajectories,
            timesteps_per_trajectory,
            start_time_unix: init_time,
            generating_request: filtered.clone(),
        };

        let item = DataItem::Trajectories(trajectories);
        let size_kb = wxvis_core::item::CacheSized::size_kb(&item);
        self.core.cache().store(self.core.id(), &filtered, item, size_kb)?;
        Ok(())
    }
}

impl DataSource for PrecomputedTrajectorySource {
    fn source_id(&self) -> &str {
        self.core.id()
    }

    fn locally_required_keys(&self) -> &'static [&'static str] {
        OWN_KEYS
    }

    fn get_data(&self, request: &Request) -> Result<Arc<DataItem>, PipelineError> {
        let filtered = SourceCore::filter(request, OWN_KEYS);
        self.core.get_data(&filtered, self.self_handle())
    }

    fn core(&self) -> &SourceCore {
        &self.core
    }
}

impl TaskSource for PrecomputedTrajectorySource {
    fn source_id(&self) -> &str {
        self.core.id()
    }

    fn process_request(&self, request: &Request) -> Result<(), PipelineError> {
        self.produce_and_store(request)
    }

    fn acquire_additional_reference(&self, request: &Request) {
        self.core.acquire_additional_reference(request);
    }

    fn notify_completion(&self, request: &Request) {
        self.core.notify_completion(request);
    }
}

#[cfg(test)]
mod tests {
    use wxvis_cache::new_host_cache;
    use wxvis_scheduler::Scheduler;

    use super::*;

    fn seed_request() -> Request {
        Request::new()
            .with(LINE_TYPE, "STREAMLINE")
            .with(INIT_TIME, "0")
            .with(END_TIME, "7200")
            .with(STREAMLINE_DELTA_S, "3600")
            .with(SEED_MIN_POSITION, "0/0/900")
            .with(SEED_MAX_POSITION, "1/1/900")
            .with(SEED_STEP_SIZE_LON_LAT, "1/1")
            .with(SEED_PRESSURE_LEVELS, "900")
    }

    #[test]
    fn produces_a_trajectory_per_seed_point_with_matching_timestep_count() {
        let cache = new_host_cache("host", 1 << 20);
        let scheduler = Scheduler::new(2);
        let source = PrecomputedTrajectorySource::new("traj", cache, scheduler);

        let request = seed_request();
        let item = source.get_data(&request).unwrap();
        let trajectories = item.as_trajectories().unwrap();

        // 2x2 seed grid (lon in {0,1}, lat in {0,1}) at one pressure level.
        assert_eq!(trajectories.num_trajectories, 4);
        assert_eq!(trajectories.timesteps_per_trajectory, 3);
        assert_eq!(trajectories.vertices.len(), 12);
        assert_eq!(trajectories.start_indices(), vec![0, 3, 6, 9]);
        source.release_data(&request);
    }

    #[test]
    fn rejects_a_non_positive_step_size() {
        let cache = new_host_cache("host", 1 << 20);
        let scheduler = Scheduler::new(2);
        let source = PrecomputedTrajectorySource::new("traj", cache, scheduler);

        let request = seed_request().with(SEED_STEP_SIZE_LON_LAT, "0/1");
        assert!(source.get_data(&request).is_err());
    }
}
