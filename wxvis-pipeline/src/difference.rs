//! Difference of two named upstream requests (spec.md §4.3 "Difference"),
//! grounded on `differencedatasource.cpp`.

use std::sync::{Arc, Weak};

use wxvis_cache::HostCache;
use wxvis_core::error::PipelineError;
use wxvis_core::item::{CacheSized, DataItem, StructuredGrid};
use wxvis_core::keys::{
    INIT_TIME, LEVELTYPE, MEMBER, REQUESTED_INIT_TIME_FROM_VALID_TIME_OF_DAY, VALID_TIME, VARIABLE,
};
use wxvis_core::request::Request;
use wxvis_scheduler::{Scheduler, TaskSource};

use crate::source::{DataSource, SourceCore};

const OWN_KEYS: &[&str] = &[LEVELTYPE, VARIABLE, INIT_TIME, VALID_TIME, MEMBER];

/// Prefix recognized in a base-request template value: the downstream
/// request's value for the key named after the prefix is substituted in.
const PLACEHOLDER_PREFIX: &str = "REQUESTED_";

const SECONDS_PER_DAY: i64 = 86_400;

/// `input0(i,j,k) - interpolate(input1, lon_i, lat_j, pressure_i,j,k)`, with
/// missing-value propagation from either operand.
pub struct DifferenceSource {
    core: SourceCore,
    inputs: [Arc<dyn DataSource>; 2],
    base_requests: [Request; 2],
    self_weak: Weak<DifferenceSource>,
}

impl DifferenceSource {
    pub fn new(
        id: impl Into<String>,
        cache: Arc<HostCache>,
        scheduler: Arc<Scheduler>,
        inputs: [Arc<dyn DataSource>; 2],
        base_requests: [Request; 2],
    ) -> Arc<Self> {
        let id = id.into();
        Arc::new_cyclic(|weak| DifferenceSource {
            core: SourceCore::new(id, cache, scheduler),
            inputs,
            base_requests,
            self_weak: weak.clone(),
        })
    }

    fn self_handle(&self) -> Arc<dyn TaskSource> {
        self.self_weak.upgrade().expect("source dropped while request in flight")
    }

    /// Resolves `base_requests[id]`'s template placeholders against the
    /// downstream `request` to build the request sent to `inputs[id]`.
    fn input_request(&self, id: usize, request: &Request) -> Result<Request, PipelineError> {
        let mut resolved = self.base_requests[id].clone();
        let pairs: Vec<(String, String)> = resolved.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();

        for (key, value) in pairs {
            if value == REQUESTED_INIT_TIME_FROM_VALID_TIME_OF_DAY {
                // Combine the downstream request's INIT_TIME date with its
                // VALID_TIME time-of-day -- used for forecast-bias inputs
                // (subtract an analysis average from a lead-time average).
                let init = request.get_timestamp(INIT_TIME)?;
                let valid = request.get_timestamp(VALID_TIME)?;
                let combined = (init / SECONDS_PER_DAY) * SECONDS_PER_DAY + valid.rem_euclid(SECONDS_PER_DAY);
                resolved.insert(key, combined.to_string());
            } else if let Some(source_key) = value.strip_prefix(PLACEHOLDER_PREFIX) {
                let actual = request
                    .get(source_key)
                    .ok_or_else(|| PipelineError::Key(format!("downstream request missing {}", source_key)))?;
                resolved.insert(key, actual.to_string());
            }
        }
        Ok(resolved)
    }

    fn produce_and_store(&self, request: &Request) -> Result<(), PipelineError> {
        let filtered = SourceCore::filter(request, OWN_KEYS);
        let req0 = self.input_request(0, &filtered)?;
        let req1 = self.input_request(1, &filtered)?;

        let item0 = self.inputs[0].get_data(&req0)?;
        let grid0 = item0
            .as_structured_grid()
            .ok_or_else(|| PipelineError::Value("difference input 0 is not a grid".to_string()))?;
        let item1 = self.inputs[1].get_data(&req1)?;
        let grid1 = item1
            .as_structured_grid()
            .ok_or_else(|| PipelineError::Value("difference input 1 is not a grid".to_string()))?;

        let mut result = StructuredGrid {
            nlon: grid0.nlon,
            nlat: grid0.nlat,
            nlev: grid0.nlev,
            data: vec![grid0.missing_value; grid0.data.len()],
            lons: grid0.lons.clone(),
            lats: grid0.lats.clone(),
            levels: grid0.levels.clone(),
            level_type: grid0.level_type,
            missing_value: grid0.missing_value,
            generating_request: filtered.clone(),
            contributing_members: None,
            companion: None,
        };

        for lev in 0..result.nlev {
            for lat in 0..result.nlat {
                for lon in 0..result.nlon {
                    let idx = result.index(lev, lat, lon);
                    let v0 = grid0.data[idx];
                    if grid0.is_missing(v0) {
                        continue;
                    }
                    let pressure = grid0.levels.get(lev).copied().unwrap_or(0.0);
                    match grid1.interpolate(result.lons[lon], result.lats[lat], pressure) {
                        Some(v1) => result.data[idx] = v0 - v1,
                        None => result.data[idx] = result.missing_value,
                    }
                }
            }
        }

        self.inputs[0].release_data(&req0);
        self.inputs[1].release_data(&req1);

        let item = DataItem::StructuredGrid(result);
        let size_kb = item.size_kb();
        self.core.cache().store(self.core.id(), &filtered, item, size_kb)?;
        Ok(())
    }
}

impl DataSource for DifferenceSource {
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

impl TaskSource for DifferenceSource {
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
