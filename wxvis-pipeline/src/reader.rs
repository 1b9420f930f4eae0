//! A synthetic, in-memory grid source.
//!
//! Real NetCDF/GRIB file-format readers are out of scope (spec.md §1
//! Non-goals); this stands in for one at the bottom of a pipeline so that
//! `EnsembleFilterSource` and `DifferenceSource` have something to pull
//! from, both in this crate's tests and for callers assembling a demo
//! pipeline without a real reader plugged in.

use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use wxvis_cache::HostCache;
use wxvis_core::error::PipelineError;
use wxvis_core::item::{DataItem, StructuredGrid};
use wxvis_core::request::Request;
use wxvis_scheduler::Scheduler;

use crate::source::{DataSource, SourceCore};

/// Serves pre-registered grids by exact canonical request match. Producing
/// an unregistered request fails with [`PipelineError::Value`].
pub struct StaticGridSource {
    core: SourceCore,
    fixtures: Mutex<FxHashMap<String, StructuredGrid>>,
}

impl StaticGridSource {
    pub fn new(id: impl Into<String>, cache: Arc<HostCache>, scheduler: Arc<Scheduler>) -> Arc<Self> {
        Arc::new(StaticGridSource {
            core: SourceCore::new(id, cache, scheduler),
            fixtures: Mutex::new(FxHashMap::default()),
        })
    }

    /// Registers `grid` to be served for `request` (any keys outside this
    /// source's declared contract are ignored by callers, not by this
    /// registry -- callers should register under the exact canonical form
    /// an upstream request will take).
    pub fn register(&self, request: &Request, grid: StructuredGrid) {
        self.fixtures.lock().insert(request.to_canonical_string(), grid);
    }
}

impl DataSource for StaticGridSource {
    fn source_id(&self) -> &str {
        self.core.id()
    }

    fn locally_required_keys(&self) -> &'static [&'static str] {
        &[]
    }

    fn get_data(&self, request: &Request) -> Result<Arc<DataItem>, PipelineError> {
        if let Some(item) = self.core.cache().get(self.core.id(), request) {
            return Ok(item);
        }
        let grid = self
            .fixtures
            .lock()
            .get(&request.to_canonical_string())
            .map(|g| StructuredGrid {
                nlon: g.nlon,
                nlat: g.nlat,
                nlev: g.nlev,
                data: g.data.clone(),
                lons: g.lons.clone(),
                lats: g.lats.clone(),
                levels: g.levels.clone(),
                level_type: g.level_type,
                missing_value: g.missing_value,
                generating_request: request.clone(),
                contributing_members: None,
                companion: None,
            })
            .ok_or_else(|| PipelineError::Value(format!("no fixture registered for {}", request)))?;

        let item = DataItem::StructuredGrid(grid);
        let size_kb = wxvis_core::item::CacheSized::size_kb(&item);
        self.core.cache().store(self.core.id(), request, item, size_kb)
            .map(|(item, _)| item)
    }

    fn core(&self) -> &SourceCore {
        &self.core
    }
}

