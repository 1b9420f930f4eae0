//! Facade crate wiring `wxvis-cache`, `wxvis-scheduler`, `wxvis-pipeline`,
//! and `wxvis-orchestrator` together (SPEC_FULL.md §2).
//!
//! spec.md §9 "Global mutable state" permits the two caches and the
//! scheduler to be process-wide singletons but doesn't require it; this
//! crate resolves that in favor of dependency injection via
//! [`PipelineContext`], constructed once by an application and handed to
//! every source it builds.

pub use wxvis_cache::{new_gpu_cache, new_host_cache, GpuCache, HostCache};
pub use wxvis_core::error::PipelineError;
pub use wxvis_core::item;
pub use wxvis_core::keys;
pub use wxvis_core::request::Request;
pub use wxvis_orchestrator::{ActorConfig, CompositeRequest, DrainedComposite, HeldState, SeedActorConfig, SubRequestRole, TrajectoryOrchestrator};
pub use wxvis_pipeline::{
    export_lagranto2, ConformanceOptions, DataSource, DifferenceSource, EnsembleFilterSource,
    PassThroughFilter, PrecomputedTrajectorySource, SourceCore, StaticGridSource,
};
pub use wxvis_scheduler::{Scheduler, Task, TaskSource};

use std::sync::Arc;

/// The shared state every pipeline source in a running application is
/// constructed against: the host cache, the GPU cache, and the worker-pool
/// scheduler. Passed explicitly to each source's constructor rather than
/// reached for as a global.
#[derive(Clone)]
pub struct PipelineContext {
    host_cache: Arc<HostCache>,
    gpu_cache: Arc<GpuCache>,
    scheduler: Arc<Scheduler>,
}

impl PipelineContext {
    /// Builds a context with the given byte budgets (KiB) and worker-pool
    /// size.
    pub fn new(host_limit_kb: u64, gpu_limit_kb: u64, num_workers: usize) -> Self {
        PipelineContext {
            host_cache: new_host_cache("host", host_limit_kb),
            gpu_cache: new_gpu_cache("gpu", gpu_limit_kb),
            scheduler: Scheduler::new(num_workers),
        }
    }

    pub fn host_cache(&self) -> &Arc<HostCache> {
        &self.host_cache
    }

    pub fn gpu_cache(&self) -> &Arc<GpuCache> {
        &self.gpu_cache
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Convenience constructor for a [`StaticGridSource`] fixture reader
    /// wired against this context.
    pub fn static_grid_source(&self, id: impl Into<String>) -> Arc<StaticGridSource> {
        StaticGridSource::new(id, self.host_cache.clone(), self.scheduler.clone())
    }

    /// Convenience constructor for an [`EnsembleFilterSource`] wired
    /// against this context and reading from `input`.
    pub fn ensemble_filter_source(
        &self,
        id: impl Into<String>,
        input: Arc<StaticGridSource>,
    ) -> Arc<EnsembleFilterSource> {
        EnsembleFilterSource::new(id, self.host_cache.clone(), self.scheduler.clone(), input)
    }

    /// Convenience constructor for a [`DifferenceSource`] wired against this
    /// context, combining two input readers under two base request
    /// templates.
    pub fn difference_source(
        &self,
        id: impl Into<String>,
        inputs: [Arc<dyn DataSource>; 2],
        base_requests: [Request; 2],
    ) -> Arc<DifferenceSource> {
        DifferenceSource::new(id, self.host_cache.clone(), self.scheduler.clone(), inputs, base_requests)
    }

    /// Convenience constructor for a [`PrecomputedTrajectorySource`] wired
    /// against this context.
    pub fn precomputed_trajectory_source(&self, id: impl Into<String>) -> Arc<PrecomputedTrajectorySource> {
        PrecomputedTrajectorySource::new(id, self.host_cache.clone(), self.scheduler.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wxvis_core::item::{LevelType, StructuredGrid, MISSING_VALUE};
    use wxvis_core::keys::{ENS_OPERATION, INIT_TIME, LEVELTYPE, MEMBER, SELECTED_MEMBERS, VALID_TIME, VARIABLE};

    fn fixture_grid(fill: f64, request: &Request) -> StructuredGrid {
        StructuredGrid {
            nlon: 2,
            nlat: 2,
            nlev: 1,
            data: vec![fill; 4],
            lons: vec![0.0, 1.0],
            lats: vec![0.0, 1.0],
            levels: vec![1000.0],
            level_type: LevelType::Pressure,
            missing_value: MISSING_VALUE,
            generating_request: request.clone(),
            contributing_members: None,
            companion: None,
        }
    }

    // Wires a full ensemble-mean pipeline through `PipelineContext` alone,
    // exercising the dependency-injection resolution of spec.md §9's
    // "global mutable state" open question end to end.
    #[test]
    fn pipeline_context_wires_a_runnable_ensemble_pipeline() {
        let ctx = PipelineContext::new(1 << 20, 1 << 20, 4);
        let reader = ctx.static_grid_source("reader");

        let base = Request::new()
            .with(VARIABLE, "T")
            .with(LEVELTYPE, "PRESSURE")
            .with(INIT_TIME, "0")
            .with(VALID_TIME, "10800");
        for (m, value) in [5.0, 5.0, 5.0].into_iter().enumerate() {
            let mut req = base.clone();
            req.insert(MEMBER, m.to_string());
            reader.register(&req, fixture_grid(value, &req));
        }

        let ensemble = ctx.ensemble_filter_source("ens", reader);
        let mut mean_req = base;
        mean_req.insert(SELECTED_MEMBERS, Request::encode_uint_set(&[0, 1, 2].into_iter().collect()));
        mean_req.insert(ENS_OPERATION, "MEAN");

        let item = ensemble.get_data(&mean_req).unwrap();
        let grid = item.as_structured_grid().unwrap();
        assert!(grid.data.iter().all(|&v| (v - 5.0).abs() < 1e-9));
        ensemble.release_data(&mean_req);
    }
}
