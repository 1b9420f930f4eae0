//! A pass-through wrapper (spec.md §4.2 "Pass-through"): lets a generic
//! filter sit in front of any source without hard-coupling. If the incoming
//! request lacks the keys `inner` would need to produce locally, the request
//! is forwarded downstream unchanged and the downstream's item is returned
//! directly -- the completion the caller observes carries the original
//! request, since `inner` never schedules a task of its own for it.

use std::sync::Arc;

use wxvis_core::error::PipelineError;
use wxvis_core::item::DataItem;
use wxvis_core::request::Request;

use crate::source::{DataSource, SourceCore};

pub struct PassThroughFilter<S> {
    inner: S,
    downstream: Arc<dyn DataSource>,
}

impl<S: DataSource> PassThroughFilter<S> {
    pub fn new(inner: S, downstream: Arc<dyn DataSource>) -> Self {
        PassThroughFilter { inner, downstream }
    }

    fn has_required_keys(&self, request: &Request) -> bool {
        self.inner.locally_required_keys().iter().all(|key| request.contains_key(key))
    }
}

impl<S: DataSource> DataSource for PassThroughFilter<S> {
    fn source_id(&self) -> &str {
        self.inner.source_id()
    }

    fn locally_required_keys(&self) -> &'static [&'static str] {
        self.inner.locally_required_keys()
    }

    fn get_data(&self, request: &Request) -> Result<Arc<DataItem>, PipelineError> {
        if self.has_required_keys(request) {
            self.inner.get_data(request)
        } else {
            self.downstream.get_data(request)
        }
    }

    fn release_data(&self, request: &Request) {
        if self.has_required_keys(request) {
            self.inner.release_data(request)
        } else {
            self.downstream.release_data(request)
        }
    }

    fn core(&self) -> &SourceCore {
        self.inner.core()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use wxvis_cache::new_host_cache;
    use wxvis_core::item::{LevelType, StructuredGrid, MISSING_VALUE};
    use wxvis_core::keys::{INIT_TIME, LEVELTYPE, MEMBER, VALID_TIME, VARIABLE};
    use wxvis_scheduler::Scheduler;

    use super::*;
    use crate::reader::StaticGridSource;

    fn fixture_grid(request: &Request) -> StructuredGrid {
        StructuredGrid {
            nlon: 1,
            nlat: 1,
            nlev: 1,
            data: vec![1.0],
            lons: vec![0.0],
            lats: vec![0.0],
            levels: vec![1000.0],
            level_type: LevelType::Pressure,
            missing_value: MISSING_VALUE,
            generating_request: request.clone(),
            contributing_members: None,
            companion: None,
        }
    }

    // A fake "filter" source whose locally-required keys are never present
    // in practice, forcing every request through the downstream path.
    struct NeverApplicableFilter {
        core: SourceCore,
    }

    impl DataSource for NeverApplicableFilter {
        fn source_id(&self) -> &str {
            self.core.id()
        }

        fn locally_required_keys(&self) -> &'static [&'static str] {
            &["FILTER_ONLY_KEY_THAT_NEVER_APPEARS"]
        }

        fn get_data(&self, _request: &Request) -> Result<Arc<DataItem>, PipelineError> {
            panic!("should never be reached when the required key is absent");
        }

        fn core(&self) -> &SourceCore {
            &self.core
        }
    }

    #[test]
    fn forwards_to_downstream_when_local_keys_are_missing() {
        let cache = new_host_cache("host", 1 << 20);
        let scheduler = Scheduler::new(2);
        let reader = StaticGridSource::new("reader", cache.clone(), scheduler.clone());

        let request = Request::new()
            .with(VARIABLE, "T")
            .with(LEVELTYPE, "PRESSURE")
            .with(INIT_TIME, "0")
            .with(VALID_TIME, "0")
            .with(MEMBER, "0");
        reader.register(&request, fixture_grid(&request));

        let filter = NeverApplicableFilter { core: SourceCore::new("filter", cache, scheduler) };
        let wrapped = PassThroughFilter::new(filter, reader.clone());

        let item = wrapped.get_data(&request).unwrap();
        assert!(item.as_structured_grid().is_some());
        wrapped.release_data(&request);
    }
}
