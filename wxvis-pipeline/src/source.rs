//! The `DataSource` contract and the plumbing every concrete source shares:
//! cache-first lookup, in-flight deduplication via `wxvis-scheduler`, and
//! completion fan-out (spec.md §4.2 "DataSource contract", grounded on
//! `scheduleddatasource.cpp`'s `MScheduledDataSource::requestData()`).
//!
//! A note on dependency ordering: the original implementation precomputes
//! an explicit `MTask` parent chain before scheduling a single root task, so
//! that by the time a task's `produceData()` runs every upstream request is
//! already guaranteed cached. Here, a source's `process_request` instead
//! calls its upstream sources' `get_data` directly; since `get_data` itself
//! schedules-and-blocks on a cache miss, the dependency ordering falls out
//! of the call graph rather than an explicit parent list. This only
//! requires the scheduler's worker pool to have more threads than the
//! deepest nesting of sources in active use -- true for every pipeline this
//! crate builds.

use std::sync::Arc;

use crossbeam_channel::{bounded, Sender};
use fxhash::FxHashMap;
use parking_lot::Mutex;

use wxvis_cache::HostCache;
use wxvis_core::error::PipelineError;
use wxvis_core::item::DataItem;
use wxvis_core::request::Request;
use wxvis_scheduler::{Scheduler, Task, TaskSource};

/// Public entry point implemented by every concrete source.
pub trait DataSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// The keys this source actually reads; every other key is stripped
    /// before the request is used as a cache or dedup key (spec.md
    /// invariant: "a source never stores an item under a key that contains
    /// keys it does not itself consume").
    fn locally_required_keys(&self) -> &'static [&'static str];

    /// Blocking: returns a reference-counted item for `request`, producing
    /// it first if necessary. The caller owns one reference and must
    /// eventually call `release_data`.
    fn get_data(&self, request: &Request) -> Result<Arc<DataItem>, PipelineError>;

    fn release_data(&self, request: &Request) {
        self.core().release(request);
    }

    #[doc(hidden)]
    fn core(&self) -> &SourceCore;
}

/// Shared machinery backing every [`DataSource`] implementation in this
/// crate. Not itself a `DataSource` -- concrete sources hold one and
/// delegate to it.
pub struct SourceCore {
    id: String,
    cache: Arc<HostCache>,
    scheduler: Arc<Scheduler>,
    waiters: Mutex<FxHashMap<String, Vec<Sender<()>>>>,
}

impl SourceCore {
    pub fn new(id: impl Into<String>, cache: Arc<HostCache>, scheduler: Arc<Scheduler>) -> Self {
        SourceCore {
            id: id.into(),
            cache,
            scheduler,
            waiters: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cache(&self) -> &Arc<HostCache> {
        &self.cache
    }

    fn key(&self, request: &Request) -> String {
        format!("{}/{}", self.id, request.to_canonical_string())
    }

    /// Filters `request` down to `locally_required_keys` -- callers should
    /// always look up and store by the filtered form.
    pub fn filter(request: &Request, keep: &'static [&'static str]) -> Request {
        let mut filtered = request.clone();
        let keep: std::collections::BTreeSet<&str> = keep.iter().copied().collect();
        filtered.remove_all_keys_except(&keep);
        filtered
    }

    /// Cache-first, schedule-and-block otherwise. `task_source` is the
    /// `Arc<dyn TaskSource>` (typically the concrete source itself, wrapped)
    /// whose `process_request` will run `request` to completion.
    pub fn get_data(
        &self,
        request: &Request,
        task_source: Arc<dyn TaskSource>,
    ) -> Result<Arc<DataItem>, PipelineError> {
        if let Some(item) = self.cache.get(&self.id, request) {
            return Ok(item);
        }

        let key = self.key(request);
        let (tx, rx) = bounded(1);
        let joined_existing = self.scheduler.add_reservation(&self.id, request);
        self.waiters.lock().entry(key.clone()).or_default().push(tx);

        if !joined_existing {
            // Re-check the cache: another thread may have stored the result
            // between our first lookup and taking the dedup lock.
            if let Some(item) = self.cache.get(&self.id, request) {
                self.waiters.lock().remove(&key);
                return Ok(item);
            }
            let task = Task::new(task_source, request.clone(), vec![]);
            self.scheduler.schedule_task_graph(task);
        }

        rx.recv().map_err(|_| {
            PipelineError::Initialization(format!("scheduler dropped listener for {}", key))
        })?;

        // The reference this caller owns was already established before we
        // got here -- the producer's implicit store-time reference if we
        // created the task, or our own reservation-time reference (acquired
        // via `contains` in `acquire_additional_reference`) if we joined an
        // in-flight one. `peek` hands back the item without acquiring a
        // second reference neither of those paths accounted for.
        self.cache.peek(&self.id, request).ok_or_else(|| {
            PipelineError::Value(format!("production of {} completed without a result", key))
        })
    }

    pub fn release(&self, request: &Request) {
        if let Err(err) = self.cache.release(&self.id, request) {
            log::warn!(target: "wxvis_pipeline", "release_data({}): {}", request, err);
        }
    }

    /// Called from a `TaskSource::notify_completion` implementation: wakes
    /// every caller blocked on `request`.
    pub fn notify_completion(&self, request: &Request) {
        let key = self.key(request);
        if let Some(senders) = self.waiters.lock().remove(&key) {
            for tx in senders {
                let _ = tx.send(());
            }
        }
    }

    /// Called from a `TaskSource::acquire_additional_reference` -- a
    /// concurrent caller deduplicated onto this task, so its result needs
    /// one more reference held until that caller gets a chance to read it.
    pub fn acquire_additional_reference(&self, request: &Request) {
        if !self.cache.contains(&self.id, request) {
            log::warn!(
                target: "wxvis_pipeline",
                "acquire_additional_reference({}/{}): not in cache after production",
                self.id,
                request
            );
        }
    }
}
