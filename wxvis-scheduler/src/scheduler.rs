//! The worker pool and in-flight task registry (spec.md §4.6 "Scheduler"),
//! grounded on `scheduleddatasource.cpp`'s scheduling loop: leaves of a task
//! graph are handed to worker threads immediately, and a task's children are
//! only enqueued once every parent has finished.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::task::{Phase, ReservationOutcome, Task};

fn in_flight_key(source_id: &str, request: &wxvis_core::request::Request) -> String {
    format!("{}/{}", source_id, request.to_canonical_string())
}

struct SchedulerInner {
    in_flight: Mutex<FxHashMap<String, Arc<Task>>>,
    work_tx: Sender<Arc<Task>>,
}

/// Owns a fixed pool of worker threads and dispatches task graphs to them,
/// deduplicating identical in-flight requests.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(num_workers: usize) -> Arc<Scheduler> {
        let (work_tx, work_rx): (Sender<Arc<Task>>, Receiver<Arc<Task>>) = unbounded();
        let inner = Arc::new(SchedulerInner {
            in_flight: Mutex::new(FxHashMap::default()),
            work_tx,
        });

        let mut workers = Vec::with_capacity(num_workers);
        for id in 0..num_workers.max(1) {
            let rx = work_rx.clone();
            let inner = inner.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("wxvis-worker-{}", id))
                    .spawn(move || worker_loop(id, rx, inner))
                    .expect("failed to spawn worker thread"),
            );
        }

        Arc::new(Scheduler { inner, workers })
    }

    /// Looks up an in-flight task by source and request, for callers that
    /// want to register an additional reservation rather than building a
    /// fresh task graph.
    pub fn is_scheduled(
        &self,
        source_id: &str,
        request: &wxvis_core::request::Request,
    ) -> Option<Arc<Task>> {
        let key = in_flight_key(source_id, request);
        self.inner.in_flight.lock().get(&key).cloned()
    }

    /// Tries to register an additional reservation on an already in-flight
    /// task. Returns `false` if the task isn't tracked, or finished before
    /// the reservation could be registered -- either way, the caller should
    /// fall back to a direct cache lookup.
    pub fn add_reservation(&self, source_id: &str, request: &wxvis_core::request::Request) -> bool {
        match self.is_scheduled(source_id, request) {
            Some(task) => task.add_reservation() == ReservationOutcome::Registered,
            None => false,
        }
    }

    /// Registers every node of a task graph (root plus transitive parents)
    /// that isn't already in flight, then enqueues every node with no
    /// unfinished parents.
    pub fn schedule_task_graph(&self, root: Arc<Task>) {
        let mut stack = vec![root];
        let mut seen = FxHashMap::default();

        while let Some(task) = stack.pop() {
            let key = in_flight_key(task.source_id(), task.request());
            if seen.contains_key(&key) {
                continue;
            }
            seen.insert(key.clone(), ());

            let already_tracked = {
                let mut in_flight = self.inner.in_flight.lock();
                if in_flight.contains_key(&key) {
                    true
                } else {
                    in_flight.insert(key.clone(), task.clone());
                    false
                }
            };
            if already_tracked {
                continue;
            }

            let ready = {
                let st = task.state.lock();
                matches!(st.phase, Phase::Ready)
            };
            if ready {
                self.inner
                    .work_tx
                    .send(task.clone())
                    .expect("scheduler worker channel closed");
            }

            for parent in &task.parents {
                stack.push(parent.clone());
            }
        }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }
}

fn worker_loop(id: usize, rx: Receiver<Arc<Task>>, inner: Arc<SchedulerInner>) {
    log::debug!(target: "wxvis_scheduler", "worker {} started", id);
    while let Ok(task) = rx.recv() {
        execute(&task, &inner);
    }
    log::debug!(target: "wxvis_scheduler", "worker {} shut down", id);
}

fn execute(task: &Arc<Task>, inner: &Arc<SchedulerInner>) {
    {
        let mut st = task.state.lock();
        st.phase = Phase::Executing;
    }

    let key = in_flight_key(task.source_id(), task.request());
    log::trace!(target: "wxvis_scheduler", "executing {}", key);
    let result = task.source.process_request(task.request());

    let (extra_reservations, children, failed) = {
        let mut st = task.state.lock();
        st.failed = result.is_err();
        st.phase = Phase::Done;
        (st.reservations, std::mem::take(&mut st.children), st.failed)
    };

    inner.in_flight.lock().remove(&key);

    match result {
        Ok(()) => {
            for _ in 0..extra_reservations {
                task.source.acquire_additional_reference(task.request());
            }
        }
        Err(err) => {
            log::warn!(target: "wxvis_scheduler", "task {} failed: {}", key, err);
        }
    }
    // Notify unconditionally, success or failure -- callers blocked in
    // `SourceCore::get_data` are waiting on this signal alone, and a failed
    // production must still wake them (they observe the failure as a cache
    // miss once woken, since nothing was stored).
    task.source.notify_completion(task.request());

    if failed {
        return;
    }

    for child in children {
        let ready = {
            let mut st = child.state.lock();
            st.remaining_parents = st.remaining_parents.saturating_sub(1);
            if st.remaining_parents == 0 && matches!(st.phase, Phase::Pending) {
                st.phase = Phase::Ready;
                true
            } else {
                false
            }
        };
        if ready {
            inner
                .work_tx
                .send(child)
                .expect("scheduler worker channel closed");
        }
    }
}
