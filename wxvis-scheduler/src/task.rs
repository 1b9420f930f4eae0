//! Task graph nodes (spec.md §4.6 "Scheduler"), grounded on
//! `scheduleddatasource.cpp`'s `MTask` and the reservation bookkeeping in
//! `MScheduledDataSource::requestData()`.

use std::sync::Arc;

use parking_lot::Mutex;

use wxvis_core::error::PipelineError;
use wxvis_core::request::Request;

/// The minimal interface the scheduler needs from a data source to execute
/// a task on a worker thread. Implemented by `wxvis-pipeline`'s
/// `ScheduledDataSourceBase`; the scheduler itself is oblivious to what a
/// request produces.
pub trait TaskSource: Send + Sync {
    /// A stable identifier used to namespace dedup keys; typically the
    /// source's name.
    fn source_id(&self) -> &str;

    /// Runs the computation for `request` and stores its result into this
    /// source's own cache. Called on a worker thread with all of `request`'s
    /// task-graph parents already executed (and therefore cached).
    fn process_request(&self, request: &Request) -> Result<(), PipelineError>;

    /// Called once after a successful `process_request`, once for each
    /// reservation registered on this task beyond the first (i.e. once per
    /// concurrent caller who deduplicated onto this task while it was still
    /// executing). Implementations acquire an additional cache reference per
    /// call so the result isn't evicted before every interested caller has
    /// had a chance to `get` it.
    fn acquire_additional_reference(&self, request: &Request);

    /// Invoked after `process_request` succeeds (and any additional
    /// references have been acquired). Implementations fan this out to
    /// whatever listeners registered interest in `request`.
    fn notify_completion(&self, request: &Request);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Waiting on one or more parents to finish.
    Pending,
    /// No unfinished parents; sitting in (or about to enter) the work queue.
    Ready,
    /// Currently running on a worker thread.
    Executing,
    /// Finished (successfully or not); no further reservations accepted.
    Done,
}

pub(crate) struct TaskState {
    pub(crate) phase: Phase,
    /// Reservations registered by callers who deduplicated onto this task
    /// after it was created, beyond the creator's own implicit reference.
    pub(crate) reservations: u32,
    pub(crate) remaining_parents: usize,
    pub(crate) children: Vec<Arc<Task>>,
    pub(crate) failed: bool,
}

/// A single node in a task graph: the work needed to satisfy one data
/// request, plus whatever upstream requests it depends on.
pub struct Task {
    pub(crate) source: Arc<dyn TaskSource>,
    pub(crate) request: Request,
    pub(crate) parents: Vec<Arc<Task>>,
    pub(crate) state: Mutex<TaskState>,
}

/// Outcome of registering an additional reservation on a task found already
/// in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationOutcome {
    /// The reservation was recorded; the task's executor will call
    /// `acquire_additional_reference` on the caller's behalf once it
    /// finishes.
    Registered,
    /// The task had already finished (or failed) by the time the caller
    /// tried to register; the caller must fall back to a direct cache `get`.
    TooLate,
}

impl Task {
    /// Builds a new task. `parents` are sibling tasks (typically returned by
    /// an earlier call into the same or a different source's task-graph
    /// builder) this task's production depends on.
    pub fn new(source: Arc<dyn TaskSource>, request: Request, parents: Vec<Arc<Task>>) -> Arc<Task> {
        let remaining_parents = parents
            .iter()
            .filter(|p| !matches!(p.state.lock().phase, Phase::Done))
            .count();
        let phase = if remaining_parents == 0 { Phase::Ready } else { Phase::Pending };

        let task = Arc::new(Task {
            source,
            request,
            parents: parents.clone(),
            state: Mutex::new(TaskState {
                phase,
                reservations: 0,
                remaining_parents,
                children: Vec::new(),
                failed: false,
            }),
        });

        for parent in &parents {
            let mut st = parent.state.lock();
            if !matches!(st.phase, Phase::Done) {
                st.children.push(task.clone());
            }
        }

        task
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn source_id(&self) -> &str {
        self.source.source_id()
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state.lock().phase, Phase::Done)
    }

    /// Registers an additional reservation on this task, for a caller who
    /// discovered it already in flight (spec.md §4.6: "a duplicate request
    /// for an in-progress task registers an additional reservation rather
    /// than re-scheduling").
    pub(crate) fn add_reservation(self: &Arc<Self>) -> ReservationOutcome {
        let mut st = self.state.lock();
        if matches!(st.phase, Phase::Done) {
            ReservationOutcome::TooLate
        } else {
            st.reservations += 1;
            ReservationOutcome::Registered
        }
    }
}
