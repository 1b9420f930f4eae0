mod task;
pub use task::{ReservationOutcome, Task, TaskSource};

mod scheduler;
pub use scheduler::Scheduler;

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use wxvis_core::error::PipelineError;
    use wxvis_core::request::Request;

    use super::*;

    struct RecordingSource {
        id: String,
        run_count: AtomicUsize,
        extra_refs: AtomicUsize,
        completions: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingSource {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(RecordingSource {
                id: id.to_string(),
                run_count: AtomicUsize::new(0),
                extra_refs: AtomicUsize::new(0),
                completions: Mutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing(id: &str) -> Arc<Self> {
            Arc::new(RecordingSource {
                id: id.to_string(),
                run_count: AtomicUsize::new(0),
                extra_refs: AtomicUsize::new(0),
                completions: Mutex::new(Vec::new()),
                fail: true,
            })
        }
    }

    impl TaskSource for RecordingSource {
        fn source_id(&self) -> &str {
            &self.id
        }

        fn process_request(&self, _request: &Request) -> Result<(), PipelineError> {
            self.run_count.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(PipelineError::Value("synthetic failure".to_string()))
            } else {
                Ok(())
            }
        }

        fn acquire_additional_reference(&self, _request: &Request) {
            self.extra_refs.fetch_add(1, Ordering::SeqCst);
        }

        fn notify_completion(&self, request: &Request) {
            self.completions
                .lock()
                .unwrap()
                .push(request.to_canonical_string());
        }
    }

    fn wait_until<F: Fn() -> bool>(f: F) {
        for _ in 0..200 {
            if f() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition never became true");
    }

    #[test]
    fn single_task_runs_and_notifies() {
        let scheduler = Scheduler::new(2);
        let source = RecordingSource::new("leaf");
        let req = Request::new().with("VARIABLE", "T");
        let task = Task::new(source.clone(), req.clone(), vec![]);
        scheduler.schedule_task_graph(task);

        wait_until(|| source.run_count.load(Ordering::SeqCst) == 1);
        wait_until(|| !source.completions.lock().unwrap().is_empty());
        assert_eq!(
            source.completions.lock().unwrap()[0],
            req.to_canonical_string()
        );
    }

    #[test]
    fn parent_runs_before_child() {
        let scheduler = Scheduler::new(2);
        let parent_source = RecordingSource::new("parent");
        let child_source = RecordingSource::new("child");

        let parent_req = Request::new().with("VARIABLE", "T");
        let child_req = Request::new().with("VARIABLE", "DERIVED_T");

        let parent = Task::new(parent_source.clone(), parent_req, vec![]);
        let child = Task::new(child_source.clone(), child_req, vec![parent]);

        scheduler.schedule_task_graph(child);

        wait_until(|| child_source.run_count.load(Ordering::SeqCst) == 1);
        assert_eq!(parent_source.run_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_request_dedups_onto_the_in_flight_task() {
        let scheduler = Scheduler::new(1);
        let source = RecordingSource::new("leaf");
        let req = Request::new().with("VARIABLE", "T");

        let task = Task::new(source.clone(), req.clone(), vec![]);
        scheduler.schedule_task_graph(task);

        // Racing with the single worker thread, try to find the task still
        // in flight and register a reservation on it instead of scheduling a
        // second one.
        let mut registered = false;
        for _ in 0..50 {
            if scheduler.add_reservation(source.source_id(), &req) {
                registered = true;
                break;
            }
            if source.run_count.load(Ordering::SeqCst) > 0 {
                break;
            }
        }

        wait_until(|| source.run_count.load(Ordering::SeqCst) >= 1);
        // The task never re-ran even if a duplicate request arrived while it
        // was executing.
        assert_eq!(source.run_count.load(Ordering::SeqCst), 1);
        if registered {
            wait_until(|| source.extra_refs.load(Ordering::SeqCst) == 1);
        }
    }

    #[test]
    fn failed_task_does_not_run_its_children() {
        let scheduler = Scheduler::new(2);
        let parent_source = RecordingSource::failing("parent");
        let child_source = RecordingSource::new("child");

        let parent = Task::new(
            parent_source.clone(),
            Request::new().with("VARIABLE", "T"),
            vec![],
        );
        let child = Task::new(
            child_source.clone(),
            Request::new().with("VARIABLE", "DERIVED_T"),
            vec![parent],
        );
        scheduler.schedule_task_graph(child);

        wait_until(|| parent_source.run_count.load(Ordering::SeqCst) == 1);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(child_source.run_count.load(Ordering::SeqCst), 0);
    }
}
