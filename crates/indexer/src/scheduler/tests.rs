#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use crate::config::SchedulerConfig;
    use crate::error::{ScheduleError, StageError};
    use crate::scheduler::runner::TaskScheduler;
    use crate::scheduler::task::{Stage, Task, TaskState};

    /// Fake task recording every hook and stage call. Behavior is shaped by
    /// the `cancel_at` / `fail_at` / `panic_at` knobs before Arc-wrapping.
    struct FakeTask {
        name: String,
        token: CancellationToken,
        state: Mutex<TaskState>,
        calls: Mutex<Vec<Stage>>,
        resets: AtomicUsize,
        admissions: AtomicUsize,
        /// Cancel the task's own token upon entering this stage.
        cancel_at: Option<Stage>,
        /// Return this error from the given stage.
        fail_at: Mutex<Option<(Stage, StageError)>>,
        /// Panic inside this stage.
        panic_at: Option<Stage>,
        reject_admission: bool,
        /// Shared completion log, appended to from `reset`.
        done_order: Option<Arc<Mutex<Vec<String>>>>,
    }

    impl FakeTask {
        fn base(name: &str) -> FakeTask {
            FakeTask {
                name: name.to_string(),
                token: CancellationToken::new(),
                state: Mutex::new(TaskState::None),
                calls: Mutex::new(Vec::new()),
                resets: AtomicUsize::new(0),
                admissions: AtomicUsize::new(0),
                cancel_at: None,
                fail_at: Mutex::new(None),
                panic_at: None,
                reject_admission: false,
                done_order: None,
            }
        }

        fn happy(name: &str) -> Arc<FakeTask> {
            Arc::new(Self::base(name))
        }

        fn cancelling_at(name: &str, stage: Stage) -> Arc<FakeTask> {
            let mut task = Self::base(name);
            task.cancel_at = Some(stage);
            Arc::new(task)
        }

        fn failing_at(name: &str, stage: Stage, err: StageError) -> Arc<FakeTask> {
            let task = Self::base(name);
            *task.fail_at.lock().unwrap() = Some((stage, err));
            Arc::new(task)
        }

        fn calls(&self) -> Vec<Stage> {
            self.calls.lock().unwrap().clone()
        }

        fn resets(&self) -> usize {
            self.resets.load(Ordering::SeqCst)
        }

        fn admissions(&self) -> usize {
            self.admissions.load(Ordering::SeqCst)
        }

        async fn stage_called(&self, stage: Stage) -> Result<(), StageError> {
            self.calls.lock().unwrap().push(stage);
            if self.cancel_at == Some(stage) {
                self.token.cancel();
            }
            if self.panic_at == Some(stage) {
                panic!("fake stage blew up");
            }
            let fail = {
                let mut guard = self.fail_at.lock().unwrap();
                match &*guard {
                    Some((at, _)) if *at == stage => guard.take().map(|(_, err)| err),
                    _ => None,
                }
            };
            match fail {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl Task for FakeTask {
        fn name(&self) -> &str {
            &self.name
        }

        fn cancel_token(&self) -> CancellationToken {
            self.token.clone()
        }

        fn state(&self) -> TaskState {
            *self.state.lock().unwrap()
        }

        fn set_state(&self, state: TaskState) {
            *self.state.lock().unwrap() = state;
        }

        async fn on_enqueue(&self) -> Result<(), StageError> {
            self.admissions.fetch_add(1, Ordering::SeqCst);
            if self.reject_admission {
                return Err(StageError::Transient("bookkeeping rejected".into()));
            }
            Ok(())
        }

        async fn prepare(&self, _ct: CancellationToken) -> Result<(), StageError> {
            self.stage_called(Stage::Prepare).await
        }

        async fn load_data(&self, _ct: CancellationToken) -> Result<(), StageError> {
            self.stage_called(Stage::LoadData).await
        }

        async fn build_index(&self, _ct: CancellationToken) -> Result<(), StageError> {
            self.stage_called(Stage::BuildIndex).await
        }

        async fn save_index_files(&self, _ct: CancellationToken) -> Result<(), StageError> {
            self.stage_called(Stage::SaveIndexFiles).await
        }

        async fn reset(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
            if let Some(log) = &self.done_order {
                log.lock().unwrap().push(self.name.clone());
            }
        }
    }

    fn new_scheduler(capacity: usize) -> TaskScheduler {
        let config = SchedulerConfig {
            queue_capacity: capacity,
            admission_timeout_ms: 200,
            workers: 1,
        };
        TaskScheduler::new(&CancellationToken::new(), config)
    }

    #[tokio::test]
    async fn finished_after_all_stages() {
        let sched = new_scheduler(16);
        sched.start();

        let task = FakeTask::happy("happy");
        sched.enqueue(task.clone()).await.unwrap();
        sched.close().await;

        assert_eq!(task.state(), TaskState::Finished);
        assert_eq!(task.calls(), Stage::ALL.to_vec());
        assert_eq!(task.admissions(), 1);
        assert_eq!(task.resets(), 1);
    }

    #[tokio::test]
    async fn abandoned_when_cancelled_between_stages() {
        let sched = new_scheduler(16);
        sched.start();

        let task = FakeTask::cancelling_at("cancelled", Stage::LoadData);
        sched.enqueue(task.clone()).await.unwrap();
        sched.close().await;

        assert_eq!(task.state(), TaskState::Abandoned);
        assert_eq!(task.calls(), vec![Stage::Prepare, Stage::LoadData]);
        assert_eq!(task.resets(), 1);
    }

    #[tokio::test]
    async fn abandoned_before_first_stage() {
        let sched = new_scheduler(16);
        sched.start();

        let task = FakeTask::happy("pre-cancelled");
        task.token.cancel();
        sched.enqueue(task.clone()).await.unwrap();
        sched.close().await;

        assert_eq!(task.state(), TaskState::Abandoned);
        assert!(task.calls().is_empty());
        assert_eq!(task.resets(), 1);
    }

    #[tokio::test]
    async fn failed_on_missing_input() {
        let sched = new_scheduler(16);
        sched.start();

        let task = FakeTask::failing_at(
            "no-input",
            Stage::LoadData,
            StageError::NoSuchKey("chunks/42".into()),
        );
        sched.enqueue(task.clone()).await.unwrap();
        sched.close().await;

        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(task.calls(), vec![Stage::Prepare, Stage::LoadData]);
    }

    #[tokio::test]
    async fn unissued_on_transient_error() {
        let sched = new_scheduler(16);
        sched.start();

        let task = FakeTask::failing_at(
            "flaky-save",
            Stage::SaveIndexFiles,
            StageError::Transient("auth failed".into()),
        );
        sched.enqueue(task.clone()).await.unwrap();
        sched.close().await;

        assert_eq!(task.state(), TaskState::Unissued);
        assert_eq!(task.calls(), Stage::ALL.to_vec());
    }

    #[tokio::test]
    async fn unissued_on_stage_panic() {
        let sched = new_scheduler(16);
        sched.start();

        let mut inner = FakeTask::base("panicky");
        inner.panic_at = Some(Stage::BuildIndex);
        let task = Arc::new(inner);
        sched.enqueue(task.clone()).await.unwrap();

        // The panic must not take the runner down.
        let next = FakeTask::happy("after-panic");
        sched.enqueue(next.clone()).await.unwrap();
        sched.close().await;

        assert_eq!(task.state(), TaskState::Unissued);
        assert_eq!(task.resets(), 1);
        assert_eq!(next.state(), TaskState::Finished);
    }

    #[tokio::test]
    async fn stage_error_beats_racing_cancellation() {
        let sched = new_scheduler(16);
        sched.start();

        // The stage both cancels the token and returns an error; the error
        // arrives first, so it wins.
        let mut inner = FakeTask::base("racing");
        inner.cancel_at = Some(Stage::LoadData);
        *inner.fail_at.lock().unwrap() = Some((Stage::LoadData, StageError::NoSuchKey("gone".into())));
        let task = Arc::new(inner);
        sched.enqueue(task.clone()).await.unwrap();
        sched.close().await;

        assert_eq!(task.state(), TaskState::Failed);
    }

    #[tokio::test]
    async fn queue_full_rejects_untouched() {
        let sched = new_scheduler(2);

        let t1 = FakeTask::happy("t1");
        let t2 = FakeTask::happy("t2");
        let t3 = FakeTask::happy("t3");
        sched.enqueue(t1.clone()).await.unwrap();
        sched.enqueue(t2.clone()).await.unwrap();

        let err = sched.enqueue(t3.clone()).await.unwrap_err();
        assert!(matches!(err, ScheduleError::QueueFull));
        assert_eq!(t3.state(), TaskState::None);
        assert_eq!(t3.admissions(), 0);
        assert_eq!(t3.resets(), 0);

        sched.start();
        sched.close().await;
        assert_eq!(t1.state(), TaskState::Finished);
        assert_eq!(t2.state(), TaskState::Finished);
        assert_eq!(t3.state(), TaskState::None);
        assert!(t3.calls().is_empty());
    }

    #[tokio::test]
    async fn admission_failure_releases_slot() {
        let sched = new_scheduler(1);

        let mut inner = FakeTask::base("rejected");
        inner.reject_admission = true;
        let rejected = Arc::new(inner);
        let err = sched.enqueue(rejected.clone()).await.unwrap_err();
        assert!(matches!(err, ScheduleError::Admission(_)));
        assert_eq!(rejected.admissions(), 1);

        // The single slot must be free again, as if no offer had been made.
        let accepted = FakeTask::happy("accepted");
        sched.enqueue(accepted.clone()).await.unwrap();

        sched.start();
        sched.close().await;
        assert_eq!(accepted.state(), TaskState::Finished);
        assert_eq!(rejected.state(), TaskState::None);
        assert_eq!(rejected.resets(), 0);
    }

    #[tokio::test]
    async fn enqueue_after_close_rejected() {
        let sched = new_scheduler(16);
        sched.start();
        sched.close().await;

        let task = FakeTask::happy("late");
        let err = sched.enqueue(task.clone()).await.unwrap_err();
        assert!(matches!(err, ScheduleError::SchedulerClosed));
        assert_eq!(task.admissions(), 0);
    }

    #[tokio::test]
    async fn start_twice_processes_once() {
        let sched = new_scheduler(16);
        sched.start();
        sched.start();

        let task = FakeTask::happy("once");
        sched.enqueue(task.clone()).await.unwrap();
        sched.close().await;

        assert_eq!(task.state(), TaskState::Finished);
        assert_eq!(task.resets(), 1);
        assert_eq!(task.calls(), Stage::ALL.to_vec());
    }

    #[tokio::test]
    async fn close_twice_returns_promptly() {
        let sched = new_scheduler(16);
        sched.start();
        sched.close().await;
        sched.close().await;
    }

    #[tokio::test]
    async fn tasks_complete_in_admission_order() {
        let sched = new_scheduler(16);
        sched.start();

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for name in ["a", "b", "c", "d"] {
            let mut inner = FakeTask::base(name);
            inner.done_order = Some(Arc::clone(&log));
            let task = Arc::new(inner);
            sched.enqueue(task.clone()).await.unwrap();
            tasks.push(task);
        }
        sched.close().await;

        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c", "d"]);
        for task in tasks {
            assert_eq!(task.state(), TaskState::Finished);
        }
    }

    #[tokio::test]
    async fn close_drains_all_admitted() {
        let sched = new_scheduler(32);
        sched.start();

        let mut tasks = Vec::new();
        for i in 0..10 {
            let task = FakeTask::happy(&format!("drain-{i}"));
            sched.enqueue(task.clone()).await.unwrap();
            tasks.push(task);
        }
        sched.close().await;

        for task in tasks {
            assert!(task.state().is_terminal());
            assert_eq!(task.state(), TaskState::Finished);
            assert_eq!(task.resets(), 1);
        }
        assert_eq!(sched.queue_depth(), 0);
    }

    #[tokio::test]
    async fn child_token_cancelled_after_close() {
        let root = CancellationToken::new();
        let sched = TaskScheduler::new(
            &root,
            SchedulerConfig {
                queue_capacity: 4,
                admission_timeout_ms: 200,
                workers: 1,
            },
        );
        let token = sched.cancel_token();
        sched.start();
        assert!(!token.is_cancelled());

        sched.close().await;
        assert!(token.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn metrics_track_outcomes() {
        let sched = new_scheduler(2);
        sched.enqueue(FakeTask::happy("m1")).await.unwrap();
        sched
            .enqueue(FakeTask::failing_at(
                "m2",
                Stage::Prepare,
                StageError::NoSuchKey("k".into()),
            ))
            .await
            .unwrap();
        let err = sched.enqueue(FakeTask::happy("m3")).await.unwrap_err();
        assert!(matches!(err, ScheduleError::QueueFull));

        sched.start();
        sched.close().await;

        let metrics = sched.metrics();
        assert_eq!(metrics.tasks_admitted, 2);
        assert_eq!(metrics.tasks_rejected, 1);
        assert_eq!(metrics.tasks_finished, 1);
        assert_eq!(metrics.tasks_failed, 1);
        assert_eq!(metrics.completed(), 2);
    }
}
