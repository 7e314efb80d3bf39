use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{ScheduleError, StageError};

use super::metrics::SchedulerMetrics;
use super::queue::TaskQueue;
use super::task::{Stage, Task, TaskRef, TaskState};

/// Process-wide admission counter, attached to admission log events.
static NEXT_ADMISSION_ID: AtomicU64 = AtomicU64::new(1);

/// Bounded task scheduler.
///
/// Accepts tasks under backpressure, drives each through the fixed stage
/// pipeline on background workers, and drains everything it accepted before
/// `close` returns. Safe for concurrent `enqueue` from many producers.
/// Completion order matches admission order only with the default single
/// worker.
pub struct TaskScheduler {
    queue: Arc<TaskQueue>,
    config: SchedulerConfig,
    /// Child of the caller's token; cancelled once the scheduler has closed.
    cancel: CancellationToken,
    metrics: Arc<RwLock<SchedulerMetrics>>,
    started: AtomicBool,
    closed: AtomicBool,
    /// Completion barrier: `close` joins these before cancelling.
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Create a scheduler whose cancellation token is a child of `parent`.
    pub fn new(parent: &CancellationToken, config: SchedulerConfig) -> Self {
        Self {
            queue: Arc::new(TaskQueue::new(config.queue_capacity)),
            cancel: parent.child_token(),
            metrics: Arc::new(RwLock::new(SchedulerMetrics::default())),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Token cancelled once the scheduler has fully closed. Per-task tokens
    /// are typically derived from it so one check covers both cancellation
    /// sources.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Snapshot of the operational counters.
    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics.read().unwrap().clone()
    }

    /// Admitted tasks not yet taken by a worker.
    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// Spawn the stage runners. Idempotent; a no-op after `close`.
    pub fn start(&self) {
        if self.closed.load(Ordering::SeqCst) {
            warn!("start called on a closed scheduler");
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let count = self.config.workers.max(1);
        let mut workers = self.workers.lock().unwrap();
        for idx in 0..count {
            let queue = Arc::clone(&self.queue);
            let metrics = Arc::clone(&self.metrics);
            workers.push(tokio::spawn(run_worker(idx, queue, metrics)));
        }
        info!(
            workers = count,
            capacity = self.queue.capacity(),
            "task scheduler started"
        );
    }

    /// Admit a task, waiting up to the configured admission timeout for
    /// queue space. On success the scheduler owns the task until it reaches
    /// a terminal state.
    pub async fn enqueue(&self, task: TaskRef) -> Result<(), ScheduleError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ScheduleError::SchedulerClosed);
        }

        let slot = match self.queue.reserve(self.config.admission_timeout()).await {
            Ok(slot) => slot,
            Err(err) => {
                if matches!(err, ScheduleError::QueueFull) {
                    self.metrics.write().unwrap().record_rejection();
                    warn!(task = %task.name(), "task rejected, queue full");
                }
                return Err(err);
            }
        };

        // The admission hook runs on the caller, with the slot held but not
        // committed: a failure leaves the queue as if no offer had been made.
        if let Err(err) = task.on_enqueue().await {
            warn!(task = %task.name(), error = %err, "admission hook rejected task");
            return Err(ScheduleError::Admission(err));
        }

        let admission_id = NEXT_ADMISSION_ID.fetch_add(1, Ordering::Relaxed);
        self.metrics.write().unwrap().record_admission();
        debug!(task = %task.name(), admission_id, "task admitted");
        slot.commit(task);
        Ok(())
    }

    /// Stop admission, wait for every admitted task to reach a terminal
    /// state, then cancel the child token. Idempotent; repeat calls return
    /// promptly.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("task scheduler closing");
        self.queue.close();

        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            if let Err(err) = handle.await {
                warn!(error = %err, "worker terminated abnormally");
            }
        }
        self.cancel.cancel();
        info!("task scheduler closed");
    }
}

/// Consume tasks until the queue is closed and drained.
async fn run_worker(idx: usize, queue: Arc<TaskQueue>, metrics: Arc<RwLock<SchedulerMetrics>>) {
    debug!(worker = idx, "stage runner started");
    while let Some(task) = queue.take().await {
        process_task(task, &metrics).await;
    }
    debug!(worker = idx, "task queue drained, stage runner exiting");
}

/// Drive one task through the stage pipeline to a terminal state.
async fn process_task(task: TaskRef, metrics: &RwLock<SchedulerMetrics>) {
    let started = Instant::now();
    let ct = task.cancel_token();
    task.set_state(TaskState::InProgress);

    let final_state = run_stages(task.as_ref(), &ct).await;

    task.set_state(final_state);
    metrics
        .write()
        .unwrap()
        .record_outcome(final_state, started.elapsed());
    task.reset().await;
}

/// Walk the stage pipeline, stopping at the first terminal event.
///
/// The decision is monotone: once a terminal state is picked, later signals
/// do not change it. A stage error that arrives before cancellation is
/// observed wins over cancellation.
async fn run_stages(task: &dyn Task, ct: &CancellationToken) -> TaskState {
    for stage in Stage::ALL {
        if ct.is_cancelled() {
            warn!(task = %task.name(), stage = stage.name(), "task cancelled, abandoning");
            return TaskState::Abandoned;
        }
        match run_stage(task, stage, ct.clone()).await {
            Ok(()) => {
                debug!(task = %task.name(), stage = stage.name(), "stage complete");
            }
            Err(err @ StageError::NoSuchKey(_)) => {
                warn!(task = %task.name(), stage = stage.name(), error = %err, "input missing, task failed");
                return TaskState::Failed;
            }
            Err(err) => {
                warn!(task = %task.name(), stage = stage.name(), error = %err, "stage failed, task returned for retry");
                return TaskState::Unissued;
            }
        }
    }
    info!(task = %task.name(), "task finished");
    TaskState::Finished
}

/// Run a single stage, converting a panic into a transient error so one
/// misbehaving task cannot take the runner down.
async fn run_stage(
    task: &dyn Task,
    stage: Stage,
    ct: CancellationToken,
) -> Result<(), StageError> {
    let fut = async {
        match stage {
            Stage::Prepare => task.prepare(ct).await,
            Stage::LoadData => task.load_data(ct).await,
            Stage::BuildIndex => task.build_index(ct).await,
            Stage::SaveIndexFiles => task.save_index_files(ct).await,
        }
    };
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(StageError::Panic(panic_message(panic))),
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
