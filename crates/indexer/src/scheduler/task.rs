use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::StageError;

/// Lifecycle state of a build task, observable by the control plane.
///
/// `Finished`, `Failed`, `Unissued`, and `Abandoned` are terminal and
/// absorbing. `Unissued` and `Abandoned` are retriable from the caller's
/// perspective; `Failed` is not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Not yet admitted.
    #[default]
    None,
    /// Admitted but not running; also the terminal state for tasks returned
    /// for retry after a transient stage error.
    Unissued,
    /// Picked up by a stage runner.
    InProgress,
    /// Every stage completed.
    Finished,
    /// A stage hit permanently missing input.
    Failed,
    /// Cancellation was observed before completion.
    Abandoned,
}

impl TaskState {
    /// Whether the task has left the pipeline for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Failed | TaskState::Unissued | TaskState::Abandoned
        )
    }
}

/// One step of the fixed build pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Prepare,
    LoadData,
    BuildIndex,
    SaveIndexFiles,
}

impl Stage {
    /// All stages, in the order the runner executes them.
    pub const ALL: [Stage; 4] = [
        Stage::Prepare,
        Stage::LoadData,
        Stage::BuildIndex,
        Stage::SaveIndexFiles,
    ];

    /// Stable name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Prepare => "prepare",
            Stage::LoadData => "load_data",
            Stage::BuildIndex => "build_index",
            Stage::SaveIndexFiles => "save_index_files",
        }
    }
}

/// Shared handle to a schedulable task.
pub type TaskRef = Arc<dyn Task>;

/// A unit of work the scheduler can drive through the build pipeline.
///
/// The runner never inspects task internals beyond this capability set.
/// Stage methods run at most once per admission, strictly in
/// [`Stage::ALL`] order, and only while the previous stage succeeded and the
/// task's token is not cancelled. They must observe the supplied token and
/// return promptly once it is cancelled; the scheduler imposes no stage
/// timeout of its own.
#[async_trait]
pub trait Task: Send + Sync {
    /// Stable human-readable name for logging and diagnostics.
    fn name(&self) -> &str;

    /// Cancellation token owned by this task. Deriving it from the
    /// scheduler's token (see [`TaskScheduler::cancel_token`]) lets a single
    /// check cover both the per-task and the shutdown cancellation source.
    ///
    /// [`TaskScheduler::cancel_token`]: crate::scheduler::TaskScheduler::cancel_token
    fn cancel_token(&self) -> CancellationToken;

    /// Current lifecycle state.
    fn state(&self) -> TaskState;

    /// Overwrite the lifecycle state. The runner writes the terminal state
    /// exactly once, before `reset`; external readers synchronize by waiting
    /// for `close()` to return or by observing `reset`.
    fn set_state(&self, state: TaskState);

    /// Admission hook, invoked exactly once at successful admission, before
    /// any stage. An error rejects the submission and leaves the queue as if
    /// no offer had been made.
    async fn on_enqueue(&self) -> Result<(), StageError>;

    /// Validate the request and set up whatever the build needs.
    async fn prepare(&self, ct: CancellationToken) -> Result<(), StageError>;

    /// Fetch the raw vector data to index.
    async fn load_data(&self, ct: CancellationToken) -> Result<(), StageError>;

    /// Build the index artifact from the loaded data.
    async fn build_index(&self, ct: CancellationToken) -> Result<(), StageError>;

    /// Persist the finished index files.
    async fn save_index_files(&self, ct: CancellationToken) -> Result<(), StageError>;

    /// Cleanup hook, invoked exactly once after the task has left the
    /// pipeline, on every exit path. Must not panic.
    async fn reset(&self);
}
