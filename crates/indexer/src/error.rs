//! Error types for the index worker.

use thiserror::Error;

/// Errors surfaced to callers of [`TaskScheduler::enqueue`](crate::scheduler::TaskScheduler::enqueue).
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The queue stayed full for the whole admission timeout. Transient;
    /// the caller may retry.
    #[error("task queue full")]
    QueueFull,

    /// The scheduler is closing or closed. Permanent.
    #[error("scheduler closed")]
    SchedulerClosed,

    /// The task's admission hook rejected the submission. The queue is left
    /// as if no offer had been made.
    #[error("admission rejected: {0}")]
    Admission(#[from] StageError),
}

/// Error returned by a task stage or admission hook.
///
/// The stage runner only distinguishes [`StageError::NoSuchKey`] (permanent,
/// task ends `Failed`) from everything else (transient, task ends `Unissued`
/// so the control plane may re-submit).
#[derive(Debug, Error)]
pub enum StageError {
    /// Required input data is permanently unavailable.
    #[error("no such key: {0}")]
    NoSuchKey(String),

    /// The stage panicked. Isolated at the runner boundary and treated as
    /// transient.
    #[error("stage panicked: {0}")]
    Panic(String),

    /// Any other failure.
    #[error("{0}")]
    Transient(String),
}

impl StageError {
    /// Whether this error marks the task permanently failed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, StageError::NoSuchKey(_))
    }
}

/// Node-level errors for submitting builds to an [`IndexNode`](crate::node::IndexNode).
#[derive(Debug, Error)]
pub enum NodeError {
    /// The node is not in the `Healthy` state.
    #[error("index node unhealthy")]
    Unhealthy,

    /// A build with the same key is already tracked by this node.
    #[error("duplicate build: cluster={0} build={1}")]
    DuplicateBuild(u64, u64),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
