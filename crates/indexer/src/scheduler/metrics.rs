use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::task::TaskState;

/// Scheduler operational counters, snapshotted via
/// [`TaskScheduler::metrics`](crate::scheduler::TaskScheduler::metrics).
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Tasks accepted into the queue.
    pub tasks_admitted: u64,
    /// Enqueue attempts rejected with a full queue.
    pub tasks_rejected: u64,
    /// Terminal outcomes.
    pub tasks_finished: u64,
    pub tasks_failed: u64,
    pub tasks_unissued: u64,
    pub tasks_abandoned: u64,
    /// Rolling average wall time from dequeue to terminal state.
    pub avg_task_duration: Duration,
    /// Last admission or completion.
    pub last_activity: Option<DateTime<Utc>>,
}

impl SchedulerMetrics {
    pub fn record_admission(&mut self) {
        self.tasks_admitted += 1;
        self.last_activity = Some(Utc::now());
    }

    pub fn record_rejection(&mut self) {
        self.tasks_rejected += 1;
    }

    /// Record a task reaching a terminal state.
    pub fn record_outcome(&mut self, state: TaskState, duration: Duration) {
        match state {
            TaskState::Finished => self.tasks_finished += 1,
            TaskState::Failed => self.tasks_failed += 1,
            TaskState::Unissued => self.tasks_unissued += 1,
            TaskState::Abandoned => self.tasks_abandoned += 1,
            _ => {}
        }

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let count = self.completed();
        self.avg_task_duration = if count <= 1 {
            duration
        } else {
            let prev = self.avg_task_duration.as_nanos() as f64;
            let cur = duration.as_nanos() as f64;
            Duration::from_nanos((prev + (cur - prev) / count as f64) as u64)
        };
        self.last_activity = Some(Utc::now());
    }

    /// Total tasks that reached a terminal state.
    pub fn completed(&self) -> u64 {
        self.tasks_finished + self.tasks_failed + self.tasks_unissued + self.tasks_abandoned
    }
}
