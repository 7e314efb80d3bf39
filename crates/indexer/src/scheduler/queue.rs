//! Bounded FIFO queue buffering admitted tasks.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::ScheduleError;

use super::task::TaskRef;

/// Fixed-capacity FIFO of task handles.
///
/// Producers reserve a slot (bounded wait), then commit the task into it;
/// consumers take tasks in admission order. Closing stops new offers while
/// consumers drain whatever was already accepted. Accepted tasks are never
/// reordered, duplicated, or lost before close.
pub struct TaskQueue {
    /// Send side; `None` once closed. Reserves clone the sender out so the
    /// lock is never held across an await.
    tx: Mutex<Option<mpsc::Sender<TaskRef>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<TaskRef>>,
    capacity: usize,
}

/// A reserved queue slot.
///
/// Committing places the task at the tail of the queue. Dropping the slot
/// releases the capacity without a trace, which is what makes admission
/// all-or-nothing when the admission hook fails.
#[derive(Debug)]
pub struct TaskSlot {
    permit: mpsc::OwnedPermit<TaskRef>,
}

impl TaskSlot {
    /// Hand the task to the queue.
    pub fn commit(self, task: TaskRef) {
        let _ = self.permit.send(task);
    }
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently taken (buffered tasks plus uncommitted
    /// reservations). Zero after close.
    pub fn depth(&self) -> usize {
        self.tx
            .lock()
            .unwrap()
            .as_ref()
            .map(|tx| self.capacity - tx.capacity())
            .unwrap_or(0)
    }

    /// Reserve a slot, waiting up to `timeout` for the queue to become
    /// non-full.
    ///
    /// A reserve that was granted a sender before `close` may still commit;
    /// consumers keep draining until every outstanding reservation is
    /// resolved, so such a task is still taken.
    pub async fn reserve(&self, timeout: Duration) -> Result<TaskSlot, ScheduleError> {
        let tx = match self.tx.lock().unwrap().as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(ScheduleError::SchedulerClosed),
        };
        match tokio::time::timeout(timeout, tx.reserve_owned()).await {
            Ok(Ok(permit)) => Ok(TaskSlot { permit }),
            Ok(Err(_)) => Err(ScheduleError::SchedulerClosed),
            Err(_) => Err(ScheduleError::QueueFull),
        }
    }

    /// Take the next task in admission order. Returns `None` once the queue
    /// is closed and fully drained.
    pub async fn take(&self) -> Option<TaskRef> {
        self.rx.lock().await.recv().await
    }

    /// Stop accepting new offers. Already-accepted tasks remain takeable;
    /// consumers wake with `None` after the drain.
    pub fn close(&self) {
        self.tx.lock().unwrap().take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().unwrap().is_none()
    }
}
