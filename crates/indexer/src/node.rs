//! The index worker node: component lifecycle around the task scheduler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::IndexerConfig;
use crate::error::NodeError;
use crate::scheduler::{TaskRef, TaskScheduler};

/// Component state of the node, as reported to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Not serving; set on construction failure paths and after `stop`.
    Abnormal,
    /// Constructed but not yet started.
    Initializing,
    /// Accepting build submissions.
    Healthy,
}

/// Identifies one build request across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub cluster_id: u64,
    pub build_id: u64,
}

struct TaskEntry {
    cancel: CancellationToken,
}

/// A worker node that executes index builds.
///
/// Owns the [`TaskScheduler`], a root cancellation token the scheduler's
/// token is derived from, and a registry of in-flight builds so individual
/// builds can be cancelled by key. Service registration and the RPC surface
/// live outside this type; they hand submissions to [`IndexNode::submit`].
pub struct IndexNode {
    state: RwLock<NodeState>,
    root: CancellationToken,
    scheduler: TaskScheduler,
    tasks: Mutex<HashMap<TaskKey, TaskEntry>>,
    started: AtomicBool,
}

impl IndexNode {
    pub fn new(config: &IndexerConfig) -> Self {
        let root = CancellationToken::new();
        let scheduler = TaskScheduler::new(&root, config.scheduler.clone());
        Self {
            state: RwLock::new(NodeState::Initializing),
            root,
            scheduler,
            tasks: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Begin consuming build tasks. Single-use; repeat calls are no-ops.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scheduler.start();
        *self.state.write().unwrap() = NodeState::Healthy;
        info!("index node started");
    }

    pub fn state(&self) -> NodeState {
        *self.state.read().unwrap()
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == NodeState::Healthy
    }

    /// The scheduler owned by this node.
    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Token for deriving per-task cancellation tokens: a child of the
    /// scheduler's token, so builds observe node shutdown too.
    pub fn task_token(&self) -> CancellationToken {
        self.scheduler.cancel_token().child_token()
    }

    /// Submit a build, tracking its cancellation handle under `key`.
    pub async fn submit(&self, key: TaskKey, task: TaskRef) -> Result<(), NodeError> {
        if !self.is_healthy() {
            return Err(NodeError::Unhealthy);
        }
        {
            let mut tasks = self.tasks.lock().unwrap();
            if tasks.contains_key(&key) {
                warn!(
                    cluster_id = key.cluster_id,
                    build_id = key.build_id,
                    "duplicate build request"
                );
                return Err(NodeError::DuplicateBuild(key.cluster_id, key.build_id));
            }
            tasks.insert(
                key,
                TaskEntry {
                    cancel: task.cancel_token(),
                },
            );
        }
        if let Err(err) = self.scheduler.enqueue(task).await {
            self.tasks.lock().unwrap().remove(&key);
            return Err(err.into());
        }
        Ok(())
    }

    /// Cancel the build registered under `key`. Returns whether a build was
    /// found. The task ends `Abandoned` once the runner observes the token.
    pub fn cancel_build(&self, key: TaskKey) -> bool {
        match self.tasks.lock().unwrap().get(&key) {
            Some(entry) => {
                entry.cancel.cancel();
                info!(
                    cluster_id = key.cluster_id,
                    build_id = key.build_id,
                    "build cancelled"
                );
                true
            }
            None => false,
        }
    }

    /// Drop the registry entry for a terminal build. Returns whether one
    /// was present.
    pub fn finish_build(&self, key: TaskKey) -> bool {
        self.tasks.lock().unwrap().remove(&key).is_some()
    }

    /// In-flight builds currently tracked.
    pub fn running_builds(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Stop the node: cancel every tracked build, drain the scheduler, and
    /// cancel the root token.
    pub async fn stop(&self) {
        *self.state.write().unwrap() = NodeState::Abnormal;

        let entries: Vec<TaskEntry> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.cancel.cancel();
        }
        self.root.cancel();
        self.scheduler.close().await;
        info!(cancelled = entries.len(), "index node stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use crate::error::StageError;
    use crate::scheduler::{Task, TaskState};

    use super::*;

    /// Build stub that parks in `load_data` until its token is cancelled.
    struct ParkedBuild {
        name: String,
        token: CancellationToken,
        state: StdMutex<TaskState>,
    }

    impl ParkedBuild {
        fn new(name: &str, token: CancellationToken) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                token,
                state: StdMutex::new(TaskState::None),
            })
        }
    }

    #[async_trait]
    impl Task for ParkedBuild {
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
            Ok(())
        }
        async fn prepare(&self, _ct: CancellationToken) -> Result<(), StageError> {
            Ok(())
        }
        async fn load_data(&self, ct: CancellationToken) -> Result<(), StageError> {
            ct.cancelled().await;
            Ok(())
        }
        async fn build_index(&self, _ct: CancellationToken) -> Result<(), StageError> {
            Ok(())
        }
        async fn save_index_files(&self, _ct: CancellationToken) -> Result<(), StageError> {
            Ok(())
        }
        async fn reset(&self) {}
    }

    fn key(build_id: u64) -> TaskKey {
        TaskKey {
            cluster_id: 7,
            build_id,
        }
    }

    #[tokio::test]
    async fn lifecycle_states() {
        let node = IndexNode::new(&IndexerConfig::default());
        assert_eq!(node.state(), NodeState::Initializing);

        node.start();
        assert!(node.is_healthy());
        node.start(); // no-op
        assert!(node.is_healthy());

        node.stop().await;
        assert_eq!(node.state(), NodeState::Abnormal);
    }

    #[tokio::test]
    async fn submit_requires_healthy() {
        let node = IndexNode::new(&IndexerConfig::default());
        let task = ParkedBuild::new("early", node.task_token());

        let err = node.submit(key(1), task).await.unwrap_err();
        assert!(matches!(err, NodeError::Unhealthy));
        assert_eq!(node.running_builds(), 0);
    }

    #[tokio::test]
    async fn duplicate_build_rejected() {
        let node = IndexNode::new(&IndexerConfig::default());
        node.start();

        let first = ParkedBuild::new("b1", node.task_token());
        node.submit(key(1), first).await.unwrap();

        let second = ParkedBuild::new("b1-again", node.task_token());
        let err = node.submit(key(1), second).await.unwrap_err();
        assert!(matches!(err, NodeError::DuplicateBuild(7, 1)));
        assert_eq!(node.running_builds(), 1);

        node.stop().await;
    }

    #[tokio::test]
    async fn stop_abandons_inflight_builds() {
        let node = IndexNode::new(&IndexerConfig::default());
        node.start();

        let task = ParkedBuild::new("parked", node.task_token());
        node.submit(key(2), task.clone()).await.unwrap();

        // The build parks in load_data; stop must cancel it and still drain.
        node.stop().await;
        assert_eq!(task.state(), TaskState::Abandoned);
        assert_eq!(node.running_builds(), 0);
    }

    #[tokio::test]
    async fn cancel_build_by_key() {
        let node = IndexNode::new(&IndexerConfig::default());
        node.start();

        let task = ParkedBuild::new("target", node.task_token());
        node.submit(key(3), task.clone()).await.unwrap();

        assert!(node.cancel_build(key(3)));
        assert!(!node.cancel_build(key(99)));

        node.scheduler().close().await;
        assert_eq!(task.state(), TaskState::Abandoned);

        assert!(node.finish_build(key(3)));
        assert_eq!(node.running_builds(), 0);
    }
}
