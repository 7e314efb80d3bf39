//! Index-building worker node for a distributed vector database.
//!
//! The core is the bounded task scheduler: admission with backpressure, a
//! fixed-capacity FIFO, stage runners that drive each build through
//! prepare → load data → build index → save index files under cooperative
//! cancellation, and drain-on-close. [`node::IndexNode`] wraps the scheduler
//! with the worker's component lifecycle and an in-flight build registry;
//! [`tasks::IndexBuildTask`] is the concrete build driven through the
//! pipeline.

pub mod config;
pub mod error;
pub mod node;
pub mod scheduler;
pub mod tasks;

pub use config::{IndexerConfig, SchedulerConfig};
pub use error::{ConfigError, NodeError, ScheduleError, StageError};
pub use node::{IndexNode, NodeState, TaskKey};
pub use scheduler::{SchedulerMetrics, Stage, Task, TaskRef, TaskScheduler, TaskState};
pub use tasks::{
    ArtifactSink, BuildRequest, ChunkReader, FlatIndexBuilder, IndexArtifact, IndexBuildTask,
    IndexFile, MemoryChunkStore, VectorIndexBuilder,
};
