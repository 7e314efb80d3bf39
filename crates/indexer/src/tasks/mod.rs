//! Concrete build tasks executed by the scheduler.

pub mod build;
pub mod flat;

pub use build::{
    ArtifactSink, BuildRequest, ChunkReader, IndexArtifact, IndexBuildTask, IndexFile,
    VectorIndexBuilder,
};
pub use flat::{chunk_bytes, FlatIndexBuilder, MemoryChunkStore};
