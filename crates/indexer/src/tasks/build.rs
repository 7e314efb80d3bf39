//! The concrete index-build task and its storage/builder seams.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::StageError;
use crate::scheduler::{Task, TaskState};

/// A build request handed down from the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub cluster_id: u64,
    pub build_id: u64,
    /// Storage keys of the raw vector chunks to index.
    pub data_keys: Vec<String>,
    /// Vector dimensionality.
    pub dim: usize,
    /// Index parameters forwarded to the builder (e.g. metric type).
    #[serde(default)]
    pub params: HashMap<String, String>,
    /// Key prefix under which index files are persisted.
    pub artifact_prefix: String,
}

/// One index file ready for persistence.
#[derive(Debug, Clone)]
pub struct IndexFile {
    pub key: String,
    pub data: Vec<u8>,
}

/// A built index prior to persistence.
#[derive(Debug, Clone)]
pub struct IndexArtifact {
    pub files: Vec<IndexFile>,
    pub rows: usize,
    pub dim: usize,
}

/// Read seam to the object store holding raw vector chunks.
///
/// A missing key is permanent: implementations return
/// [`StageError::NoSuchKey`] so the build ends `Failed` instead of being
/// retried forever.
#[async_trait]
pub trait ChunkReader: Send + Sync {
    async fn read(&self, key: &str) -> Result<Vec<u8>, StageError>;
}

/// Turns raw vector chunks into an index artifact.
#[async_trait]
pub trait VectorIndexBuilder: Send + Sync {
    async fn build(
        &self,
        request: &BuildRequest,
        chunks: &[Vec<u8>],
    ) -> Result<IndexArtifact, StageError>;
}

/// Write seam persisting finished index files.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn save(&self, file: &IndexFile) -> Result<(), StageError>;
}

#[derive(Default)]
struct Inner {
    state: TaskState,
    chunks: Vec<Vec<u8>>,
    artifact: Option<IndexArtifact>,
    saved_keys: Vec<String>,
    enqueued_at: Option<DateTime<Utc>>,
}

/// An index build driven through the scheduler's stage pipeline.
///
/// Stages that notice cancellation mid-flight return early with success and
/// let the runner's between-stage check mark the task `Abandoned`.
pub struct IndexBuildTask {
    name: String,
    request: BuildRequest,
    token: CancellationToken,
    reader: Arc<dyn ChunkReader>,
    builder: Arc<dyn VectorIndexBuilder>,
    sink: Arc<dyn ArtifactSink>,
    inner: Mutex<Inner>,
}

impl IndexBuildTask {
    pub fn new(
        request: BuildRequest,
        token: CancellationToken,
        reader: Arc<dyn ChunkReader>,
        builder: Arc<dyn VectorIndexBuilder>,
        sink: Arc<dyn ArtifactSink>,
    ) -> Self {
        let name = format!("index-build-{}-{}", request.cluster_id, request.build_id);
        Self {
            name,
            request,
            token,
            reader,
            builder,
            sink,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn request(&self) -> &BuildRequest {
        &self.request
    }

    /// Keys of persisted index files; populated once `save_index_files`
    /// succeeds and kept across `reset`.
    pub fn saved_keys(&self) -> Vec<String> {
        self.inner.lock().unwrap().saved_keys.clone()
    }

    pub fn enqueued_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().unwrap().enqueued_at
    }
}

#[async_trait]
impl Task for IndexBuildTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn state(&self) -> TaskState {
        self.inner.lock().unwrap().state
    }

    fn set_state(&self, state: TaskState) {
        self.inner.lock().unwrap().state = state;
    }

    async fn on_enqueue(&self) -> Result<(), StageError> {
        if self.request.data_keys.is_empty() {
            return Err(StageError::Transient(format!(
                "build request {} has no data keys",
                self.name
            )));
        }
        self.inner.lock().unwrap().enqueued_at = Some(Utc::now());
        Ok(())
    }

    async fn prepare(&self, _ct: CancellationToken) -> Result<(), StageError> {
        if self.request.dim == 0 {
            return Err(StageError::Transient(format!(
                "invalid dimension 0 for {}",
                self.name
            )));
        }
        debug!(
            task = %self.name,
            keys = self.request.data_keys.len(),
            dim = self.request.dim,
            "build prepared"
        );
        Ok(())
    }

    async fn load_data(&self, ct: CancellationToken) -> Result<(), StageError> {
        let mut chunks = Vec::with_capacity(self.request.data_keys.len());
        for key in &self.request.data_keys {
            if ct.is_cancelled() {
                debug!(task = %self.name, "load interrupted by cancellation");
                return Ok(());
            }
            chunks.push(self.reader.read(key).await?);
        }
        let bytes: usize = chunks.iter().map(Vec::len).sum();
        debug!(task = %self.name, chunks = chunks.len(), bytes, "data loaded");
        self.inner.lock().unwrap().chunks = chunks;
        Ok(())
    }

    async fn build_index(&self, _ct: CancellationToken) -> Result<(), StageError> {
        let chunks = std::mem::take(&mut self.inner.lock().unwrap().chunks);
        let artifact = self.builder.build(&self.request, &chunks).await?;
        debug!(
            task = %self.name,
            rows = artifact.rows,
            files = artifact.files.len(),
            "index built"
        );
        self.inner.lock().unwrap().artifact = Some(artifact);
        Ok(())
    }

    async fn save_index_files(&self, ct: CancellationToken) -> Result<(), StageError> {
        let artifact = self.inner.lock().unwrap().artifact.take();
        let Some(artifact) = artifact else {
            return Err(StageError::Transient(format!(
                "no artifact built for {}",
                self.name
            )));
        };

        let mut saved = Vec::with_capacity(artifact.files.len());
        for file in &artifact.files {
            if ct.is_cancelled() {
                debug!(task = %self.name, "save interrupted by cancellation");
                return Ok(());
            }
            self.sink.save(file).await?;
            saved.push(file.key.clone());
        }
        info!(
            task = %self.name,
            files = saved.len(),
            rows = artifact.rows,
            "index files saved"
        );
        self.inner.lock().unwrap().saved_keys = saved;
        Ok(())
    }

    async fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.chunks.clear();
        inner.artifact = None;
    }
}
