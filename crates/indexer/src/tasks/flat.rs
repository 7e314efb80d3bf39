//! In-process builder and chunk store implementations.
//!
//! `FlatIndexBuilder` produces a brute-force flat index (vectors stored
//! as-is, searched linearly); `MemoryChunkStore` backs both storage seams
//! for tests and single-process deployments. Production deployments plug
//! object-store-backed implementations into the same seams.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::StageError;

use super::build::{ArtifactSink, BuildRequest, ChunkReader, IndexArtifact, IndexFile, VectorIndexBuilder};

/// Sidecar metadata written next to the index data file.
#[derive(Debug, Serialize)]
struct FlatIndexMeta<'a> {
    index_type: &'static str,
    rows: usize,
    dim: usize,
    metric: &'a str,
}

/// Builds a flat index: chunks of little-endian `f32` vectors are validated
/// and concatenated into a single data file plus a JSON meta file.
pub struct FlatIndexBuilder;

#[async_trait]
impl VectorIndexBuilder for FlatIndexBuilder {
    async fn build(
        &self,
        request: &BuildRequest,
        chunks: &[Vec<u8>],
    ) -> Result<IndexArtifact, StageError> {
        if request.dim == 0 {
            return Err(StageError::Transient("dimension must be positive".into()));
        }

        let mut data = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            if chunk.len() % 4 != 0 {
                return Err(StageError::Transient(format!(
                    "chunk {i} is not f32-aligned ({} bytes)",
                    chunk.len()
                )));
            }
            data.extend_from_slice(chunk);
        }

        let floats = data.len() / 4;
        if floats % request.dim != 0 {
            return Err(StageError::Transient(format!(
                "{} floats do not divide into rows of dim {}",
                floats, request.dim
            )));
        }
        let rows = floats / request.dim;

        let metric = request
            .params
            .get("metric")
            .map(String::as_str)
            .unwrap_or("l2");
        let meta = FlatIndexMeta {
            index_type: "flat",
            rows,
            dim: request.dim,
            metric,
        };
        let meta_bytes = serde_json::to_vec(&meta)
            .map_err(|e| StageError::Transient(format!("meta serialization: {e}")))?;

        let files = vec![
            IndexFile {
                key: format!("{}/meta.json", request.artifact_prefix),
                data: meta_bytes,
            },
            IndexFile {
                key: format!("{}/{}.flat", request.artifact_prefix, Uuid::new_v4()),
                data,
            },
        ];
        Ok(IndexArtifact {
            files,
            rows,
            dim: request.dim,
        })
    }
}

/// In-memory chunk store implementing both storage seams.
#[derive(Default)]
pub struct MemoryChunkStore {
    chunks: RwLock<HashMap<String, Vec<u8>>>,
    saved: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_chunk(&self, key: &str, data: Vec<u8>) {
        self.chunks.write().unwrap().insert(key.to_string(), data);
    }

    /// Keys of every file persisted through the sink seam.
    pub fn saved_files(&self) -> Vec<String> {
        self.saved.read().unwrap().keys().cloned().collect()
    }

    pub fn saved_data(&self, key: &str) -> Option<Vec<u8>> {
        self.saved.read().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl ChunkReader for MemoryChunkStore {
    async fn read(&self, key: &str) -> Result<Vec<u8>, StageError> {
        self.chunks
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StageError::NoSuchKey(key.to_string()))
    }
}

#[async_trait]
impl ArtifactSink for MemoryChunkStore {
    async fn save(&self, file: &IndexFile) -> Result<(), StageError> {
        self.saved
            .write()
            .unwrap()
            .insert(file.key.clone(), file.data.clone());
        Ok(())
    }
}

/// Encode a slice of `f32` as the little-endian byte layout chunks use.
pub fn chunk_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}
