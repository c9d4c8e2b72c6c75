//! Checkpoint stream factories.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::handle::StreamStateHandle;

/// Supplies the output medium a snapshot writes through.
///
/// The backend calls `write` once per snapshot and is agnostic to the
/// underlying medium. I/O failures propagate to the caller; the backend does
/// not retry.
#[async_trait]
pub trait CheckpointStreamFactory: Send + Sync {
    /// Persist one snapshot's bytes, returning a handle to them.
    async fn write(&self, checkpoint_id: u64, data: Bytes) -> Result<StreamStateHandle>;
}

/// Keeps snapshot bytes in memory.
#[derive(Debug, Default)]
pub struct MemoryStreamFactory;

impl MemoryStreamFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CheckpointStreamFactory for MemoryStreamFactory {
    async fn write(&self, _checkpoint_id: u64, data: Bytes) -> Result<StreamStateHandle> {
        Ok(StreamStateHandle::Memory(data))
    }
}

/// Writes snapshot bytes to files under the base path:
///
/// ```text
/// base_path/
///   chk-1/
///     3f9c2a61d4e8b07d.state
///   chk-2/
///     ...
/// ```
pub struct FsStreamFactory {
    base_path: PathBuf,
}

impl FsStreamFactory {
    /// Create a new filesystem stream factory.
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    /// Get the base path.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

#[async_trait]
impl CheckpointStreamFactory for FsStreamFactory {
    async fn write(&self, checkpoint_id: u64, data: Bytes) -> Result<StreamStateHandle> {
        let dir = self.base_path.join(format!("chk-{}", checkpoint_id));
        tokio::fs::create_dir_all(&dir).await?;

        let file_path = dir.join(format!("{:016x}.state", fastrand::u64(..)));
        tokio::fs::write(&file_path, &data)
            .await
            .context("failed to write snapshot stream")?;

        debug!(
            checkpoint_id,
            path = %file_path.display(),
            size = data.len(),
            "snapshot stream written"
        );

        Ok(StreamStateHandle::File {
            path: file_path,
            size: data.len() as u64,
        })
    }
}
