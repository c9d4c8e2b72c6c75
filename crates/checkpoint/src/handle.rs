//! Immutable descriptors of completed snapshots.

use anyhow::{ensure, Context, Result};
use bytes::Bytes;
use gondola_core::{KeyGroupRange, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Points at the persisted bytes of one completed snapshot stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamStateHandle {
    /// Bytes kept in memory (tests and local runs).
    Memory(Bytes),
    /// Bytes persisted to a file.
    File { path: PathBuf, size: u64 },
}

impl StreamStateHandle {
    pub fn size(&self) -> u64 {
        match self {
            StreamStateHandle::Memory(data) => data.len() as u64,
            StreamStateHandle::File { size, .. } => *size,
        }
    }

    /// Read the whole stream back.
    pub async fn read_bytes(&self) -> Result<Bytes> {
        match self {
            StreamStateHandle::Memory(data) => Ok(data.clone()),
            StreamStateHandle::File { path, .. } => {
                let data = tokio::fs::read(path)
                    .await
                    .context("failed to read snapshot stream")?;
                Ok(Bytes::from(data))
            }
        }
    }

    /// Release the underlying bytes. Must only be called once every backend
    /// interested in this stream has finished restoring from it.
    pub async fn discard(&self) -> Result<()> {
        match self {
            StreamStateHandle::Memory(_) => Ok(()),
            StreamStateHandle::File { path, .. } => tokio::fs::remove_file(path)
                .await
                .context("failed to discard snapshot stream"),
        }
    }
}

/// A contiguous byte range inside a snapshot stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub len: u64,
}

impl ByteRange {
    /// The matching slice of `data`; fails when the range lies outside it.
    pub fn slice_of<'a>(&self, data: &'a [u8]) -> Result<&'a [u8]> {
        let start = self.offset as usize;
        let end = start + self.len as usize;
        ensure!(
            end <= data.len(),
            "byte range {}..{} outside stream of {} bytes",
            start,
            end,
            data.len()
        );
        Ok(&data[start..end])
    }
}

/// Immutable descriptor of one completed snapshot: where the metadata and
/// each key group's serialized data live inside the underlying stream.
///
/// Handles are cheap to clone and safe to share across threads. Consuming a
/// handle never mutates it; [`KeyGroupsStateHandle::discard_state`] releases
/// the underlying bytes and is a caller contract, not enforced here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyGroupsStateHandle {
    pub checkpoint_id: u64,
    pub timestamp: Timestamp,
    /// Range of the state metadata blob.
    pub meta: ByteRange,
    /// Byte range per key-group index that actually contains data.
    pub offsets: BTreeMap<u32, ByteRange>,
    pub stream: StreamStateHandle,
}

impl KeyGroupsStateHandle {
    /// Key-group indices with data in this handle, ascending.
    pub fn key_groups(&self) -> impl Iterator<Item = u32> + '_ {
        self.offsets.keys().copied()
    }

    pub fn range(&self, key_group: u32) -> Option<ByteRange> {
        self.offsets.get(&key_group).copied()
    }

    /// Smallest inclusive range covering every key group in this handle.
    pub fn key_group_range(&self) -> Option<KeyGroupRange> {
        let start = *self.offsets.keys().next()?;
        let end = *self.offsets.keys().next_back()?;
        KeyGroupRange::new(start, end).ok()
    }

    /// The part of this handle falling inside `range`, sharing the same
    /// underlying stream. `None` when nothing overlaps.
    pub fn intersect(&self, range: &KeyGroupRange) -> Option<KeyGroupsStateHandle> {
        let offsets: BTreeMap<u32, ByteRange> = self
            .offsets
            .iter()
            .filter(|(kg, _)| range.contains(**kg))
            .map(|(kg, r)| (*kg, *r))
            .collect();
        if offsets.is_empty() {
            return None;
        }
        Some(KeyGroupsStateHandle {
            checkpoint_id: self.checkpoint_id,
            timestamp: self.timestamp,
            meta: self.meta,
            offsets,
            stream: self.stream.clone(),
        })
    }

    /// Release the underlying stream bytes.
    pub async fn discard_state(&self) -> Result<()> {
        self.stream.discard().await
    }
}

/// Slice `handles` down to the key groups inside `target`, dropping handles
/// with no overlap.
///
/// This is the redistribution step of rescaling: handles produced by
/// backends over `[0, n)` are cut into the pieces each new, differently
/// ranged backend should restore from.
pub fn handles_for_range(
    handles: &[KeyGroupsStateHandle],
    target: KeyGroupRange,
) -> Vec<KeyGroupsStateHandle> {
    handles.iter().filter_map(|h| h.intersect(&target)).collect()
}
