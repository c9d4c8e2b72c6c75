//! Checkpoint streams and snapshot handles.
//!
//! A snapshot is written once through a [`CheckpointStreamFactory`] and is
//! described afterwards by a [`KeyGroupsStateHandle`]: per key-group index,
//! the byte range of that group's serialized state inside the stream.
//! Restore and rescaling consume handles, never raw streams, which is what
//! lets a snapshot taken over one key-group range be sliced and handed to
//! backends owning smaller or differently positioned ranges.

mod handle;
mod stream;

pub use handle::{handles_for_range, ByteRange, KeyGroupsStateHandle, StreamStateHandle};
pub use stream::{CheckpointStreamFactory, FsStreamFactory, MemoryStreamFactory};
