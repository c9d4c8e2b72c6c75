//! Partitioned keyed-state backend.
//!
//! Follows the Flink state management model: every key is deterministically
//! assigned to one of a fixed number of key groups, a backend instance owns
//! a contiguous [`KeyGroupRange`](gondola_core::KeyGroupRange) of them, and
//! snapshots are organized by key group so they can be redistributed when
//! the parallelism changes.
//!
//! State is organized into:
//! - [`HeapValueState`]: single value per key
//! - [`HeapListState`]: list of values per key
//! - [`HeapReducingState`]: aggregate combined with a reduce function
//! - [`HeapFoldingState`]: accumulator folded from incoming values
//! - [`HeapMapState`]: map of values per key
//!
//! # Example
//!
//! ```ignore
//! use gondola_state::{BackendConfig, HeapKeyedStateBackend, ValueStateDescriptor};
//!
//! let backend = HeapKeyedStateBackend::new(
//!     job_id, vertex_id, key_serializer, BackendConfig::default(), range, None)?;
//! backend.set_current_key(&"user-123".to_string())?;
//!
//! let descriptor = ValueStateDescriptor::new("counter", serializer);
//! let counter = backend.value_state(&(), namespace_serializer, &descriptor)?;
//! counter.update(Some(42))?;
//! assert_eq!(counter.value()?, Some(42));
//! ```

mod backend;
mod descriptor;
mod internal;
mod snapshot;
mod states;
mod table;

pub use backend::{BackendConfig, HeapKeyedStateBackend};
pub use descriptor::{
    FoldFn, FoldingStateDescriptor, ListStateDescriptor, MapStateDescriptor, ReduceFn,
    ReducingStateDescriptor, StateKind, ValueStateDescriptor,
};
pub use internal::{serialize_key_and_namespace, InternalKvState};
pub use snapshot::SnapshotTask;
pub use states::{
    HeapFoldingState, HeapListState, HeapMapState, HeapReducingState, HeapValueState,
};
pub use table::{StateEntry, StateTable};
