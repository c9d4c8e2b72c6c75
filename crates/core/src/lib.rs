//! Core types shared across the engine.

pub mod ids;
pub mod key_groups;
pub mod serializer;

pub use ids::{JobId, JobVertexId};
pub use key_groups::{
    assign_key_to_parallel_operator, assign_to_key_group, compute_key_group_range_for_operator_index,
    compute_operator_index_for_key_group, KeyGroupRange,
};
pub use serializer::{serialize_to_bytes, BincodeSerializer, TypeSerializer};

/// Milliseconds since Unix epoch (or any monotonic-ish reference; up to the caller).
pub type Timestamp = u64;
