//! Deterministic key-group assignment and range arithmetic.
//!
//! Keys are partitioned into a fixed number of key groups, the unit of
//! checkpoint granularity and of redistribution across parallel operator
//! instances. The assignment of a key to its group depends only on the key
//! bytes and the total number of key groups, never on the current
//! parallelism; rescaling moves whole groups between instances.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An inclusive interval `[start, end]` of key-group indices owned by one
/// backend instance.
///
/// Ranges of concurrent instances over the same key-group space are disjoint
/// and together cover `[0, number_of_key_groups - 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyGroupRange {
    start: u32,
    end: u32,
}

impl KeyGroupRange {
    /// Create a range; fails unless `start <= end`.
    pub fn new(start: u32, end: u32) -> Result<Self> {
        ensure!(start <= end, "invalid key-group range [{}, {}]", start, end);
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    /// Number of key groups in this range.
    pub fn number_of_key_groups(&self) -> u32 {
        self.end - self.start + 1
    }

    pub fn contains(&self, key_group: u32) -> bool {
        key_group >= self.start && key_group <= self.end
    }

    /// The overlap of two ranges, or `None` when they are disjoint.
    pub fn intersection(&self, other: &KeyGroupRange) -> Option<KeyGroupRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start <= end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// Iterate over the key-group indices in this range.
    pub fn iter(&self) -> impl Iterator<Item = u32> {
        self.start..=self.end
    }
}

impl fmt::Display for KeyGroupRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Assign serialized key bytes to a key group in `[0, number_of_key_groups)`.
///
/// Uses a fixed-key hasher so the assignment is stable across processes and
/// restarts for a given `number_of_key_groups`.
pub fn assign_to_key_group(key: &[u8], number_of_key_groups: u32) -> u32 {
    debug_assert!(number_of_key_groups > 0);
    (hash_key(key) % number_of_key_groups as u64) as u32
}

/// The operator index owning `key_group` under the given parallelism.
pub fn compute_operator_index_for_key_group(
    number_of_key_groups: u32,
    parallelism: u32,
    key_group: u32,
) -> u32 {
    (key_group as u64 * parallelism as u64 / number_of_key_groups as u64) as u32
}

/// The operator index a key currently belongs to.
///
/// Composes [`assign_to_key_group`] with the key-group to operator mapping;
/// used for routing decisions only, never for storage layout.
pub fn assign_key_to_parallel_operator(
    key: &[u8],
    number_of_key_groups: u32,
    parallelism: u32,
) -> u32 {
    compute_operator_index_for_key_group(
        number_of_key_groups,
        parallelism,
        assign_to_key_group(key, number_of_key_groups),
    )
}

/// The contiguous key-group range owned by `operator_index`.
///
/// Splits `[0, number_of_key_groups)` into `parallelism` contiguous,
/// non-overlapping, roughly equal ranges, with the remainder going to the
/// first ranges. Every key-group index belongs to exactly one operator index
/// for a fixed `(number_of_key_groups, parallelism)`.
pub fn compute_key_group_range_for_operator_index(
    number_of_key_groups: u32,
    parallelism: u32,
    operator_index: u32,
) -> Result<KeyGroupRange> {
    ensure!(parallelism > 0, "parallelism must be positive");
    ensure!(
        parallelism <= number_of_key_groups,
        "parallelism {} exceeds the number of key groups {}",
        parallelism,
        number_of_key_groups
    );
    ensure!(
        operator_index < parallelism,
        "operator index {} out of bounds for parallelism {}",
        operator_index,
        parallelism
    );

    let n = number_of_key_groups as u64;
    let p = parallelism as u64;
    let i = operator_index as u64;
    let start = (i * n + p - 1) / p;
    let end = ((i + 1) * n - 1) / p;
    KeyGroupRange::new(start as u32, end as u32)
}

fn hash_key(key: &[u8]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}
