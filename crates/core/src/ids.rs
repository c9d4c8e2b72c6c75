//! Opaque identifiers for jobs and job vertices.

use serde::{Deserialize, Serialize};
use std::fmt;

fn random_id() -> u128 {
    ((fastrand::u64(..) as u128) << 64) | fastrand::u64(..) as u128
}

/// Identifier of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(u128);

impl JobId {
    /// Create a fresh random id.
    pub fn new() -> Self {
        Self(random_id())
    }

    pub fn from_raw(raw: u128) -> Self {
        Self(raw)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Identifier of one vertex (operator) in a job graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobVertexId(u128);

impl JobVertexId {
    /// Create a fresh random id.
    pub fn new() -> Self {
        Self(random_id())
    }

    pub fn from_raw(raw: u128) -> Self {
        Self(raw)
    }
}

impl Default for JobVertexId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobVertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}
