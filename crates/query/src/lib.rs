//! Registry for externally queryable state.
//!
//! State primitives marked queryable are published here so an external
//! point-query path can reach them without going through the typed API. The
//! backend registers on state creation and unregisters on dispose; a query
//! server looks entries up by id; a listener observes both events (e.g. to
//! announce query locations to a job manager).

use anyhow::Result;
use bytes::Bytes;
use dashmap::DashMap;
use gondola_core::{JobId, JobVertexId, KeyGroupRange};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Identifier of one published kv-state instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvStateId(u128);

impl KvStateId {
    /// Create a fresh random id.
    pub fn new() -> Self {
        Self(((fastrand::u64(..) as u128) << 64) | fastrand::u64(..) as u128)
    }
}

impl Default for KvStateId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for KvStateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Byte-level read capability a registered state exposes to the query path.
///
/// `serialized_key_and_namespace` is the key serialized with the backend's
/// key serializer, immediately followed by the namespace serialized with the
/// state's namespace serializer. Implementations are read-only and safe to
/// call from a thread other than the one mutating the state.
pub trait QueryableKvState: Send + Sync {
    /// Look up the serialized value for the given key and namespace, or
    /// `None` if absent.
    fn get_serialized_value(&self, serialized_key_and_namespace: &[u8]) -> Result<Option<Bytes>>;
}

/// Observes registration and deregistration of queryable state.
///
/// Both notifications fire exactly once per registration, with the same
/// identifying fields.
pub trait KvStateRegistryListener: Send + Sync {
    fn notify_kv_state_registered(
        &self,
        job_id: JobId,
        vertex_id: JobVertexId,
        key_group_range: KeyGroupRange,
        registration_name: &str,
        kv_state_id: KvStateId,
    );

    fn notify_kv_state_unregistered(
        &self,
        job_id: JobId,
        vertex_id: JobVertexId,
        key_group_range: KeyGroupRange,
        registration_name: &str,
    );
}

struct KvStateEntry {
    job_id: JobId,
    vertex_id: JobVertexId,
    key_group_range: KeyGroupRange,
    registration_name: String,
    state: Arc<dyn QueryableKvState>,
}

/// Registry of the queryable state published by the backends of one process.
#[derive(Default)]
pub struct KvStateRegistry {
    entries: DashMap<KvStateId, KvStateEntry>,
    listener: RwLock<Option<Arc<dyn KvStateRegistryListener>>>,
}

impl KvStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the listener notified of future registrations.
    pub fn register_listener(&self, listener: Arc<dyn KvStateRegistryListener>) {
        *self.listener.write() = Some(listener);
    }

    pub fn unregister_listener(&self) {
        *self.listener.write() = None;
    }

    /// Publish a kv-state instance, returning its generated id.
    pub fn register_kv_state(
        &self,
        job_id: JobId,
        vertex_id: JobVertexId,
        key_group_range: KeyGroupRange,
        registration_name: &str,
        state: Arc<dyn QueryableKvState>,
    ) -> KvStateId {
        let id = KvStateId::new();
        self.entries.insert(
            id,
            KvStateEntry {
                job_id,
                vertex_id,
                key_group_range,
                registration_name: registration_name.to_string(),
                state,
            },
        );

        info!(
            kv_state_id = %id,
            name = registration_name,
            range = %key_group_range,
            "kv-state registered"
        );

        if let Some(listener) = self.listener.read().as_ref() {
            listener.notify_kv_state_registered(
                job_id,
                vertex_id,
                key_group_range,
                registration_name,
                id,
            );
        }
        id
    }

    /// Withdraw a previously published kv-state instance.
    pub fn unregister_kv_state(&self, kv_state_id: KvStateId) -> Result<()> {
        let (_, entry) = self
            .entries
            .remove(&kv_state_id)
            .ok_or_else(|| anyhow::anyhow!("no kv-state registered under id {}", kv_state_id))?;

        debug!(kv_state_id = %kv_state_id, name = %entry.registration_name, "kv-state unregistered");

        if let Some(listener) = self.listener.read().as_ref() {
            listener.notify_kv_state_unregistered(
                entry.job_id,
                entry.vertex_id,
                entry.key_group_range,
                &entry.registration_name,
            );
        }
        Ok(())
    }

    /// Look up a published kv-state by id (the query server path).
    pub fn get_kv_state(&self, kv_state_id: &KvStateId) -> Option<Arc<dyn QueryableKvState>> {
        self.entries.get(kv_state_id).map(|e| e.state.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
