//! Heap-backed partitioned keyed-state backend.

use anyhow::{anyhow, ensure, Result};
use bytes::Bytes;
use gondola_core::{assign_to_key_group, JobId, JobVertexId, KeyGroupRange, TypeSerializer};
use gondola_query::{KvStateId, KvStateRegistry, QueryableKvState};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::descriptor::{
    FoldingStateDescriptor, ListStateDescriptor, MapStateDescriptor, ReducingStateDescriptor,
    StateKind, ValueStateDescriptor,
};
use crate::internal::InternalKvState;
use crate::snapshot::{StateMetaEntry, StateMetaInfo};
use crate::states::{
    HeapFoldingState, HeapListState, HeapMapState, HeapReducingState, HeapValueState, StateBase,
};
use crate::table::StateTable;

/// Backend configuration.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Total number of key groups the key space is partitioned into. Fixed
    /// for the lifetime of the persisted state; rescaling only moves whole
    /// groups between instances.
    pub number_of_key_groups: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            number_of_key_groups: 128,
        }
    }
}

// ============================================================================
// Key context
// ============================================================================

/// The serialized key currently targeted by state operations.
#[derive(Clone)]
pub(crate) struct CurrentKey {
    pub(crate) bytes: Bytes,
    pub(crate) key_group: u32,
}

/// Key context shared between the backend and its state primitives.
pub(crate) struct KeyContext {
    number_of_key_groups: u32,
    current: RwLock<Option<CurrentKey>>,
}

impl KeyContext {
    pub(crate) fn new(number_of_key_groups: u32) -> Self {
        Self {
            number_of_key_groups,
            current: RwLock::new(None),
        }
    }

    pub(crate) fn set(&self, bytes: Bytes, key_group: u32) {
        *self.current.write() = Some(CurrentKey { bytes, key_group });
    }

    pub(crate) fn get(&self) -> Result<CurrentKey> {
        self.current
            .read()
            .clone()
            .ok_or_else(|| anyhow!("No current key set"))
    }

    pub(crate) fn key_group_for(&self, key_bytes: &[u8]) -> u32 {
        assign_to_key_group(key_bytes, self.number_of_key_groups)
    }
}

// ============================================================================
// Serializer compatibility
// ============================================================================

/// Serializer identity persisted with a snapshot, kept after restore until
/// the first access of the matching state verifies it.
pub(crate) struct RestoredStateMeta {
    pub(crate) kind: StateKind,
    pub(crate) value_signature: String,
}

/// Pending compatibility checks armed by restore.
#[derive(Default)]
pub(crate) struct RestoredCompat {
    pending: Mutex<HashMap<String, RestoredStateMeta>>,
}

impl RestoredCompat {
    pub(crate) fn arm(&self, name: String, meta: RestoredStateMeta) {
        self.pending.lock().insert(name, meta);
    }

    fn verify(&self, name: &str, kind: StateKind, value_signature: &str) -> Result<()> {
        let mut pending = self.pending.lock();
        if let Some(persisted) = pending.get(name) {
            ensure!(
                persisted.kind == kind,
                "state '{}' was persisted as a {} state but accessed as a {} state",
                name,
                persisted.kind.as_str(),
                kind.as_str()
            );
            ensure!(
                persisted.value_signature == value_signature,
                "wrong serializer for state '{}': persisted bytes were written with '{}', access uses '{}'",
                name,
                persisted.value_signature,
                value_signature
            );
            pending.remove(name);
        }
        Ok(())
    }
}

/// Per-primitive gate running the lazy compatibility check on first access.
#[derive(Clone)]
pub(crate) struct CompatGate {
    name: String,
    kind: StateKind,
    value_signature: String,
    restored: Arc<RestoredCompat>,
    checked: Arc<AtomicBool>,
}

impl CompatGate {
    pub(crate) fn check(&self) -> Result<()> {
        if self.checked.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.restored
            .verify(&self.name, self.kind, &self.value_signature)?;
        self.checked.store(true, Ordering::Relaxed);
        Ok(())
    }
}

// ============================================================================
// Backend
// ============================================================================

/// Keyed state backend over in-memory state tables.
///
/// Owns the tables, the current-key context, and the catalog of created
/// state primitives; produces point-in-time snapshots and restores from
/// them. One instance is owned by a single task thread; the only supported
/// concurrent access is the external query path of queryable primitives.
pub struct HeapKeyedStateBackend<K> {
    pub(crate) job_id: JobId,
    pub(crate) vertex_id: JobVertexId,
    pub(crate) key_serializer: Arc<dyn TypeSerializer<K>>,
    pub(crate) number_of_key_groups: u32,
    pub(crate) key_group_range: KeyGroupRange,
    pub(crate) key_context: Arc<KeyContext>,
    /// One table per registered state name.
    pub(crate) tables: RwLock<HashMap<String, Arc<StateTable>>>,
    /// Created primitives, keyed by (state name, namespace-serializer signature).
    pub(crate) states: RwLock<HashMap<(String, String), Arc<dyn Any + Send + Sync>>>,
    /// Meta of every known state, registered or restored; written into snapshots.
    pub(crate) meta: RwLock<HashMap<String, StateMetaEntry>>,
    pub(crate) restored: Arc<RestoredCompat>,
    pub(crate) registry: Option<Arc<KvStateRegistry>>,
    pub(crate) registrations: Mutex<Vec<(KvStateId, String)>>,
    pub(crate) disposed: AtomicBool,
}

impl<K: Send + Sync + 'static> HeapKeyedStateBackend<K> {
    pub fn new(
        job_id: JobId,
        vertex_id: JobVertexId,
        key_serializer: Arc<dyn TypeSerializer<K>>,
        config: BackendConfig,
        key_group_range: KeyGroupRange,
        registry: Option<Arc<KvStateRegistry>>,
    ) -> Result<Self> {
        ensure!(
            config.number_of_key_groups > 0,
            "number of key groups must be positive"
        );
        ensure!(
            key_group_range.end() < config.number_of_key_groups,
            "key-group range {} exceeds the key-group space [0, {})",
            key_group_range,
            config.number_of_key_groups
        );

        Ok(Self {
            job_id,
            vertex_id,
            key_serializer,
            number_of_key_groups: config.number_of_key_groups,
            key_group_range,
            key_context: Arc::new(KeyContext::new(config.number_of_key_groups)),
            tables: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            meta: RwLock::new(HashMap::new()),
            restored: Arc::new(RestoredCompat::default()),
            registry,
            registrations: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn key_group_range(&self) -> KeyGroupRange {
        self.key_group_range
    }

    pub fn number_of_key_groups(&self) -> u32 {
        self.number_of_key_groups
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        ensure!(
            !self.disposed.load(Ordering::SeqCst),
            "keyed state backend has been disposed"
        );
        Ok(())
    }

    /// Set the key context for subsequent state operations. Must be called
    /// before any per-key access.
    pub fn set_current_key(&self, key: &K) -> Result<()> {
        self.ensure_active()?;
        let mut buf = Vec::new();
        self.key_serializer.serialize(key, &mut buf)?;
        let key_group = self.key_context.key_group_for(&buf);
        self.key_context.set(Bytes::from(buf), key_group);
        Ok(())
    }

    /// Release internal storage and withdraw queryable registrations.
    /// Idempotent; every operation after the first call fails.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = &self.registry {
            for (id, name) in self.registrations.lock().drain(..) {
                if let Err(err) = registry.unregister_kv_state(id) {
                    tracing::warn!(kv_state_id = %id, name = %name, error = %err, "failed to unregister kv-state on dispose");
                }
            }
        }
        self.states.write().clear();
        self.tables.write().clear();
        self.meta.write().clear();
        info!(job_id = %self.job_id, range = %self.key_group_range, "keyed state backend disposed");
    }

    // ------------------------------------------------------------------
    // State accessors
    // ------------------------------------------------------------------

    /// Look up or create the value state for `descriptor`, bound to
    /// `namespace`. Repeated lookups return the same instance.
    pub fn value_state<N, V>(
        &self,
        namespace: &N,
        namespace_serializer: Arc<dyn TypeSerializer<N>>,
        descriptor: &ValueStateDescriptor<V>,
    ) -> Result<Arc<HeapValueState<K, N, V>>>
    where
        N: Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        self.ensure_active()?;
        let ns_signature = namespace_serializer.signature();
        if let Some(existing) =
            self.lookup_cached::<HeapValueState<K, N, V>>(descriptor.name(), &ns_signature)?
        {
            existing.set_current_namespace(namespace)?;
            return Ok(existing);
        }

        let value_serializer = descriptor.serializer();
        self.register_meta(
            descriptor.name(),
            StateKind::Value,
            value_serializer.signature(),
            ns_signature.clone(),
            None,
            descriptor.queryable_name(),
        )?;
        let state = Arc::new(HeapValueState::new(
            self.state_base(descriptor.name(), StateKind::Value, namespace_serializer, &value_serializer.signature(), descriptor.queryable_name()),
            value_serializer,
            descriptor.default_value().cloned(),
        ));
        state.set_current_namespace(namespace)?;
        self.register_queryable(descriptor.queryable_name(), state.clone());
        self.cache_state(descriptor.name(), ns_signature, state.clone());
        Ok(state)
    }

    /// Look up or create the list state for `descriptor`, bound to
    /// `namespace`.
    pub fn list_state<N, V>(
        &self,
        namespace: &N,
        namespace_serializer: Arc<dyn TypeSerializer<N>>,
        descriptor: &ListStateDescriptor<V>,
    ) -> Result<Arc<HeapListState<K, N, V>>>
    where
        N: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        self.ensure_active()?;
        let ns_signature = namespace_serializer.signature();
        if let Some(existing) =
            self.lookup_cached::<HeapListState<K, N, V>>(descriptor.name(), &ns_signature)?
        {
            existing.set_current_namespace(namespace)?;
            return Ok(existing);
        }

        let element_serializer = descriptor.serializer();
        self.register_meta(
            descriptor.name(),
            StateKind::List,
            element_serializer.signature(),
            ns_signature.clone(),
            None,
            descriptor.queryable_name(),
        )?;
        let state = Arc::new(HeapListState::new(
            self.state_base(descriptor.name(), StateKind::List, namespace_serializer, &element_serializer.signature(), descriptor.queryable_name()),
            element_serializer,
        ));
        state.set_current_namespace(namespace)?;
        self.register_queryable(descriptor.queryable_name(), state.clone());
        self.cache_state(descriptor.name(), ns_signature, state.clone());
        Ok(state)
    }

    /// Look up or create the reducing state for `descriptor`, bound to
    /// `namespace`.
    pub fn reducing_state<N, V>(
        &self,
        namespace: &N,
        namespace_serializer: Arc<dyn TypeSerializer<N>>,
        descriptor: &ReducingStateDescriptor<V>,
    ) -> Result<Arc<HeapReducingState<K, N, V>>>
    where
        N: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        self.ensure_active()?;
        let ns_signature = namespace_serializer.signature();
        if let Some(existing) =
            self.lookup_cached::<HeapReducingState<K, N, V>>(descriptor.name(), &ns_signature)?
        {
            existing.set_current_namespace(namespace)?;
            return Ok(existing);
        }

        let value_serializer = descriptor.serializer();
        self.register_meta(
            descriptor.name(),
            StateKind::Reducing,
            value_serializer.signature(),
            ns_signature.clone(),
            None,
            descriptor.queryable_name(),
        )?;
        let state = Arc::new(HeapReducingState::new(
            self.state_base(descriptor.name(), StateKind::Reducing, namespace_serializer, &value_serializer.signature(), descriptor.queryable_name()),
            value_serializer,
            descriptor.reduce_fn(),
        ));
        state.set_current_namespace(namespace)?;
        self.register_queryable(descriptor.queryable_name(), state.clone());
        self.cache_state(descriptor.name(), ns_signature, state.clone());
        Ok(state)
    }

    /// Look up or create the folding state for `descriptor`, bound to
    /// `namespace`.
    pub fn folding_state<N, T, ACC>(
        &self,
        namespace: &N,
        namespace_serializer: Arc<dyn TypeSerializer<N>>,
        descriptor: &FoldingStateDescriptor<T, ACC>,
    ) -> Result<Arc<HeapFoldingState<K, N, T, ACC>>>
    where
        N: Send + Sync + 'static,
        T: Send + Sync + 'static,
        ACC: Clone + Send + Sync + 'static,
    {
        self.ensure_active()?;
        let ns_signature = namespace_serializer.signature();
        if let Some(existing) = self
            .lookup_cached::<HeapFoldingState<K, N, T, ACC>>(descriptor.name(), &ns_signature)?
        {
            existing.set_current_namespace(namespace)?;
            return Ok(existing);
        }

        let acc_serializer = descriptor.serializer();
        self.register_meta(
            descriptor.name(),
            StateKind::Folding,
            acc_serializer.signature(),
            ns_signature.clone(),
            None,
            descriptor.queryable_name(),
        )?;
        let state = Arc::new(HeapFoldingState::new(
            self.state_base(descriptor.name(), StateKind::Folding, namespace_serializer, &acc_serializer.signature(), descriptor.queryable_name()),
            acc_serializer,
            descriptor.initial_value().clone(),
            descriptor.fold_fn(),
        ));
        state.set_current_namespace(namespace)?;
        self.register_queryable(descriptor.queryable_name(), state.clone());
        self.cache_state(descriptor.name(), ns_signature, state.clone());
        Ok(state)
    }

    /// Look up or create the map state for `descriptor`, bound to
    /// `namespace`.
    pub fn map_state<N, UK, UV>(
        &self,
        namespace: &N,
        namespace_serializer: Arc<dyn TypeSerializer<N>>,
        descriptor: &MapStateDescriptor<UK, UV>,
    ) -> Result<Arc<HeapMapState<K, N, UK, UV>>>
    where
        N: Send + Sync + 'static,
        UK: Send + Sync + 'static,
        UV: Send + Sync + 'static,
    {
        self.ensure_active()?;
        let ns_signature = namespace_serializer.signature();
        if let Some(existing) =
            self.lookup_cached::<HeapMapState<K, N, UK, UV>>(descriptor.name(), &ns_signature)?
        {
            existing.set_current_namespace(namespace)?;
            return Ok(existing);
        }

        let user_value_serializer = descriptor.user_value_serializer();
        let user_key_serializer = descriptor.user_key_serializer();
        self.register_meta(
            descriptor.name(),
            StateKind::Map,
            user_value_serializer.signature(),
            ns_signature.clone(),
            Some(user_key_serializer.signature()),
            descriptor.queryable_name(),
        )?;
        let state = Arc::new(HeapMapState::new(
            self.state_base(descriptor.name(), StateKind::Map, namespace_serializer, &user_value_serializer.signature(), descriptor.queryable_name()),
            user_key_serializer,
            user_value_serializer,
        ));
        state.set_current_namespace(namespace)?;
        self.register_queryable(descriptor.queryable_name(), state.clone());
        self.cache_state(descriptor.name(), ns_signature, state.clone());
        Ok(state)
    }

    // ------------------------------------------------------------------
    // Creation plumbing
    // ------------------------------------------------------------------

    fn lookup_cached<S: Any + Send + Sync>(
        &self,
        name: &str,
        ns_signature: &str,
    ) -> Result<Option<Arc<S>>> {
        let states = self.states.read();
        match states.get(&(name.to_string(), ns_signature.to_string())) {
            Some(existing) => existing
                .clone()
                .downcast::<S>()
                .map(Some)
                .map_err(|_| anyhow!("state '{}' was already created with different types", name)),
            None => Ok(None),
        }
    }

    fn cache_state(&self, name: &str, ns_signature: String, state: Arc<dyn Any + Send + Sync>) {
        self.states
            .write()
            .insert((name.to_string(), ns_signature), state);
    }

    fn state_base<N: Send + Sync + 'static>(
        &self,
        name: &str,
        kind: StateKind,
        namespace_serializer: Arc<dyn TypeSerializer<N>>,
        value_signature: &str,
        queryable_name: Option<&str>,
    ) -> StateBase<K, N> {
        StateBase::new(
            name.to_string(),
            self.table_for(name, queryable_name.is_some()),
            self.key_context.clone(),
            self.key_serializer.clone(),
            namespace_serializer,
            CompatGate {
                name: name.to_string(),
                kind,
                value_signature: value_signature.to_string(),
                restored: self.restored.clone(),
                checked: Arc::new(AtomicBool::new(false)),
            },
        )
    }

    fn register_meta(
        &self,
        name: &str,
        kind: StateKind,
        value_signature: String,
        namespace_signature: String,
        user_key_signature: Option<String>,
        queryable_name: Option<&str>,
    ) -> Result<()> {
        let mut meta = self.meta.write();
        let info = StateMetaInfo {
            name: name.to_string(),
            kind,
            value_signature,
            namespace_signature,
            user_key_signature,
            queryable_name: queryable_name.map(|q| q.to_string()),
        };
        match meta.get_mut(name) {
            // A restored entry is replaced by the live registration; the
            // serializer check against the persisted identity stays lazy and
            // happens in the compat gate on first access.
            Some(entry) if entry.restored => {
                entry.info = info;
                entry.restored = false;
                Ok(())
            }
            Some(entry) => {
                ensure!(
                    entry.info.kind == kind,
                    "state '{}' is already registered as a {} state",
                    name,
                    entry.info.kind.as_str()
                );
                ensure!(
                    entry.info.value_signature == info.value_signature,
                    "state '{}' is already registered with serializer '{}'",
                    name,
                    entry.info.value_signature
                );
                Ok(())
            }
            None => {
                meta.insert(
                    name.to_string(),
                    StateMetaEntry {
                        info,
                        restored: false,
                    },
                );
                Ok(())
            }
        }
    }

    /// The table backing `name`, created on first use. The queryable flag of
    /// the first live registration decides the concurrency variant; a table
    /// restored with the other variant is rebuilt with its contents.
    fn table_for(&self, name: &str, queryable: bool) -> Arc<StateTable> {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.get(name) {
            if existing.is_concurrent() == queryable {
                return existing.clone();
            }
            let rebuilt = Arc::new(if queryable {
                StateTable::concurrent()
            } else {
                StateTable::plain()
            });
            for key_group in existing.key_groups() {
                if let Some(dump) = existing.dump_key_group(key_group) {
                    rebuilt.restore_key_group(key_group, dump);
                }
            }
            tables.insert(name.to_string(), rebuilt.clone());
            return rebuilt;
        }
        let table = Arc::new(if queryable {
            StateTable::concurrent()
        } else {
            StateTable::plain()
        });
        tables.insert(name.to_string(), table.clone());
        table
    }

    fn register_queryable(&self, queryable_name: Option<&str>, state: Arc<dyn QueryableKvState>) {
        if let (Some(name), Some(registry)) = (queryable_name, self.registry.as_ref()) {
            let mut registrations = self.registrations.lock();
            // One registration per query name, no matter how many namespace
            // serializers a state is looked up with.
            if registrations.iter().any(|(_, registered)| registered == name) {
                return;
            }
            let id = registry.register_kv_state(
                self.job_id,
                self.vertex_id,
                self.key_group_range,
                name,
                state,
            );
            registrations.push((id, name.to_string()));
        }
    }
}
