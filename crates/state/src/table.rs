//! Physical storage: key group -> namespace -> key -> serialized entry.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// One stored slot. Leaves are serialized bytes; the table never inspects
/// them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateEntry {
    Value(Bytes),
    List(Vec<Bytes>),
    Map(HashMap<Bytes, Bytes>),
}

impl StateEntry {
    pub fn kind_name(&self) -> &'static str {
        match self {
            StateEntry::Value(_) => "value",
            StateEntry::List(_) => "list",
            StateEntry::Map(_) => "map",
        }
    }
}

/// All namespaces and keys of one key group, as an owned copy.
pub type KeyGroupDump = HashMap<Bytes, HashMap<Bytes, StateEntry>>;

/// Storage table for one named state.
///
/// The plain variant assumes a single owning thread. The concurrent variant
/// additionally tolerates one reader thread (the external point-query path)
/// while the owner mutates: readers and the writer meet only at the
/// innermost shard lock, so a read never blocks the writer for long and
/// never observes a half-written entry.
///
/// The two variants sit behind one enum rather than a trait object; the
/// generic `update` method keeps the table out of object-safe territory.
pub enum StateTable {
    Plain(PlainStateTable),
    Concurrent(ConcurrentStateTable),
}

impl StateTable {
    pub fn plain() -> Self {
        StateTable::Plain(PlainStateTable::new())
    }

    pub fn concurrent() -> Self {
        StateTable::Concurrent(ConcurrentStateTable::new())
    }

    pub fn is_concurrent(&self) -> bool {
        matches!(self, StateTable::Concurrent(_))
    }

    /// Clone out the entry for `(key_group, namespace, key)`, if any.
    pub fn get(&self, key_group: u32, namespace: &[u8], key: &[u8]) -> Option<StateEntry> {
        match self {
            StateTable::Plain(t) => t.get(key_group, namespace, key),
            StateTable::Concurrent(t) => t.get(key_group, namespace, key),
        }
    }

    pub fn put(&self, key_group: u32, namespace: &[u8], key: &[u8], entry: StateEntry) {
        match self {
            StateTable::Plain(t) => t.put(key_group, namespace, key, entry),
            StateTable::Concurrent(t) => t.put(key_group, namespace, key, entry),
        }
    }

    pub fn remove(&self, key_group: u32, namespace: &[u8], key: &[u8]) -> Option<StateEntry> {
        match self {
            StateTable::Plain(t) => t.remove(key_group, namespace, key),
            StateTable::Concurrent(t) => t.remove(key_group, namespace, key),
        }
    }

    /// Atomic read-modify-write of one slot. The closure sees the current
    /// entry (or `None`) and leaves behind the entry to keep (or `None` to
    /// remove); concurrent readers observe either the old or the new entry,
    /// never an intermediate.
    pub fn update<R>(
        &self,
        key_group: u32,
        namespace: &[u8],
        key: &[u8],
        f: impl FnOnce(&mut Option<StateEntry>) -> R,
    ) -> R {
        match self {
            StateTable::Plain(t) => t.update(key_group, namespace, key, f),
            StateTable::Concurrent(t) => t.update(key_group, namespace, key, f),
        }
    }

    /// Key-group indices currently holding data, ascending.
    pub fn key_groups(&self) -> Vec<u32> {
        match self {
            StateTable::Plain(t) => t.key_groups(),
            StateTable::Concurrent(t) => t.key_groups(),
        }
    }

    /// Point-in-time copy of one key group, or `None` for an untouched one.
    pub fn dump_key_group(&self, key_group: u32) -> Option<KeyGroupDump> {
        match self {
            StateTable::Plain(t) => t.dump_key_group(key_group),
            StateTable::Concurrent(t) => t.dump_key_group(key_group),
        }
    }

    /// Merge previously dumped data back into one key group.
    pub fn restore_key_group(&self, key_group: u32, dump: KeyGroupDump) {
        match self {
            StateTable::Plain(t) => t.restore_key_group(key_group, dump),
            StateTable::Concurrent(t) => t.restore_key_group(key_group, dump),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            StateTable::Plain(t) => t.is_empty(),
            StateTable::Concurrent(t) => t.is_empty(),
        }
    }
}

// ============================================================================
// Plain variant
// ============================================================================

type NamespaceMap = HashMap<Bytes, HashMap<Bytes, StateEntry>>;

/// Single-writer table over nested hash maps.
pub struct PlainStateTable {
    groups: RwLock<HashMap<u32, NamespaceMap>>,
}

impl PlainStateTable {
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, key_group: u32, namespace: &[u8], key: &[u8]) -> Option<StateEntry> {
        self.groups
            .read()
            .get(&key_group)?
            .get(namespace)?
            .get(key)
            .cloned()
    }

    fn put(&self, key_group: u32, namespace: &[u8], key: &[u8], entry: StateEntry) {
        self.groups
            .write()
            .entry(key_group)
            .or_default()
            .entry(Bytes::copy_from_slice(namespace))
            .or_default()
            .insert(Bytes::copy_from_slice(key), entry);
    }

    fn remove(&self, key_group: u32, namespace: &[u8], key: &[u8]) -> Option<StateEntry> {
        let mut groups = self.groups.write();
        let removed = groups.get_mut(&key_group)?.get_mut(namespace)?.remove(key);
        Self::prune(&mut groups, key_group, namespace);
        removed
    }

    fn update<R>(
        &self,
        key_group: u32,
        namespace: &[u8],
        key: &[u8],
        f: impl FnOnce(&mut Option<StateEntry>) -> R,
    ) -> R {
        let mut groups = self.groups.write();
        let mut slot = groups
            .get_mut(&key_group)
            .and_then(|ns| ns.get_mut(namespace))
            .and_then(|keys| keys.remove(key));
        let result = f(&mut slot);
        match slot {
            Some(entry) => {
                groups
                    .entry(key_group)
                    .or_default()
                    .entry(Bytes::copy_from_slice(namespace))
                    .or_default()
                    .insert(Bytes::copy_from_slice(key), entry);
            }
            None => Self::prune(&mut groups, key_group, namespace),
        }
        result
    }

    /// Drop empty nested maps so an emptied key group reads as untouched.
    fn prune(groups: &mut HashMap<u32, NamespaceMap>, key_group: u32, namespace: &[u8]) {
        if let Some(ns_map) = groups.get_mut(&key_group) {
            if ns_map.get(namespace).is_some_and(|keys| keys.is_empty()) {
                ns_map.remove(namespace);
            }
            if ns_map.is_empty() {
                groups.remove(&key_group);
            }
        }
    }

    fn key_groups(&self) -> Vec<u32> {
        let mut groups: Vec<u32> = self.groups.read().keys().copied().collect();
        groups.sort_unstable();
        groups
    }

    fn dump_key_group(&self, key_group: u32) -> Option<KeyGroupDump> {
        self.groups.read().get(&key_group).cloned()
    }

    fn restore_key_group(&self, key_group: u32, dump: KeyGroupDump) {
        let mut groups = self.groups.write();
        let ns_map = groups.entry(key_group).or_default();
        for (namespace, keys) in dump {
            ns_map.entry(namespace).or_default().extend(keys);
        }
    }

    fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }
}

impl Default for PlainStateTable {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Concurrent variant
// ============================================================================

type SharedKeyMap = Arc<DashMap<Bytes, StateEntry>>;

/// Table over nested sharded maps, safe for one reader thread concurrent
/// with the owning writer thread.
pub struct ConcurrentStateTable {
    groups: DashMap<u32, Arc<DashMap<Bytes, SharedKeyMap>>>,
}

impl ConcurrentStateTable {
    pub fn new() -> Self {
        Self {
            groups: DashMap::new(),
        }
    }

    fn namespace_map(&self, key_group: u32) -> Option<Arc<DashMap<Bytes, SharedKeyMap>>> {
        self.groups.get(&key_group).map(|m| m.value().clone())
    }

    fn key_map(&self, key_group: u32, namespace: &[u8]) -> Option<SharedKeyMap> {
        self.namespace_map(key_group)?
            .get(namespace)
            .map(|m| m.value().clone())
    }

    fn key_map_or_insert(&self, key_group: u32, namespace: &[u8]) -> SharedKeyMap {
        let ns_map = self
            .groups
            .entry(key_group)
            .or_insert_with(|| Arc::new(DashMap::new()))
            .value()
            .clone();
        let key_map = ns_map
            .entry(Bytes::copy_from_slice(namespace))
            .or_insert_with(|| Arc::new(DashMap::new()))
            .value()
            .clone();
        key_map
    }

    fn get(&self, key_group: u32, namespace: &[u8], key: &[u8]) -> Option<StateEntry> {
        self.key_map(key_group, namespace)?
            .get(key)
            .map(|v| v.value().clone())
    }

    fn put(&self, key_group: u32, namespace: &[u8], key: &[u8], entry: StateEntry) {
        self.key_map_or_insert(key_group, namespace)
            .insert(Bytes::copy_from_slice(key), entry);
    }

    fn remove(&self, key_group: u32, namespace: &[u8], key: &[u8]) -> Option<StateEntry> {
        let key_map = self.key_map(key_group, namespace)?;
        let removed = key_map.remove(key).map(|(_, v)| v);
        self.prune(key_group, namespace);
        removed
    }

    fn update<R>(
        &self,
        key_group: u32,
        namespace: &[u8],
        key: &[u8],
        f: impl FnOnce(&mut Option<StateEntry>) -> R,
    ) -> R {
        let key_map = self.key_map_or_insert(key_group, namespace);
        // The entry guard holds the shard lock for the whole closure, so the
        // reader thread sees either the previous or the final entry.
        let (result, removed) = match key_map.entry(Bytes::copy_from_slice(key)) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let mut slot = Some(occupied.get().clone());
                let result = f(&mut slot);
                match slot {
                    Some(entry) => {
                        occupied.insert(entry);
                        (result, false)
                    }
                    None => {
                        occupied.remove();
                        (result, true)
                    }
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let mut slot = None;
                let result = f(&mut slot);
                match slot {
                    Some(entry) => {
                        vacant.insert(entry);
                        (result, false)
                    }
                    None => (result, true),
                }
            }
        };
        if removed {
            self.prune(key_group, namespace);
        }
        result
    }

    /// Drop empty nested maps so an emptied key group reads as untouched.
    fn prune(&self, key_group: u32, namespace: &[u8]) {
        if let Some(ns_map) = self.namespace_map(key_group) {
            ns_map.remove_if(namespace, |_, keys| keys.is_empty());
            self.groups.remove_if(&key_group, |_, ns| ns.is_empty());
        }
    }

    fn key_groups(&self) -> Vec<u32> {
        let mut groups: Vec<u32> = self.groups.iter().map(|e| *e.key()).collect();
        groups.sort_unstable();
        groups
    }

    fn dump_key_group(&self, key_group: u32) -> Option<KeyGroupDump> {
        let ns_map = self.namespace_map(key_group)?;
        let mut dump = KeyGroupDump::new();
        for ns_entry in ns_map.iter() {
            let keys: HashMap<Bytes, StateEntry> = ns_entry
                .value()
                .iter()
                .map(|kv| (kv.key().clone(), kv.value().clone()))
                .collect();
            if !keys.is_empty() {
                dump.insert(ns_entry.key().clone(), keys);
            }
        }
        if dump.is_empty() {
            None
        } else {
            Some(dump)
        }
    }

    fn restore_key_group(&self, key_group: u32, dump: KeyGroupDump) {
        for (namespace, keys) in dump {
            let key_map = self.key_map_or_insert(key_group, &namespace);
            for (key, entry) in keys {
                key_map.insert(key, entry);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl Default for ConcurrentStateTable {
    fn default() -> Self {
        Self::new()
    }
}
