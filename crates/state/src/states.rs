//! Heap state primitive implementations.
//!
//! Each primitive is a thin, namespace-aware view over one [`StateTable`]:
//! values are serialized on write and deserialized on read, so the table
//! only ever holds bytes. All primitives share the backend's key context and
//! verify serializer compatibility on first access after a restore.

use anyhow::Result;
use bytes::Bytes;
use gondola_core::TypeSerializer;
use gondola_query::QueryableKvState;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{CompatGate, KeyContext};
use crate::descriptor::{FoldFn, ReduceFn};
use crate::internal::InternalKvState;
use crate::table::{StateEntry, StateTable};

// ============================================================================
// Shared plumbing
// ============================================================================

/// Fields common to every heap state primitive.
pub(crate) struct StateBase<K, N> {
    name: String,
    table: Arc<StateTable>,
    key_context: Arc<KeyContext>,
    key_serializer: Arc<dyn TypeSerializer<K>>,
    namespace_serializer: Arc<dyn TypeSerializer<N>>,
    current_namespace: RwLock<Option<Bytes>>,
    gate: CompatGate,
}

impl<K, N> StateBase<K, N>
where
    K: Send + Sync + 'static,
    N: Send + Sync + 'static,
{
    pub(crate) fn new(
        name: String,
        table: Arc<StateTable>,
        key_context: Arc<KeyContext>,
        key_serializer: Arc<dyn TypeSerializer<K>>,
        namespace_serializer: Arc<dyn TypeSerializer<N>>,
        gate: CompatGate,
    ) -> Self {
        Self {
            name,
            table,
            key_context,
            key_serializer,
            namespace_serializer,
            current_namespace: RwLock::new(None),
            gate,
        }
    }

    /// Key group, namespace bytes, and key bytes of the current access.
    fn current(&self) -> Result<(u32, Bytes, Bytes)> {
        self.gate.check()?;
        let key = self.key_context.get()?;
        let namespace = self
            .current_namespace
            .read()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no namespace set for state '{}'", self.name))?;
        Ok((key.key_group, namespace, key.bytes))
    }

    fn install_namespace(&self, namespace: &N) -> Result<()> {
        let mut buf = Vec::new();
        self.namespace_serializer.serialize(namespace, &mut buf)?;
        *self.current_namespace.write() = Some(Bytes::from(buf));
        Ok(())
    }

    /// Split a composite key+namespace buffer into its two byte slices,
    /// validating both decode with this state's serializers.
    fn split_key_and_namespace<'a>(&self, buf: &'a [u8]) -> Result<(&'a [u8], &'a [u8])> {
        let mut cursor = buf;
        let total = cursor.len();
        let _key: K = self.key_serializer.deserialize(&mut cursor)?;
        let key_len = total - cursor.len();
        let remaining = cursor.len();
        let _namespace: N = self.namespace_serializer.deserialize(&mut cursor)?;
        let ns_len = remaining - cursor.len();
        Ok((&buf[..key_len], &buf[key_len..key_len + ns_len]))
    }

    /// Committed entry for a serialized key+namespace pair (query path).
    fn lookup_serialized(&self, serialized_key_and_namespace: &[u8]) -> Result<Option<StateEntry>> {
        self.gate.check()?;
        let (key, namespace) = self.split_key_and_namespace(serialized_key_and_namespace)?;
        let key_group = self.key_context.key_group_for(key);
        Ok(self.table.get(key_group, namespace, key))
    }

    fn unexpected_entry(&self, entry: &StateEntry, expected: &str) -> anyhow::Error {
        anyhow::anyhow!(
            "state '{}' holds a {} entry, expected a {} entry",
            self.name,
            entry.kind_name(),
            expected
        )
    }
}

fn serialize_with<T: 'static>(serializer: &dyn TypeSerializer<T>, value: &T) -> Result<Bytes> {
    let mut buf = Vec::new();
    serializer.serialize(value, &mut buf)?;
    Ok(Bytes::from(buf))
}

fn deserialize_with<T: 'static>(serializer: &dyn TypeSerializer<T>, bytes: &[u8]) -> Result<T> {
    let mut cursor = bytes;
    serializer.deserialize(&mut cursor)
}

// ============================================================================
// ValueState
// ============================================================================

/// Single value per key and namespace.
pub struct HeapValueState<K, N, V> {
    base: StateBase<K, N>,
    value_serializer: Arc<dyn TypeSerializer<V>>,
    default: Option<V>,
}

impl<K, N, V> std::fmt::Debug for HeapValueState<K, N, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapValueState").finish_non_exhaustive()
    }
}

impl<K, N, V> HeapValueState<K, N, V>
where
    K: Send + Sync + 'static,
    N: Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        base: StateBase<K, N>,
        value_serializer: Arc<dyn TypeSerializer<V>>,
        default: Option<V>,
    ) -> Self {
        Self {
            base,
            value_serializer,
            default,
        }
    }

    /// Current value, or the descriptor default when nothing was written.
    pub fn value(&self) -> Result<Option<V>> {
        let (key_group, namespace, key) = self.base.current()?;
        match self.base.table.get(key_group, &namespace, &key) {
            Some(StateEntry::Value(bytes)) => {
                Ok(Some(deserialize_with(&*self.value_serializer, &bytes)?))
            }
            Some(other) => Err(self.base.unexpected_entry(&other, "value")),
            None => Ok(self.default.clone()),
        }
    }

    /// Store `value`. Updating with `None` behaves exactly like [`clear`](Self::clear).
    pub fn update(&self, value: Option<V>) -> Result<()> {
        match value {
            Some(value) => {
                let (key_group, namespace, key) = self.base.current()?;
                let bytes = serialize_with(&*self.value_serializer, &value)?;
                self.base
                    .table
                    .put(key_group, &namespace, &key, StateEntry::Value(bytes));
                Ok(())
            }
            None => self.clear(),
        }
    }

    /// Remove the entry for the current key and namespace.
    pub fn clear(&self) -> Result<()> {
        let (key_group, namespace, key) = self.base.current()?;
        self.base.table.remove(key_group, &namespace, &key);
        Ok(())
    }
}

impl<K, N, V> InternalKvState<N> for HeapValueState<K, N, V>
where
    K: Send + Sync + 'static,
    N: Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn set_current_namespace(&self, namespace: &N) -> Result<()> {
        self.base.install_namespace(namespace)
    }
}

impl<K, N, V> QueryableKvState for HeapValueState<K, N, V>
where
    K: Send + Sync + 'static,
    N: Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get_serialized_value(&self, serialized_key_and_namespace: &[u8]) -> Result<Option<Bytes>> {
        match self.base.lookup_serialized(serialized_key_and_namespace)? {
            Some(StateEntry::Value(bytes)) => Ok(Some(bytes)),
            Some(other) => Err(self.base.unexpected_entry(&other, "value")),
            None => Ok(None),
        }
    }
}

// ============================================================================
// ListState
// ============================================================================

/// Append-only list per key and namespace.
pub struct HeapListState<K, N, V> {
    base: StateBase<K, N>,
    element_serializer: Arc<dyn TypeSerializer<V>>,
}

impl<K, N, V> std::fmt::Debug for HeapListState<K, N, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapListState").finish_non_exhaustive()
    }
}

impl<K, N, V> HeapListState<K, N, V>
where
    K: Send + Sync + 'static,
    N: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub(crate) fn new(base: StateBase<K, N>, element_serializer: Arc<dyn TypeSerializer<V>>) -> Self {
        Self {
            base,
            element_serializer,
        }
    }

    /// All elements in append order, or `None` when never written. An empty
    /// list is never returned.
    pub fn get(&self) -> Result<Option<Vec<V>>> {
        let (key_group, namespace, key) = self.base.current()?;
        match self.base.table.get(key_group, &namespace, &key) {
            Some(StateEntry::List(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for item in &items {
                    out.push(deserialize_with(&*self.element_serializer, item)?);
                }
                Ok(Some(out))
            }
            Some(other) => Err(self.base.unexpected_entry(&other, "list")),
            None => Ok(None),
        }
    }

    /// Append a single element.
    pub fn add(&self, value: V) -> Result<()> {
        self.add_all(vec![value])
    }

    /// Append multiple elements in order.
    pub fn add_all(&self, values: Vec<V>) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let (key_group, namespace, key) = self.base.current()?;
        let mut encoded = Vec::with_capacity(values.len());
        for value in &values {
            encoded.push(serialize_with(&*self.element_serializer, value)?);
        }
        self.base
            .table
            .update(key_group, &namespace, &key, |slot| match slot {
                Some(StateEntry::List(items)) => {
                    items.extend(encoded);
                    Ok(())
                }
                Some(other) => Err(self.base.unexpected_entry(other, "list")),
                None => {
                    *slot = Some(StateEntry::List(encoded));
                    Ok(())
                }
            })
    }

    /// Remove the list for the current key and namespace.
    pub fn clear(&self) -> Result<()> {
        let (key_group, namespace, key) = self.base.current()?;
        self.base.table.remove(key_group, &namespace, &key);
        Ok(())
    }
}

impl<K, N, V> InternalKvState<N> for HeapListState<K, N, V>
where
    K: Send + Sync + 'static,
    N: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn set_current_namespace(&self, namespace: &N) -> Result<()> {
        self.base.install_namespace(namespace)
    }
}

impl<K, N, V> QueryableKvState for HeapListState<K, N, V>
where
    K: Send + Sync + 'static,
    N: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// The serialized list: a bincode sequence of the serialized elements,
    /// in append order.
    fn get_serialized_value(&self, serialized_key_and_namespace: &[u8]) -> Result<Option<Bytes>> {
        match self.base.lookup_serialized(serialized_key_and_namespace)? {
            Some(StateEntry::List(items)) => {
                let encoded = bincode::serialize(&items)?;
                Ok(Some(Bytes::from(encoded)))
            }
            Some(other) => Err(self.base.unexpected_entry(&other, "list")),
            None => Ok(None),
        }
    }
}

// ============================================================================
// ReducingState
// ============================================================================

/// Running aggregate combined with an associative reduce function.
pub struct HeapReducingState<K, N, V> {
    base: StateBase<K, N>,
    value_serializer: Arc<dyn TypeSerializer<V>>,
    reduce_fn: ReduceFn<V>,
}

impl<K, N, V> HeapReducingState<K, N, V>
where
    K: Send + Sync + 'static,
    N: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub(crate) fn new(
        base: StateBase<K, N>,
        value_serializer: Arc<dyn TypeSerializer<V>>,
        reduce_fn: ReduceFn<V>,
    ) -> Self {
        Self {
            base,
            value_serializer,
            reduce_fn,
        }
    }

    /// The running result, or `None` when untouched.
    pub fn get(&self) -> Result<Option<V>> {
        let (key_group, namespace, key) = self.base.current()?;
        match self.base.table.get(key_group, &namespace, &key) {
            Some(StateEntry::Value(bytes)) => {
                Ok(Some(deserialize_with(&*self.value_serializer, &bytes)?))
            }
            Some(other) => Err(self.base.unexpected_entry(&other, "value")),
            None => Ok(None),
        }
    }

    /// Combine `value` into the running result.
    pub fn add(&self, value: V) -> Result<()> {
        let (key_group, namespace, key) = self.base.current()?;
        self.base
            .table
            .update(key_group, &namespace, &key, |slot| {
                let combined = match &*slot {
                    Some(StateEntry::Value(bytes)) => {
                        let current: V = deserialize_with(&*self.value_serializer, bytes)?;
                        (self.reduce_fn)(&current, &value)
                    }
                    Some(other) => return Err(self.base.unexpected_entry(other, "value")),
                    None => value,
                };
                let bytes = serialize_with(&*self.value_serializer, &combined)?;
                *slot = Some(StateEntry::Value(bytes));
                Ok(())
            })
    }

    /// Remove the running result for the current key and namespace.
    pub fn clear(&self) -> Result<()> {
        let (key_group, namespace, key) = self.base.current()?;
        self.base.table.remove(key_group, &namespace, &key);
        Ok(())
    }
}

impl<K, N, V> InternalKvState<N> for HeapReducingState<K, N, V>
where
    K: Send + Sync + 'static,
    N: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn set_current_namespace(&self, namespace: &N) -> Result<()> {
        self.base.install_namespace(namespace)
    }
}

impl<K, N, V> QueryableKvState for HeapReducingState<K, N, V>
where
    K: Send + Sync + 'static,
    N: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn get_serialized_value(&self, serialized_key_and_namespace: &[u8]) -> Result<Option<Bytes>> {
        match self.base.lookup_serialized(serialized_key_and_namespace)? {
            Some(StateEntry::Value(bytes)) => Ok(Some(bytes)),
            Some(other) => Err(self.base.unexpected_entry(&other, "value")),
            None => Ok(None),
        }
    }
}

// ============================================================================
// FoldingState
// ============================================================================

/// Accumulator folded from incoming values.
///
/// The descriptor's initial value seeds the fold fresh on the first `add`
/// after creation or after `clear`; it is never stored on its own.
pub struct HeapFoldingState<K, N, T, ACC> {
    base: StateBase<K, N>,
    acc_serializer: Arc<dyn TypeSerializer<ACC>>,
    initial: ACC,
    fold_fn: FoldFn<T, ACC>,
}

impl<K, N, T, ACC> HeapFoldingState<K, N, T, ACC>
where
    K: Send + Sync + 'static,
    N: Send + Sync + 'static,
    T: Send + Sync + 'static,
    ACC: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        base: StateBase<K, N>,
        acc_serializer: Arc<dyn TypeSerializer<ACC>>,
        initial: ACC,
        fold_fn: FoldFn<T, ACC>,
    ) -> Self {
        Self {
            base,
            acc_serializer,
            initial,
            fold_fn,
        }
    }

    /// The current accumulator, or `None` when untouched.
    pub fn get(&self) -> Result<Option<ACC>> {
        let (key_group, namespace, key) = self.base.current()?;
        match self.base.table.get(key_group, &namespace, &key) {
            Some(StateEntry::Value(bytes)) => {
                Ok(Some(deserialize_with(&*self.acc_serializer, &bytes)?))
            }
            Some(other) => Err(self.base.unexpected_entry(&other, "value")),
            None => Ok(None),
        }
    }

    /// Fold `value` into the accumulator.
    pub fn add(&self, value: T) -> Result<()> {
        let (key_group, namespace, key) = self.base.current()?;
        self.base
            .table
            .update(key_group, &namespace, &key, |slot| {
                let acc = match &*slot {
                    Some(StateEntry::Value(bytes)) => {
                        deserialize_with(&*self.acc_serializer, bytes)?
                    }
                    Some(other) => return Err(self.base.unexpected_entry(other, "value")),
                    None => self.initial.clone(),
                };
                let folded = (self.fold_fn)(acc, &value);
                let bytes = serialize_with(&*self.acc_serializer, &folded)?;
                *slot = Some(StateEntry::Value(bytes));
                Ok(())
            })
    }

    /// Remove the accumulator for the current key and namespace.
    pub fn clear(&self) -> Result<()> {
        let (key_group, namespace, key) = self.base.current()?;
        self.base.table.remove(key_group, &namespace, &key);
        Ok(())
    }
}

impl<K, N, T, ACC> InternalKvState<N> for HeapFoldingState<K, N, T, ACC>
where
    K: Send + Sync + 'static,
    N: Send + Sync + 'static,
    T: Send + Sync + 'static,
    ACC: Clone + Send + Sync + 'static,
{
    fn set_current_namespace(&self, namespace: &N) -> Result<()> {
        self.base.install_namespace(namespace)
    }
}

impl<K, N, T, ACC> QueryableKvState for HeapFoldingState<K, N, T, ACC>
where
    K: Send + Sync + 'static,
    N: Send + Sync + 'static,
    T: Send + Sync + 'static,
    ACC: Clone + Send + Sync + 'static,
{
    fn get_serialized_value(&self, serialized_key_and_namespace: &[u8]) -> Result<Option<Bytes>> {
        match self.base.lookup_serialized(serialized_key_and_namespace)? {
            Some(StateEntry::Value(bytes)) => Ok(Some(bytes)),
            Some(other) => Err(self.base.unexpected_entry(&other, "value")),
            None => Ok(None),
        }
    }
}

// ============================================================================
// MapState
// ============================================================================

/// Nested map per key and namespace.
pub struct HeapMapState<K, N, UK, UV> {
    base: StateBase<K, N>,
    user_key_serializer: Arc<dyn TypeSerializer<UK>>,
    user_value_serializer: Arc<dyn TypeSerializer<UV>>,
}

impl<K, N, UK, UV> HeapMapState<K, N, UK, UV>
where
    K: Send + Sync + 'static,
    N: Send + Sync + 'static,
    UK: Send + Sync + 'static,
    UV: Send + Sync + 'static,
{
    pub(crate) fn new(
        base: StateBase<K, N>,
        user_key_serializer: Arc<dyn TypeSerializer<UK>>,
        user_value_serializer: Arc<dyn TypeSerializer<UV>>,
    ) -> Self {
        Self {
            base,
            user_key_serializer,
            user_value_serializer,
        }
    }

    fn stored_map(&self) -> Result<Option<HashMap<Bytes, Bytes>>> {
        let (key_group, namespace, key) = self.base.current()?;
        match self.base.table.get(key_group, &namespace, &key) {
            Some(StateEntry::Map(map)) => Ok(Some(map)),
            Some(other) => Err(self.base.unexpected_entry(&other, "map")),
            None => Ok(None),
        }
    }

    /// Get the value under `user_key`, or `None` if absent.
    pub fn get(&self, user_key: &UK) -> Result<Option<UV>> {
        let encoded_key = serialize_with(&*self.user_key_serializer, user_key)?;
        match self.stored_map()? {
            Some(map) => match map.get(&encoded_key) {
                Some(bytes) => Ok(Some(deserialize_with(&*self.user_value_serializer, bytes)?)),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    /// Insert or replace one mapping.
    pub fn put(&self, user_key: UK, value: UV) -> Result<()> {
        self.put_all(vec![(user_key, value)])
    }

    /// Insert or replace several mappings at once.
    pub fn put_all(&self, entries: Vec<(UK, UV)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let (key_group, namespace, key) = self.base.current()?;
        let mut encoded = Vec::with_capacity(entries.len());
        for (user_key, value) in &entries {
            encoded.push((
                serialize_with(&*self.user_key_serializer, user_key)?,
                serialize_with(&*self.user_value_serializer, value)?,
            ));
        }
        self.base
            .table
            .update(key_group, &namespace, &key, |slot| match slot {
                Some(StateEntry::Map(map)) => {
                    map.extend(encoded);
                    Ok(())
                }
                Some(other) => Err(self.base.unexpected_entry(other, "map")),
                None => {
                    *slot = Some(StateEntry::Map(encoded.into_iter().collect()));
                    Ok(())
                }
            })
    }

    /// Remove one mapping, returning its previous value if present.
    pub fn remove(&self, user_key: &UK) -> Result<Option<UV>> {
        let (key_group, namespace, key) = self.base.current()?;
        let encoded_key = serialize_with(&*self.user_key_serializer, user_key)?;
        let removed = self
            .base
            .table
            .update(key_group, &namespace, &key, |slot| match slot {
                Some(StateEntry::Map(map)) => {
                    let removed = map.remove(&encoded_key);
                    if map.is_empty() {
                        *slot = None;
                    }
                    Ok(removed)
                }
                Some(other) => Err(self.base.unexpected_entry(other, "map")),
                None => Ok(None),
            })?;
        match removed {
            Some(bytes) => Ok(Some(deserialize_with(&*self.user_value_serializer, &bytes)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, user_key: &UK) -> Result<bool> {
        let encoded_key = serialize_with(&*self.user_key_serializer, user_key)?;
        Ok(self
            .stored_map()?
            .is_some_and(|map| map.contains_key(&encoded_key)))
    }

    /// Number of mappings; `0` when nothing was written.
    pub fn len(&self) -> Result<usize> {
        Ok(self.stored_map()?.map_or(0, |map| map.len()))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn keys(&self) -> Result<Vec<UK>> {
        match self.stored_map()? {
            Some(map) => {
                let mut out = Vec::with_capacity(map.len());
                for key_bytes in map.keys() {
                    out.push(deserialize_with(&*self.user_key_serializer, key_bytes)?);
                }
                Ok(out)
            }
            None => Ok(Vec::new()),
        }
    }

    pub fn values(&self) -> Result<Vec<UV>> {
        match self.stored_map()? {
            Some(map) => {
                let mut out = Vec::with_capacity(map.len());
                for value_bytes in map.values() {
                    out.push(deserialize_with(&*self.user_value_serializer, value_bytes)?);
                }
                Ok(out)
            }
            None => Ok(Vec::new()),
        }
    }

    /// All mappings; empty when nothing was written.
    pub fn entries(&self) -> Result<Vec<(UK, UV)>> {
        match self.stored_map()? {
            Some(map) => {
                let mut out = Vec::with_capacity(map.len());
                for (key_bytes, value_bytes) in &map {
                    out.push((
                        deserialize_with(&*self.user_key_serializer, key_bytes)?,
                        deserialize_with(&*self.user_value_serializer, value_bytes)?,
                    ));
                }
                Ok(out)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Keep only the mappings matching `pred`. This is the mutable-iteration
    /// surface; in-place value replacement is a `put` of the same key.
    pub fn retain(&self, mut pred: impl FnMut(&UK, &UV) -> bool) -> Result<()> {
        let (key_group, namespace, key) = self.base.current()?;
        self.base
            .table
            .update(key_group, &namespace, &key, |slot| match slot {
                Some(StateEntry::Map(map)) => {
                    // Decode everything first so a corrupt entry fails the
                    // whole call without removing anything.
                    let mut kept = HashMap::with_capacity(map.len());
                    for (key_bytes, value_bytes) in map.iter() {
                        let user_key = deserialize_with(&*self.user_key_serializer, key_bytes)?;
                        let value = deserialize_with(&*self.user_value_serializer, value_bytes)?;
                        if pred(&user_key, &value) {
                            kept.insert(key_bytes.clone(), value_bytes.clone());
                        }
                    }
                    if kept.is_empty() {
                        *slot = None;
                    } else {
                        *slot = Some(StateEntry::Map(kept));
                    }
                    Ok(())
                }
                Some(other) => Err(self.base.unexpected_entry(other, "map")),
                None => Ok(()),
            })
    }

    /// Remove the whole map for the current key and namespace.
    pub fn clear(&self) -> Result<()> {
        let (key_group, namespace, key) = self.base.current()?;
        self.base.table.remove(key_group, &namespace, &key);
        Ok(())
    }
}

impl<K, N, UK, UV> InternalKvState<N> for HeapMapState<K, N, UK, UV>
where
    K: Send + Sync + 'static,
    N: Send + Sync + 'static,
    UK: Send + Sync + 'static,
    UV: Send + Sync + 'static,
{
    fn set_current_namespace(&self, namespace: &N) -> Result<()> {
        self.base.install_namespace(namespace)
    }
}

impl<K, N, UK, UV> QueryableKvState for HeapMapState<K, N, UK, UV>
where
    K: Send + Sync + 'static,
    N: Send + Sync + 'static,
    UK: Send + Sync + 'static,
    UV: Send + Sync + 'static,
{
    /// The serialized map: a bincode sequence of (key bytes, value bytes)
    /// pairs, ordered by key bytes for a deterministic encoding.
    fn get_serialized_value(&self, serialized_key_and_namespace: &[u8]) -> Result<Option<Bytes>> {
        match self.base.lookup_serialized(serialized_key_and_namespace)? {
            Some(StateEntry::Map(map)) => {
                let mut pairs: Vec<(Bytes, Bytes)> = map.into_iter().collect();
                pairs.sort_by(|a, b| a.0.cmp(&b.0));
                let encoded = bincode::serialize(&pairs)?;
                Ok(Some(Bytes::from(encoded)))
            }
            Some(other) => Err(self.base.unexpected_entry(&other, "map")),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendConfig, HeapKeyedStateBackend};
    use crate::descriptor::{
        FoldingStateDescriptor, ListStateDescriptor, MapStateDescriptor, ReducingStateDescriptor,
        ValueStateDescriptor,
    };
    use crate::internal::serialize_key_and_namespace;
    use gondola_core::{BincodeSerializer, JobId, JobVertexId, KeyGroupRange};

    fn test_backend() -> HeapKeyedStateBackend<String> {
        HeapKeyedStateBackend::new(
            JobId::new(),
            JobVertexId::new(),
            Arc::new(BincodeSerializer::<String>::new()),
            BackendConfig {
                number_of_key_groups: 16,
            },
            KeyGroupRange::new(0, 15).unwrap(),
            None,
        )
        .unwrap()
    }

    fn ns_serializer() -> Arc<BincodeSerializer<()>> {
        Arc::new(BincodeSerializer::<()>::new())
    }

    #[test]
    fn test_value_state_default_update_clear() {
        let backend = test_backend();
        let descriptor = ValueStateDescriptor::new(
            "counter",
            Arc::new(BincodeSerializer::<i64>::new()),
        )
        .with_default(7);
        backend.set_current_key(&"k1".to_string()).unwrap();
        let state = backend.value_state(&(), ns_serializer(), &descriptor).unwrap();

        // Never written: descriptor default.
        assert_eq!(state.value().unwrap(), Some(7));
        state.update(Some(42)).unwrap();
        assert_eq!(state.value().unwrap(), Some(42));

        // update(None) is clear.
        state.update(None).unwrap();
        assert_eq!(state.value().unwrap(), Some(7));

        // clear is idempotent.
        state.update(Some(1)).unwrap();
        state.clear().unwrap();
        state.clear().unwrap();
        assert_eq!(state.value().unwrap(), Some(7));
    }

    #[test]
    fn test_value_state_isolated_per_key() {
        let backend = test_backend();
        let descriptor =
            ValueStateDescriptor::new("v", Arc::new(BincodeSerializer::<String>::new()));
        let state = {
            backend.set_current_key(&"k1".to_string()).unwrap();
            backend.value_state(&(), ns_serializer(), &descriptor).unwrap()
        };
        state.update(Some("one".to_string())).unwrap();

        backend.set_current_key(&"k2".to_string()).unwrap();
        assert_eq!(state.value().unwrap(), None);
        state.update(Some("two".to_string())).unwrap();

        backend.set_current_key(&"k1".to_string()).unwrap();
        assert_eq!(state.value().unwrap(), Some("one".to_string()));
    }

    #[test]
    fn test_value_state_isolated_per_namespace() {
        let backend = test_backend();
        let descriptor = ValueStateDescriptor::new("v", Arc::new(BincodeSerializer::<u64>::new()));
        backend.set_current_key(&"k".to_string()).unwrap();
        let ns = Arc::new(BincodeSerializer::<u64>::new());

        let state = backend.value_state(&1u64, ns.clone(), &descriptor).unwrap();
        state.update(Some(10)).unwrap();

        let same = backend.value_state(&2u64, ns.clone(), &descriptor).unwrap();
        assert!(Arc::ptr_eq(&state, &same));
        assert_eq!(same.value().unwrap(), None);
        same.update(Some(20)).unwrap();

        let back = backend.value_state(&1u64, ns, &descriptor).unwrap();
        assert_eq!(back.value().unwrap(), Some(10));
    }

    #[test]
    fn test_access_without_current_key_fails() {
        let backend = test_backend();
        let descriptor = ValueStateDescriptor::new("v", Arc::new(BincodeSerializer::<u64>::new()));
        let state = backend.value_state(&(), ns_serializer(), &descriptor).unwrap();
        let err = state.value().unwrap_err();
        assert!(err.to_string().contains("No current key set"));
    }

    #[test]
    fn test_list_state_append_order_and_absence() {
        let backend = test_backend();
        let descriptor =
            ListStateDescriptor::new("events", Arc::new(BincodeSerializer::<String>::new()));
        backend.set_current_key(&"k".to_string()).unwrap();
        let state = backend.list_state(&(), ns_serializer(), &descriptor).unwrap();

        // Never written: None, not an empty list.
        assert_eq!(state.get().unwrap(), None);

        state.add("a".to_string()).unwrap();
        state.add("b".to_string()).unwrap();
        state.add_all(vec!["c".to_string(), "d".to_string()]).unwrap();
        assert_eq!(
            state.get().unwrap(),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()])
        );

        state.clear().unwrap();
        assert_eq!(state.get().unwrap(), None);
    }

    #[test]
    fn test_reducing_state_running_result() {
        let backend = test_backend();
        let descriptor = ReducingStateDescriptor::new(
            "sum",
            Arc::new(BincodeSerializer::<i64>::new()),
            Arc::new(|a: &i64, b: &i64| a + b),
        );
        backend.set_current_key(&"k".to_string()).unwrap();
        let state = backend
            .reducing_state(&(), ns_serializer(), &descriptor)
            .unwrap();

        assert_eq!(state.get().unwrap(), None);
        state.add(10).unwrap();
        state.add(5).unwrap();
        state.add(-3).unwrap();
        assert_eq!(state.get().unwrap(), Some(12));

        state.clear().unwrap();
        assert_eq!(state.get().unwrap(), None);
        state.add(4).unwrap();
        assert_eq!(state.get().unwrap(), Some(4));
    }

    #[test]
    fn test_folding_state_reseeds_initial_after_clear() {
        let backend = test_backend();
        let descriptor = FoldingStateDescriptor::new(
            "fold",
            Arc::new(BincodeSerializer::<String>::new()),
            "Fold-Initial:".to_string(),
            Arc::new(|acc: String, value: &i32| format!("{},{}", acc, value)),
        );
        backend.set_current_key(&"k".to_string()).unwrap();
        let state = backend
            .folding_state(&(), ns_serializer(), &descriptor)
            .unwrap();

        // Untouched: no accumulator, not the initial value.
        assert_eq!(state.get().unwrap(), None);

        state.add(1).unwrap();
        assert_eq!(state.get().unwrap(), Some("Fold-Initial:,1".to_string()));
        state.add(2).unwrap();
        assert_eq!(state.get().unwrap(), Some("Fold-Initial:,1,2".to_string()));

        // A fresh initial value is applied after clear, not a stored seed.
        state.clear().unwrap();
        assert_eq!(state.get().unwrap(), None);
        state.add(3).unwrap();
        assert_eq!(state.get().unwrap(), Some("Fold-Initial:,3".to_string()));
    }

    #[test]
    fn test_map_state_operations() {
        let backend = test_backend();
        let descriptor = MapStateDescriptor::new(
            "attrs",
            Arc::new(BincodeSerializer::<String>::new()),
            Arc::new(BincodeSerializer::<u64>::new()),
        );
        backend.set_current_key(&"k".to_string()).unwrap();
        let state = backend.map_state(&(), ns_serializer(), &descriptor).unwrap();

        // Absent map: empty signals everywhere.
        assert_eq!(state.len().unwrap(), 0);
        assert!(state.is_empty().unwrap());
        assert!(state.entries().unwrap().is_empty());
        assert_eq!(state.get(&"a".to_string()).unwrap(), None);
        assert!(!state.contains(&"a".to_string()).unwrap());

        state.put("a".to_string(), 1).unwrap();
        state
            .put_all(vec![("b".to_string(), 2), ("c".to_string(), 3)])
            .unwrap();
        assert_eq!(state.len().unwrap(), 3);
        assert!(state.contains(&"b".to_string()).unwrap());
        assert_eq!(state.get(&"c".to_string()).unwrap(), Some(3));

        // Replacement through put.
        state.put("a".to_string(), 10).unwrap();
        assert_eq!(state.get(&"a".to_string()).unwrap(), Some(10));

        let mut keys = state.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        let mut values = state.values().unwrap();
        values.sort_unstable();
        assert_eq!(values, vec![2, 3, 10]);

        assert_eq!(state.remove(&"b".to_string()).unwrap(), Some(2));
        assert_eq!(state.remove(&"b".to_string()).unwrap(), None);
        assert_eq!(state.len().unwrap(), 2);

        // Mutable iteration: drop everything below 10.
        state.retain(|_, v| *v >= 10).unwrap();
        let entries = state.entries().unwrap();
        assert_eq!(entries, vec![("a".to_string(), 10)]);

        state.clear().unwrap();
        assert!(state.is_empty().unwrap());
    }

    #[test]
    fn test_map_state_removing_last_entry_reads_as_absent() {
        let backend = test_backend();
        let descriptor = MapStateDescriptor::new(
            "attrs",
            Arc::new(BincodeSerializer::<u32>::new()),
            Arc::new(BincodeSerializer::<u32>::new()),
        );
        backend.set_current_key(&"k".to_string()).unwrap();
        let state = backend.map_state(&(), ns_serializer(), &descriptor).unwrap();

        state.put(1, 1).unwrap();
        state.remove(&1).unwrap();
        assert_eq!(state.len().unwrap(), 0);
        assert!(state.entries().unwrap().is_empty());
    }

    #[test]
    fn test_query_path_matches_typed_reads() {
        let backend = test_backend();
        let key_serializer = BincodeSerializer::<String>::new();
        let descriptor = ValueStateDescriptor::new(
            "hits",
            Arc::new(BincodeSerializer::<u64>::new()),
        )
        .queryable("hits-query");
        backend.set_current_key(&"user-7".to_string()).unwrap();
        let state = backend.value_state(&(), ns_serializer(), &descriptor).unwrap();
        state.update(Some(99)).unwrap();

        let buf = serialize_key_and_namespace(
            &"user-7".to_string(),
            &key_serializer,
            &(),
            &BincodeSerializer::<()>::new(),
        )
        .unwrap();
        let serialized = state.get_serialized_value(&buf).unwrap().unwrap();
        let decoded: u64 = bincode::deserialize(&serialized).unwrap();
        assert_eq!(decoded, 99);

        // Unknown key: absent, not the descriptor default.
        let missing = serialize_key_and_namespace(
            &"user-8".to_string(),
            &key_serializer,
            &(),
            &BincodeSerializer::<()>::new(),
        )
        .unwrap();
        assert_eq!(state.get_serialized_value(&missing).unwrap(), None);
    }

    #[test]
    fn test_concurrent_query_reads_never_torn() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let backend = test_backend();
        let descriptor = ValueStateDescriptor::new(
            "stress",
            Arc::new(BincodeSerializer::<u64>::new()),
        )
        .queryable("stress-query");
        backend.set_current_key(&"hot-key".to_string()).unwrap();
        let state = backend.value_state(&(), ns_serializer(), &descriptor).unwrap();
        state.update(Some(0)).unwrap();

        let query_buf = serialize_key_and_namespace(
            &"hot-key".to_string(),
            &BincodeSerializer::<String>::new(),
            &(),
            &BincodeSerializer::<()>::new(),
        )
        .unwrap();

        let writes: u64 = 20_000;
        let done = AtomicBool::new(false);
        std::thread::scope(|scope| {
            let reader_state = state.clone();
            let query_buf = &query_buf;
            let done = &done;
            let reader = scope.spawn(move || {
                let mut last_seen = 0u64;
                loop {
                    let bytes = reader_state
                        .get_serialized_value(&query_buf)
                        .expect("query read failed")
                        .expect("value vanished mid-run");
                    let value: u64 = bincode::deserialize(&bytes).expect("torn read");
                    assert!(value <= writes, "impossible value {}", value);
                    assert!(value >= last_seen, "went backwards: {} < {}", value, last_seen);
                    last_seen = value;
                    if done.load(Ordering::Acquire) {
                        break;
                    }
                }
                last_seen
            });

            for i in 1..=writes {
                state.update(Some(i)).unwrap();
            }
            done.store(true, Ordering::Release);
            let last_seen = reader.join().unwrap();
            assert!(last_seen <= writes);
        });

        assert_eq!(state.value().unwrap(), Some(writes));
    }
}
