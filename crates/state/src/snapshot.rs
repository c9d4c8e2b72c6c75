//! Point-in-time snapshots and restore.
//!
//! `snapshot` captures an image of all owned key groups synchronously, then
//! hands back a task that serializes the image and writes it once through
//! the supplied stream factory. Writers are never blocked by a running task;
//! a write that begins after capture does not appear in the handle.
//!
//! The wire layout is one stream per snapshot: a metadata blob (name, kind,
//! and serializer signatures of every known state) followed by one blob per
//! key group, with byte ranges recorded in the resulting
//! [`KeyGroupsStateHandle`] so restore can decode exactly the groups a
//! backend owns.

use anyhow::{Context, Result};
use bytes::Bytes;
use gondola_checkpoint::{ByteRange, CheckpointStreamFactory, KeyGroupsStateHandle};
use gondola_core::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::backend::{HeapKeyedStateBackend, RestoredStateMeta};
use crate::descriptor::StateKind;
use crate::table::{KeyGroupDump, StateTable};

/// Persisted identity of one named state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StateMetaInfo {
    pub(crate) name: String,
    pub(crate) kind: StateKind,
    pub(crate) value_signature: String,
    pub(crate) namespace_signature: String,
    pub(crate) user_key_signature: Option<String>,
    pub(crate) queryable_name: Option<String>,
}

/// Catalog entry of the backend: live registration or restored metadata.
pub(crate) struct StateMetaEntry {
    pub(crate) info: StateMetaInfo,
    pub(crate) restored: bool,
}

#[derive(Serialize, Deserialize)]
struct SnapshotMeta {
    states: Vec<StateMetaInfo>,
}

/// All states' data of one key group: state name -> namespace -> key -> entry.
type KeyGroupBlob = HashMap<String, KeyGroupDump>;

struct SnapshotPayload {
    meta: SnapshotMeta,
    groups: BTreeMap<u32, KeyGroupBlob>,
}

/// The asynchronous part of a snapshot.
///
/// Owns the captured image; the backend may be mutated or disposed while the
/// task runs. Drive it inline or spawn it, the caller decides.
pub struct SnapshotTask {
    checkpoint_id: u64,
    timestamp: Timestamp,
    factory: Arc<dyn CheckpointStreamFactory>,
    payload: Option<SnapshotPayload>,
}

impl SnapshotTask {
    /// Serialize the captured image and write it through the stream factory.
    /// Resolves to `None` when no owned key group held any data.
    pub async fn run(self) -> Result<Option<KeyGroupsStateHandle>> {
        let payload = match self.payload {
            Some(payload) => payload,
            None => {
                debug!(checkpoint_id = self.checkpoint_id, "nothing to persist");
                return Ok(None);
            }
        };

        let mut buf = Vec::new();
        bincode::serialize_into(&mut buf, &payload.meta)
            .context("failed to serialize snapshot metadata")?;
        let meta = ByteRange {
            offset: 0,
            len: buf.len() as u64,
        };

        let mut offsets = BTreeMap::new();
        for (key_group, blob) in &payload.groups {
            let offset = buf.len() as u64;
            bincode::serialize_into(&mut buf, blob)
                .context("failed to serialize key-group data")?;
            offsets.insert(
                *key_group,
                ByteRange {
                    offset,
                    len: buf.len() as u64 - offset,
                },
            );
        }

        let size = buf.len();
        let stream = self.factory.write(self.checkpoint_id, Bytes::from(buf)).await?;

        info!(
            checkpoint_id = self.checkpoint_id,
            key_groups = offsets.len(),
            size,
            "snapshot written"
        );

        Ok(Some(KeyGroupsStateHandle {
            checkpoint_id: self.checkpoint_id,
            timestamp: self.timestamp,
            meta,
            offsets,
            stream,
        }))
    }
}

impl<K: Send + Sync + 'static> HeapKeyedStateBackend<K> {
    /// Capture a consistent image of all owned key groups and return the
    /// task that persists it.
    pub fn snapshot(
        &self,
        checkpoint_id: u64,
        timestamp: Timestamp,
        factory: Arc<dyn CheckpointStreamFactory>,
    ) -> Result<SnapshotTask> {
        self.ensure_active()?;

        // Copy while holding the catalog locks, then hand everything to the
        // task so serialization and I/O happen off the hot path.
        let tables = self.tables.read();
        let meta = self.meta.read();

        let mut groups: BTreeMap<u32, KeyGroupBlob> = BTreeMap::new();
        for key_group in self.key_group_range.iter() {
            let mut blob = KeyGroupBlob::new();
            for (name, table) in tables.iter() {
                if let Some(dump) = table.dump_key_group(key_group) {
                    blob.insert(name.clone(), dump);
                }
            }
            if !blob.is_empty() {
                groups.insert(key_group, blob);
            }
        }

        let payload = if groups.is_empty() {
            None
        } else {
            Some(SnapshotPayload {
                meta: SnapshotMeta {
                    states: meta.values().map(|entry| entry.info.clone()).collect(),
                },
                groups,
            })
        };

        Ok(SnapshotTask {
            checkpoint_id,
            timestamp,
            factory,
            payload,
        })
    }

    /// Merge previously snapshotted data into this backend, restricted to
    /// the key groups it owns. Key groups outside the owned range are
    /// ignored even when present in a handle.
    pub async fn restore(&self, handles: &[KeyGroupsStateHandle]) -> Result<()> {
        self.ensure_active()?;

        for handle in handles {
            let bytes = handle.stream.read_bytes().await?;
            let meta_bytes = handle.meta.slice_of(&bytes)?;
            let meta: SnapshotMeta =
                bincode::deserialize(meta_bytes).context("failed to decode snapshot metadata")?;

            // Record the persisted identities: tables come back with their
            // recorded variant, and the serializer check is armed to run at
            // the first access of each state.
            {
                let mut tables = self.tables.write();
                let mut catalog = self.meta.write();
                for info in &meta.states {
                    self.restored.arm(
                        info.name.clone(),
                        RestoredStateMeta {
                            kind: info.kind,
                            value_signature: info.value_signature.clone(),
                        },
                    );
                    tables.entry(info.name.clone()).or_insert_with(|| {
                        Arc::new(if info.queryable_name.is_some() {
                            StateTable::concurrent()
                        } else {
                            StateTable::plain()
                        })
                    });
                    catalog.entry(info.name.clone()).or_insert_with(|| StateMetaEntry {
                        info: info.clone(),
                        restored: true,
                    });
                }
            }

            let tables = self.tables.read();
            let mut restored_groups = 0usize;
            for (key_group, range) in &handle.offsets {
                if !self.key_group_range.contains(*key_group) {
                    continue;
                }
                let blob: KeyGroupBlob = bincode::deserialize(range.slice_of(&bytes)?)
                    .context("failed to decode key-group data")?;
                for (name, dump) in blob {
                    let table = tables.get(&name).ok_or_else(|| {
                        anyhow::anyhow!("snapshot contains data for unknown state '{}'", name)
                    })?;
                    table.restore_key_group(*key_group, dump);
                }
                restored_groups += 1;
            }

            debug!(
                checkpoint_id = handle.checkpoint_id,
                key_groups = restored_groups,
                "restored snapshot handle"
            );
        }

        info!(
            range = %self.key_group_range,
            handles = handles.len(),
            "state restored"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendConfig;
    use crate::descriptor::{
        FoldingStateDescriptor, ListStateDescriptor, MapStateDescriptor, ReducingStateDescriptor,
        ValueStateDescriptor,
    };
    use gondola_checkpoint::{handles_for_range, MemoryStreamFactory};
    use gondola_core::{
        assign_to_key_group, serialize_to_bytes, BincodeSerializer, JobId, JobVertexId,
        KeyGroupRange, TypeSerializer,
    };

    fn backend_over(range: KeyGroupRange, groups: u32) -> HeapKeyedStateBackend<String> {
        HeapKeyedStateBackend::new(
            JobId::new(),
            JobVertexId::new(),
            Arc::new(BincodeSerializer::<String>::new()),
            BackendConfig {
                number_of_key_groups: groups,
            },
            range,
            None,
        )
        .unwrap()
    }

    fn ns_serializer() -> Arc<BincodeSerializer<()>> {
        Arc::new(BincodeSerializer::<()>::new())
    }

    fn value_descriptor(name: &str) -> ValueStateDescriptor<String> {
        ValueStateDescriptor::new(name, Arc::new(BincodeSerializer::<String>::new()))
    }

    async fn take_snapshot(
        backend: &HeapKeyedStateBackend<String>,
        checkpoint_id: u64,
    ) -> Option<KeyGroupsStateHandle> {
        backend
            .snapshot(checkpoint_id, 1000 + checkpoint_id, Arc::new(MemoryStreamFactory::new()))
            .unwrap()
            .run()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_empty_snapshot_resolves_to_none() {
        let backend = backend_over(KeyGroupRange::new(0, 15).unwrap(), 16);
        assert!(take_snapshot(&backend, 1).await.is_none());

        // Writing and clearing everything brings the backend back to empty.
        backend.set_current_key(&"k".to_string()).unwrap();
        let state = backend
            .value_state(&(), ns_serializer(), &value_descriptor("v"))
            .unwrap();
        state.update(Some("x".to_string())).unwrap();
        state.clear().unwrap();
        assert!(take_snapshot(&backend, 2).await.is_none());
    }

    #[tokio::test]
    async fn test_roundtrip_all_state_kinds() {
        let range = KeyGroupRange::new(0, 15).unwrap();
        let backend = backend_over(range, 16);
        backend.set_current_key(&"k1".to_string()).unwrap();

        let value_desc = value_descriptor("value");
        let list_desc =
            ListStateDescriptor::new("list", Arc::new(BincodeSerializer::<u32>::new()));
        let reduce_desc = ReducingStateDescriptor::new(
            "sum",
            Arc::new(BincodeSerializer::<i64>::new()),
            Arc::new(|a: &i64, b: &i64| a + b),
        );
        let fold_desc = FoldingStateDescriptor::new(
            "fold",
            Arc::new(BincodeSerializer::<String>::new()),
            "init".to_string(),
            Arc::new(|acc: String, v: &u8| format!("{}+{}", acc, v)),
        );
        let map_desc = MapStateDescriptor::new(
            "map",
            Arc::new(BincodeSerializer::<String>::new()),
            Arc::new(BincodeSerializer::<u64>::new()),
        );

        backend
            .value_state(&(), ns_serializer(), &value_desc)
            .unwrap()
            .update(Some("hello".to_string()))
            .unwrap();
        let list = backend.list_state(&(), ns_serializer(), &list_desc).unwrap();
        list.add(1).unwrap();
        list.add(2).unwrap();
        list.add(3).unwrap();
        let sum = backend
            .reducing_state(&(), ns_serializer(), &reduce_desc)
            .unwrap();
        sum.add(40).unwrap();
        sum.add(2).unwrap();
        let fold = backend
            .folding_state(&(), ns_serializer(), &fold_desc)
            .unwrap();
        fold.add(9).unwrap();
        let map = backend.map_state(&(), ns_serializer(), &map_desc).unwrap();
        map.put("a".to_string(), 1).unwrap();
        map.put("b".to_string(), 2).unwrap();

        let handle = take_snapshot(&backend, 1).await.unwrap();

        let restored = backend_over(range, 16);
        restored.restore(&[handle]).await.unwrap();
        restored.set_current_key(&"k1".to_string()).unwrap();

        assert_eq!(
            restored
                .value_state(&(), ns_serializer(), &value_desc)
                .unwrap()
                .value()
                .unwrap(),
            Some("hello".to_string())
        );
        assert_eq!(
            restored
                .list_state(&(), ns_serializer(), &list_desc)
                .unwrap()
                .get()
                .unwrap(),
            Some(vec![1, 2, 3])
        );
        assert_eq!(
            restored
                .reducing_state(&(), ns_serializer(), &reduce_desc)
                .unwrap()
                .get()
                .unwrap(),
            Some(42)
        );
        assert_eq!(
            restored
                .folding_state(&(), ns_serializer(), &fold_desc)
                .unwrap()
                .get()
                .unwrap(),
            Some("init+9".to_string())
        );
        let restored_map = restored.map_state(&(), ns_serializer(), &map_desc).unwrap();
        assert_eq!(restored_map.get(&"a".to_string()).unwrap(), Some(1));
        assert_eq!(restored_map.get(&"b".to_string()).unwrap(), Some(2));
        assert_eq!(restored_map.len().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_is_point_in_time() {
        let backend = backend_over(KeyGroupRange::new(0, 15).unwrap(), 16);
        let descriptor = value_descriptor("v");
        backend.set_current_key(&"k1".to_string()).unwrap();
        let state = backend
            .value_state(&(), ns_serializer(), &descriptor)
            .unwrap();
        state.update(Some("before".to_string())).unwrap();

        let task = backend
            .snapshot(1, 1000, Arc::new(MemoryStreamFactory::new()))
            .unwrap();

        // Mutations after capture must not leak into the handle.
        state.update(Some("after".to_string())).unwrap();
        backend.set_current_key(&"k2".to_string()).unwrap();
        state.update(Some("late key".to_string())).unwrap();

        let handle = task.run().await.unwrap().unwrap();
        let restored = backend_over(KeyGroupRange::new(0, 15).unwrap(), 16);
        restored.restore(&[handle]).await.unwrap();

        let restored_state = restored
            .value_state(&(), ns_serializer(), &descriptor)
            .unwrap();
        restored.set_current_key(&"k1".to_string()).unwrap();
        assert_eq!(restored_state.value().unwrap(), Some("before".to_string()));
        restored.set_current_key(&"k2".to_string()).unwrap();
        assert_eq!(restored_state.value().unwrap(), None);
    }

    #[tokio::test]
    async fn test_example_scenario_two_checkpoints() {
        let range = KeyGroupRange::new(0, 15).unwrap();
        let backend = backend_over(range, 16);
        let descriptor = value_descriptor("v");
        let state = {
            backend.set_current_key(&"1".to_string()).unwrap();
            backend.value_state(&(), ns_serializer(), &descriptor).unwrap()
        };

        state.update(Some("a".to_string())).unwrap();
        let s1 = take_snapshot(&backend, 1).await.unwrap();

        state.update(Some("b".to_string())).unwrap();
        backend.set_current_key(&"2".to_string()).unwrap();
        state.update(Some("c".to_string())).unwrap();
        let s2 = take_snapshot(&backend, 2).await.unwrap();

        let from_s1 = backend_over(range, 16);
        from_s1.restore(&[s1]).await.unwrap();
        let state1 = from_s1.value_state(&(), ns_serializer(), &descriptor).unwrap();
        from_s1.set_current_key(&"1".to_string()).unwrap();
        assert_eq!(state1.value().unwrap(), Some("a".to_string()));
        from_s1.set_current_key(&"2".to_string()).unwrap();
        assert_eq!(state1.value().unwrap(), None);

        let from_s2 = backend_over(range, 16);
        from_s2.restore(&[s2]).await.unwrap();
        let state2 = from_s2.value_state(&(), ns_serializer(), &descriptor).unwrap();
        from_s2.set_current_key(&"1".to_string()).unwrap();
        assert_eq!(state2.value().unwrap(), Some("b".to_string()));
        from_s2.set_current_key(&"2".to_string()).unwrap();
        assert_eq!(state2.value().unwrap(), Some("c".to_string()));
    }

    #[tokio::test]
    async fn test_rescale_splits_state_by_key_group() {
        let full_range = KeyGroupRange::new(0, 9).unwrap();
        let backend = backend_over(full_range, 10);
        let descriptor = value_descriptor("v");
        let state = {
            backend.set_current_key(&"key-0".to_string()).unwrap();
            backend.value_state(&(), ns_serializer(), &descriptor).unwrap()
        };

        let keys: Vec<String> = (0..50).map(|i| format!("key-{}", i)).collect();
        for key in &keys {
            backend.set_current_key(key).unwrap();
            state.update(Some(format!("value-of-{}", key))).unwrap();
        }

        let handle = take_snapshot(&backend, 1).await.unwrap();

        let lower_range = KeyGroupRange::new(0, 4).unwrap();
        let upper_range = KeyGroupRange::new(5, 9).unwrap();
        let lower_handles = handles_for_range(std::slice::from_ref(&handle), lower_range);
        let upper_handles = handles_for_range(std::slice::from_ref(&handle), upper_range);
        assert!(!lower_handles.is_empty());
        assert!(!upper_handles.is_empty());

        let lower = backend_over(lower_range, 10);
        lower.restore(&lower_handles).await.unwrap();
        let upper = backend_over(upper_range, 10);
        upper.restore(&upper_handles).await.unwrap();

        let lower_state = lower.value_state(&(), ns_serializer(), &descriptor).unwrap();
        let upper_state = upper.value_state(&(), ns_serializer(), &descriptor).unwrap();

        let key_serializer = BincodeSerializer::<String>::new();
        for key in &keys {
            let key_bytes = serialize_to_bytes(&key_serializer, key).unwrap();
            let key_group = assign_to_key_group(&key_bytes, 10);
            let expected = Some(format!("value-of-{}", key));

            lower.set_current_key(key).unwrap();
            upper.set_current_key(key).unwrap();
            if lower_range.contains(key_group) {
                assert_eq!(lower_state.value().unwrap(), expected);
                assert_eq!(upper_state.value().unwrap(), None);
            } else {
                assert_eq!(upper_state.value().unwrap(), expected);
                assert_eq!(lower_state.value().unwrap(), None);
            }
        }
    }

    #[tokio::test]
    async fn test_restore_ignores_key_groups_outside_own_range() {
        let backend = backend_over(KeyGroupRange::new(0, 9).unwrap(), 10);
        let descriptor = value_descriptor("v");
        let state = {
            backend.set_current_key(&"key-0".to_string()).unwrap();
            backend.value_state(&(), ns_serializer(), &descriptor).unwrap()
        };
        for i in 0..50 {
            backend.set_current_key(&format!("key-{}", i)).unwrap();
            state.update(Some("x".to_string())).unwrap();
        }

        // Hand the full, unsliced handle to a narrower backend.
        let handle = take_snapshot(&backend, 1).await.unwrap();
        let narrow_range = KeyGroupRange::new(0, 4).unwrap();
        let narrow = backend_over(narrow_range, 10);
        narrow.restore(&[handle]).await.unwrap();

        let narrow_state = narrow.value_state(&(), ns_serializer(), &descriptor).unwrap();
        let key_serializer = BincodeSerializer::<String>::new();
        for i in 0..50 {
            let key = format!("key-{}", i);
            let key_bytes = serialize_to_bytes(&key_serializer, &key).unwrap();
            narrow.set_current_key(&key).unwrap();
            if narrow_range.contains(assign_to_key_group(&key_bytes, 10)) {
                assert_eq!(narrow_state.value().unwrap(), Some("x".to_string()));
            } else {
                assert_eq!(narrow_state.value().unwrap(), None);
            }
        }
    }

    /// Fixed eight-byte big-endian encoding, structurally different from the
    /// bincode format.
    struct BigEndianU64Serializer;

    impl TypeSerializer<u64> for BigEndianU64Serializer {
        fn signature(&self) -> String {
            "fixed8-be/u64".to_string()
        }

        fn serialize(&self, value: &u64, buf: &mut Vec<u8>) -> Result<()> {
            buf.extend_from_slice(&value.to_be_bytes());
            Ok(())
        }

        fn deserialize(&self, buf: &mut &[u8]) -> Result<u64> {
            anyhow::ensure!(buf.len() >= 8, "truncated u64");
            let (head, rest) = buf.split_at(8);
            let mut raw = [0u8; 8];
            raw.copy_from_slice(head);
            *buf = rest;
            Ok(u64::from_be_bytes(raw))
        }
    }

    #[tokio::test]
    async fn test_wrong_serializer_detected_on_first_access() {
        let range = KeyGroupRange::new(0, 15).unwrap();
        let backend = backend_over(range, 16);
        let descriptor =
            ValueStateDescriptor::new("hits", Arc::new(BincodeSerializer::<u64>::new()));
        backend.set_current_key(&"k".to_string()).unwrap();
        backend
            .value_state(&(), ns_serializer(), &descriptor)
            .unwrap()
            .update(Some(5))
            .unwrap();
        let handle = take_snapshot(&backend, 1).await.unwrap();

        let restored = backend_over(range, 16);
        restored.restore(&[handle.clone()]).await.unwrap();
        restored.set_current_key(&"k".to_string()).unwrap();

        // Creation succeeds; the check runs at the first actual access.
        let mismatched = ValueStateDescriptor::new("hits", Arc::new(BigEndianU64Serializer));
        let state = restored
            .value_state(&(), ns_serializer(), &mismatched)
            .unwrap();
        let err = state.value().unwrap_err();
        assert!(err.to_string().contains("wrong serializer"), "got: {}", err);

        // The matching serializer reads the persisted bytes fine.
        let ok = backend_over(range, 16);
        ok.restore(&[handle]).await.unwrap();
        ok.set_current_key(&"k".to_string()).unwrap();
        let good = ok.value_state(&(), ns_serializer(), &descriptor).unwrap();
        assert_eq!(good.value().unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_restored_kind_mismatch_detected_on_first_access() {
        let range = KeyGroupRange::new(0, 15).unwrap();
        let backend = backend_over(range, 16);
        backend.set_current_key(&"k".to_string()).unwrap();
        backend
            .value_state(&(), ns_serializer(), &value_descriptor("payload"))
            .unwrap()
            .update(Some("v".to_string()))
            .unwrap();
        let handle = take_snapshot(&backend, 1).await.unwrap();

        let restored = backend_over(range, 16);
        restored.restore(&[handle]).await.unwrap();
        restored.set_current_key(&"k".to_string()).unwrap();

        let as_list =
            ListStateDescriptor::new("payload", Arc::new(BincodeSerializer::<String>::new()));
        let state = restored.list_state(&(), ns_serializer(), &as_list).unwrap();
        let err = state.get().unwrap_err();
        assert!(err.to_string().contains("persisted as a value state"), "got: {}", err);
    }

    #[tokio::test]
    async fn test_queryable_state_restores_into_concurrent_table() {
        let range = KeyGroupRange::new(0, 15).unwrap();
        let backend = backend_over(range, 16);
        let descriptor = ValueStateDescriptor::new(
            "hits",
            Arc::new(BincodeSerializer::<u64>::new()),
        )
        .queryable("hits-query");
        backend.set_current_key(&"k".to_string()).unwrap();
        backend
            .value_state(&(), ns_serializer(), &descriptor)
            .unwrap()
            .update(Some(1))
            .unwrap();
        let handle = take_snapshot(&backend, 1).await.unwrap();

        let restored = backend_over(range, 16);
        restored.restore(&[handle]).await.unwrap();
        assert!(restored.tables.read().get("hits").unwrap().is_concurrent());

        restored.set_current_key(&"k".to_string()).unwrap();
        let state = restored.value_state(&(), ns_serializer(), &descriptor).unwrap();
        assert_eq!(state.value().unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_dispose_does_not_affect_in_flight_snapshot() {
        let range = KeyGroupRange::new(0, 15).unwrap();
        let backend = backend_over(range, 16);
        let descriptor = value_descriptor("v");
        backend.set_current_key(&"k".to_string()).unwrap();
        backend
            .value_state(&(), ns_serializer(), &descriptor)
            .unwrap()
            .update(Some("survives".to_string()))
            .unwrap();

        // The task owns its captured image; disposing the backend underneath
        // it must not change what gets persisted.
        let task = backend
            .snapshot(1, 1000, Arc::new(MemoryStreamFactory::new()))
            .unwrap();
        backend.dispose();
        let handle = tokio::spawn(task.run()).await.unwrap().unwrap().unwrap();

        let restored = backend_over(range, 16);
        restored.restore(&[handle]).await.unwrap();
        restored.set_current_key(&"k".to_string()).unwrap();
        let state = restored
            .value_state(&(), ns_serializer(), &descriptor)
            .unwrap();
        assert_eq!(state.value().unwrap(), Some("survives".to_string()));
    }

    #[tokio::test]
    async fn test_restore_from_multiple_handles_merges() {
        let lower_range = KeyGroupRange::new(0, 4).unwrap();
        let upper_range = KeyGroupRange::new(5, 9).unwrap();
        let descriptor = value_descriptor("v");
        let key_serializer = BincodeSerializer::<String>::new();

        // Two narrow backends snapshot independently, a wide one merges both.
        let mut handles = Vec::new();
        for range in [lower_range, upper_range] {
            let backend = backend_over(range, 10);
            let state = {
                backend.set_current_key(&"seed".to_string()).unwrap();
                backend.value_state(&(), ns_serializer(), &descriptor).unwrap()
            };
            for i in 0..50 {
                let key = format!("key-{}", i);
                let key_bytes = serialize_to_bytes(&key_serializer, &key).unwrap();
                if range.contains(assign_to_key_group(&key_bytes, 10)) {
                    backend.set_current_key(&key).unwrap();
                    state.update(Some(key.clone())).unwrap();
                }
            }
            if let Some(handle) = take_snapshot(&backend, 1).await {
                handles.push(handle);
            }
        }

        let wide = backend_over(KeyGroupRange::new(0, 9).unwrap(), 10);
        wide.restore(&handles).await.unwrap();
        let state = wide.value_state(&(), ns_serializer(), &descriptor).unwrap();
        for i in 0..50 {
            let key = format!("key-{}", i);
            wide.set_current_key(&key).unwrap();
            assert_eq!(state.value().unwrap(), Some(key));
        }
    }
}
