//! Internal capability every state primitive implements.
//!
//! The backend uses [`InternalKvState`] to repoint a cached primitive at the
//! namespace of the current access. The byte-level read path used by the
//! external query server is the separate [`gondola_query::QueryableKvState`]
//! impl on each primitive.

use anyhow::Result;
use gondola_core::TypeSerializer;

/// Backend-facing capability of a state primitive.
pub trait InternalKvState<N>: Send + Sync {
    /// Point subsequent typed calls at `namespace`.
    ///
    /// Does not affect the query path, which carries its namespace inside
    /// the serialized key+namespace buffer.
    fn set_current_namespace(&self, namespace: &N) -> Result<()>;
}

/// Encode `key` then `namespace` into the composite buffer the query path
/// expects.
pub fn serialize_key_and_namespace<K: 'static, N: 'static>(
    key: &K,
    key_serializer: &dyn TypeSerializer<K>,
    namespace: &N,
    namespace_serializer: &dyn TypeSerializer<N>,
) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    key_serializer.serialize(key, &mut buf)?;
    namespace_serializer.serialize(namespace, &mut buf)?;
    Ok(buf)
}
