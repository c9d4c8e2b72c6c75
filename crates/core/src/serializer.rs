//! Serializer abstraction for keys, namespaces, and state values.
//!
//! The backend never inspects serialized bytes itself; it only compares
//! serializer signatures to reject reads of persisted state through an
//! incompatible format.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;

/// Serializes values of one type to and from a byte stream.
///
/// `deserialize` consumes from the front of the slice and advances it, so
/// several values can be read back-to-back from one composite buffer (the
/// query path relies on this to split a serialized key+namespace pair).
pub trait TypeSerializer<T>: Send + Sync + 'static {
    /// Stable identity of this serializer's binary format. Two serializers
    /// with different signatures are assumed to produce incompatible bytes.
    fn signature(&self) -> String;

    /// Append the serialized form of `value` to `buf`.
    fn serialize(&self, value: &T, buf: &mut Vec<u8>) -> Result<()>;

    /// Read one value from the front of `buf`, advancing the slice past the
    /// consumed bytes.
    fn deserialize(&self, buf: &mut &[u8]) -> Result<T>;
}

/// Standard serializer backed by bincode.
pub struct BincodeSerializer<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> BincodeSerializer<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for BincodeSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BincodeSerializer<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> TypeSerializer<T> for BincodeSerializer<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn signature(&self) -> String {
        format!("bincode/{}", std::any::type_name::<T>())
    }

    fn serialize(&self, value: &T, buf: &mut Vec<u8>) -> Result<()> {
        bincode::serialize_into(&mut *buf, value).context("bincode serialization failed")
    }

    fn deserialize(&self, buf: &mut &[u8]) -> Result<T> {
        bincode::deserialize_from(&mut *buf).context("bincode deserialization failed")
    }
}

/// Serialize a single value into a fresh buffer.
pub fn serialize_to_bytes<T: 'static>(serializer: &dyn TypeSerializer<T>, value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    serializer.serialize(value, &mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let ser = BincodeSerializer::<String>::new();
        let buf = serialize_to_bytes(&ser, &"hello".to_string()).unwrap();
        let mut cursor = &buf[..];
        assert_eq!(ser.deserialize(&mut cursor).unwrap(), "hello");
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_cursor_advances_over_composite_buffer() {
        let ints = BincodeSerializer::<u64>::new();
        let strings = BincodeSerializer::<String>::new();
        let mut buf = Vec::new();
        ints.serialize(&42, &mut buf).unwrap();
        strings.serialize(&"ns".to_string(), &mut buf).unwrap();

        let mut cursor = &buf[..];
        assert_eq!(ints.deserialize(&mut cursor).unwrap(), 42);
        assert_eq!(strings.deserialize(&mut cursor).unwrap(), "ns");
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_signatures_distinguish_types() {
        let a = BincodeSerializer::<u64>::new();
        let b = BincodeSerializer::<String>::new();
        assert_ne!(a.signature(), b.signature());
        assert_eq!(a.signature(), BincodeSerializer::<u64>::new().signature());
    }
}
