//! Descriptors naming and typing each piece of state.
//!
//! A descriptor is the immutable identity of one named state: its kind, its
//! serializer(s), an optional default, and an optional public query name.
//! The backend references descriptors, never mutates them.

use gondola_core::TypeSerializer;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Kind tag of a named state, fixed at first registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateKind {
    Value,
    List,
    Reducing,
    Folding,
    Map,
}

impl StateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKind::Value => "value",
            StateKind::List => "list",
            StateKind::Reducing => "reducing",
            StateKind::Folding => "folding",
            StateKind::Map => "map",
        }
    }
}

/// Combines an existing value with a new one; must be associative.
pub type ReduceFn<V> = Arc<dyn Fn(&V, &V) -> V + Send + Sync>;

/// Folds one input into the accumulator.
pub type FoldFn<T, ACC> = Arc<dyn Fn(ACC, &T) -> ACC + Send + Sync>;

/// Descriptor for single-value state.
pub struct ValueStateDescriptor<V> {
    name: String,
    serializer: Arc<dyn TypeSerializer<V>>,
    default: Option<V>,
    queryable_name: Option<String>,
}

impl<V> ValueStateDescriptor<V> {
    pub fn new(name: impl Into<String>, serializer: Arc<dyn TypeSerializer<V>>) -> Self {
        Self {
            name: name.into(),
            serializer,
            default: None,
            queryable_name: None,
        }
    }

    /// Value returned by reads of a never-written key.
    pub fn with_default(mut self, default: V) -> Self {
        self.default = Some(default);
        self
    }

    /// Publish this state for external point queries under `query_name`.
    pub fn queryable(mut self, query_name: impl Into<String>) -> Self {
        self.queryable_name = Some(query_name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serializer(&self) -> Arc<dyn TypeSerializer<V>> {
        self.serializer.clone()
    }

    pub fn default_value(&self) -> Option<&V> {
        self.default.as_ref()
    }

    pub fn queryable_name(&self) -> Option<&str> {
        self.queryable_name.as_deref()
    }
}

/// Descriptor for list state.
pub struct ListStateDescriptor<V> {
    name: String,
    serializer: Arc<dyn TypeSerializer<V>>,
    queryable_name: Option<String>,
}

impl<V> ListStateDescriptor<V> {
    pub fn new(name: impl Into<String>, serializer: Arc<dyn TypeSerializer<V>>) -> Self {
        Self {
            name: name.into(),
            serializer,
            queryable_name: None,
        }
    }

    /// Publish this state for external point queries under `query_name`.
    pub fn queryable(mut self, query_name: impl Into<String>) -> Self {
        self.queryable_name = Some(query_name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serializer(&self) -> Arc<dyn TypeSerializer<V>> {
        self.serializer.clone()
    }

    pub fn queryable_name(&self) -> Option<&str> {
        self.queryable_name.as_deref()
    }
}

/// Descriptor for reducing state.
pub struct ReducingStateDescriptor<V> {
    name: String,
    serializer: Arc<dyn TypeSerializer<V>>,
    reduce_fn: ReduceFn<V>,
    queryable_name: Option<String>,
}

impl<V> ReducingStateDescriptor<V> {
    pub fn new(
        name: impl Into<String>,
        serializer: Arc<dyn TypeSerializer<V>>,
        reduce_fn: ReduceFn<V>,
    ) -> Self {
        Self {
            name: name.into(),
            serializer,
            reduce_fn,
            queryable_name: None,
        }
    }

    /// Publish this state for external point queries under `query_name`.
    pub fn queryable(mut self, query_name: impl Into<String>) -> Self {
        self.queryable_name = Some(query_name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serializer(&self) -> Arc<dyn TypeSerializer<V>> {
        self.serializer.clone()
    }

    pub fn reduce_fn(&self) -> ReduceFn<V> {
        self.reduce_fn.clone()
    }

    pub fn queryable_name(&self) -> Option<&str> {
        self.queryable_name.as_deref()
    }
}

/// Descriptor for folding state.
///
/// The initial accumulator is applied fresh on the first `add` after
/// creation or after a `clear`; it is never stored by itself.
pub struct FoldingStateDescriptor<T, ACC> {
    name: String,
    serializer: Arc<dyn TypeSerializer<ACC>>,
    initial: ACC,
    fold_fn: FoldFn<T, ACC>,
    queryable_name: Option<String>,
}

impl<T, ACC> FoldingStateDescriptor<T, ACC> {
    pub fn new(
        name: impl Into<String>,
        serializer: Arc<dyn TypeSerializer<ACC>>,
        initial: ACC,
        fold_fn: FoldFn<T, ACC>,
    ) -> Self {
        Self {
            name: name.into(),
            serializer,
            initial,
            fold_fn,
            queryable_name: None,
        }
    }

    /// Publish this state for external point queries under `query_name`.
    pub fn queryable(mut self, query_name: impl Into<String>) -> Self {
        self.queryable_name = Some(query_name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serializer(&self) -> Arc<dyn TypeSerializer<ACC>> {
        self.serializer.clone()
    }

    pub fn initial_value(&self) -> &ACC {
        &self.initial
    }

    pub fn fold_fn(&self) -> FoldFn<T, ACC> {
        self.fold_fn.clone()
    }

    pub fn queryable_name(&self) -> Option<&str> {
        self.queryable_name.as_deref()
    }
}

/// Descriptor for map state.
pub struct MapStateDescriptor<UK, UV> {
    name: String,
    user_key_serializer: Arc<dyn TypeSerializer<UK>>,
    user_value_serializer: Arc<dyn TypeSerializer<UV>>,
    queryable_name: Option<String>,
}

impl<UK, UV> MapStateDescriptor<UK, UV> {
    pub fn new(
        name: impl Into<String>,
        user_key_serializer: Arc<dyn TypeSerializer<UK>>,
        user_value_serializer: Arc<dyn TypeSerializer<UV>>,
    ) -> Self {
        Self {
            name: name.into(),
            user_key_serializer,
            user_value_serializer,
            queryable_name: None,
        }
    }

    /// Publish this state for external point queries under `query_name`.
    pub fn queryable(mut self, query_name: impl Into<String>) -> Self {
        self.queryable_name = Some(query_name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn user_key_serializer(&self) -> Arc<dyn TypeSerializer<UK>> {
        self.user_key_serializer.clone()
    }

    pub fn user_value_serializer(&self) -> Arc<dyn TypeSerializer<UV>> {
        self.user_value_serializer.clone()
    }

    pub fn queryable_name(&self) -> Option<&str> {
        self.queryable_name.as_deref()
    }
}
