//! Steward store: the versioned object store interface driven by the convergence engine, and an
//! in-memory implementation of it.
//!
//! The store is assumed to be networked and eventually consistent: typed objects addressed by
//! [`ObjectRef`], optimistic concurrency through `metadata.resourceVersion`, list with label or
//! field-index selectors, and a watch primitive that replays current state before streaming
//! changes.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::BoxStream;
use kube::api::ObjectMeta;
use kube::core::DynamicObject;
use steward_core::{GroupKind, ObjectRef, TypeRegistry};
use thiserror::Error;

pub mod memory;

pub use memory::MemoryStore;

/// Filter for `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Everything,
    /// Label equality on every pair.
    Labels(BTreeMap<String, String>),
    /// Objects whose registered index `name` yields `value`.
    Index { name: String, value: String },
}

impl Selector {
    pub fn index(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Index { name: name.into(), value: value.into() }
    }

    /// Whether the labels on `meta` satisfy a label selector. Index selectors never match here.
    pub fn matches_labels(&self, meta: &ObjectMeta) -> bool {
        match self {
            Self::Everything => true,
            Self::Labels(want) => {
                let have = meta.labels.as_ref();
                want.iter().all(|(k, v)| have.and_then(|l| l.get(k)) == Some(v))
            }
            Self::Index { .. } => false,
        }
    }

    /// `k=v,k2=v2` form for the API server.
    pub fn label_selector(&self) -> Option<String> {
        match self {
            Self::Labels(want) => Some(want.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")),
            _ => None,
        }
    }
}

/// Scope of a watch within one type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchParams {
    pub namespace: Option<String>,
    pub name: Option<String>,
}

impl WatchParams {
    pub fn for_object(r: &ObjectRef) -> Self {
        Self { namespace: r.namespace().map(str::to_string), name: Some(r.name.clone()) }
    }

    pub fn matches(&self, r: &ObjectRef) -> bool {
        self.namespace.as_deref().map_or(true, |ns| ns == r.namespace)
            && self.name.as_deref().map_or(true, |n| n == r.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// Full state of the watched scope; sent first and again whenever the watch re-lists.
    Restarted(Vec<DynamicObject>),
    Added(DynamicObject),
    Modified(DynamicObject),
    Deleted(DynamicObject),
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, StoreError>>;

/// Extracts zero or more index keys from an object.
pub type IndexFn = Arc<dyn Fn(&DynamicObject) -> Vec<String> + Send + Sync>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(ObjectRef),

    #[error("already exists: {0}")]
    AlreadyExists(ObjectRef),

    /// The write carried a stale resourceVersion.
    #[error("conflict: {0} was modified concurrently")]
    Conflict(ObjectRef),

    #[error("invalid object {object}: {reason}")]
    Invalid { object: String, reason: String },

    #[error("index {index} already registered for {group_kind}")]
    DuplicateIndex { group_kind: GroupKind, index: String },

    #[error("no index {index} registered for {group_kind}")]
    UnknownIndex { group_kind: GroupKind, index: String },

    #[error(transparent)]
    Registry(#[from] steward_core::Error),

    /// Network failures, throttling and server-side timeouts; safe to retry.
    #[error("transient store error: {0}")]
    Transient(String),

    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Conflicts and transient failures; everything else is permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Transient(_))
    }
}

/// The object store the engine converges against.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Registry used to identify objects handed to this store.
    fn registry(&self) -> &TypeRegistry;

    async fn get(&self, r: &ObjectRef) -> Result<DynamicObject, StoreError>;

    /// All objects of `group_kind`, across namespaces, matching `selector`.
    async fn list(&self, group_kind: &GroupKind, selector: &Selector) -> Result<Vec<DynamicObject>, StoreError>;

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    /// Replace the object; fails with `Conflict` when `metadata.resourceVersion` is stale.
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    /// Delete; objects holding finalizers are only marked for deletion.
    async fn delete(&self, r: &ObjectRef) -> Result<(), StoreError>;

    async fn watch(&self, group_kind: &GroupKind, params: &WatchParams) -> Result<WatchStream, StoreError>;

    /// Register a field index. Each (type, name) pair may be registered once.
    fn register_index(&self, group_kind: &GroupKind, name: &str, extract: IndexFn) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
impl<S: ObjectStore + ?Sized> ObjectStore for Arc<S> {
    fn registry(&self) -> &TypeRegistry {
        (**self).registry()
    }

    async fn get(&self, r: &ObjectRef) -> Result<DynamicObject, StoreError> {
        (**self).get(r).await
    }

    async fn list(&self, group_kind: &GroupKind, selector: &Selector) -> Result<Vec<DynamicObject>, StoreError> {
        (**self).list(group_kind, selector).await
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        (**self).create(obj).await
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        (**self).update(obj).await
    }

    async fn delete(&self, r: &ObjectRef) -> Result<(), StoreError> {
        (**self).delete(r).await
    }

    async fn watch(&self, group_kind: &GroupKind, params: &WatchParams) -> Result<WatchStream, StoreError> {
        (**self).watch(group_kind, params).await
    }

    fn register_index(&self, group_kind: &GroupKind, name: &str, extract: IndexFn) -> Result<(), StoreError> {
        (**self).register_index(group_kind, name, extract)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_selector_requires_every_pair() {
        let sel = Selector::Labels([("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())].into());
        let mut meta = ObjectMeta::default();
        assert!(!sel.matches_labels(&meta));
        meta.labels = Some([("a".to_string(), "1".to_string())].into());
        assert!(!sel.matches_labels(&meta));
        meta.labels.as_mut().unwrap().insert("b".into(), "2".into());
        assert!(sel.matches_labels(&meta));
        assert_eq!(sel.label_selector().as_deref(), Some("a=1,b=2"));

        assert!(Selector::Everything.matches_labels(&ObjectMeta::default()));
        assert!(!Selector::index("owner", "x").matches_labels(&meta));
    }

    #[test]
    fn watch_params_scope_by_namespace_and_name() {
        let gk = GroupKind::new("", "ConfigMap");
        let target = ObjectRef::new(&gk, Some("default"), "cma");
        let params = WatchParams::for_object(&target);
        assert!(params.matches(&target));
        assert!(!params.matches(&ObjectRef::new(&gk, Some("default"), "cmb")));
        assert!(!params.matches(&ObjectRef::new(&gk, Some("other"), "cma")));
        assert!(WatchParams::default().matches(&ObjectRef::new(&gk, None, "anything")));
    }

    #[test]
    fn only_conflicts_and_transient_errors_are_retryable() {
        let r = ObjectRef::new(&GroupKind::new("", "ConfigMap"), Some("default"), "cma");
        assert!(StoreError::Conflict(r.clone()).is_retryable());
        assert!(StoreError::Transient("connection reset".into()).is_retryable());
        assert!(!StoreError::NotFound(r.clone()).is_retryable());
        assert!(!StoreError::AlreadyExists(r).is_retryable());
        assert!(!StoreError::Backend("forbidden".into()).is_retryable());
    }
}
