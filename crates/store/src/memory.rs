//! In-process object store with API-server semantics: monotonically increasing
//! resourceVersions, optimistic concurrency, generation bumps on spec changes, finalizer-aware
//! deletion, field indexes and replaying watches.
//!
//! Useful for tests and for embedding the engine where no cluster is available.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures::{stream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::DynamicObject;
use rustc_hash::FxHashMap;
use steward_core::{GroupKind, ObjectRef, TypeRegistry};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{IndexFn, ObjectStore, Selector, StoreError, WatchEvent, WatchParams, WatchStream};

const WATCH_CAPACITY: usize = 1024;

#[derive(Clone)]
struct Change {
    object_ref: ObjectRef,
    event: WatchEvent,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectRef, DynamicObject>,
    revision: u64,
    indexes: FxHashMap<(GroupKind, String), IndexFn>,
}

impl State {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

struct Inner {
    registry: Arc<TypeRegistry>,
    state: Mutex<State>,
    events: broadcast::Sender<Change>,
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self { inner: Arc::new(Inner { registry, state: Mutex::new(State::default()), events }) }
    }

    /// Current revision; advances on every committed write.
    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored object, ordered by identity.
    pub fn snapshot(&self) -> Vec<DynamicObject> {
        self.lock().objects.values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means another test thread panicked mid-write; the map is still usable.
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn identify(&self, obj: &DynamicObject) -> Result<ObjectRef, StoreError> {
        let r = self.inner.registry.object_ref(obj)?;
        let rt = self.inner.registry.lookup(&r.group_kind())?;
        if rt.namespaced && r.namespace().is_none() {
            return Err(StoreError::Invalid { object: r.to_string(), reason: "namespace required".into() });
        }
        if !rt.namespaced && r.namespace().is_some() {
            return Err(StoreError::Invalid { object: r.to_string(), reason: "cluster scoped kind".into() });
        }
        Ok(r)
    }

    fn publish(&self, object_ref: ObjectRef, event: WatchEvent) {
        // No receivers is fine: nobody is watching.
        let _ = self.inner.events.send(Change { object_ref, event });
    }
}

/// Body without status: changes here bump `metadata.generation`.
fn spec_of(obj: &DynamicObject) -> serde_json::Value {
    let mut data = obj.data.clone();
    if let Some(o) = data.as_object_mut() {
        o.remove("status");
    }
    data
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    fn registry(&self) -> &TypeRegistry {
        &self.inner.registry
    }

    async fn get(&self, r: &ObjectRef) -> Result<DynamicObject, StoreError> {
        self.lock().objects.get(r).cloned().ok_or_else(|| StoreError::NotFound(r.clone()))
    }

    async fn list(&self, group_kind: &GroupKind, selector: &Selector) -> Result<Vec<DynamicObject>, StoreError> {
        self.inner.registry.lookup(group_kind)?;
        let state = self.lock();
        let of_kind = state.objects.iter().filter(|(r, _)| r.group == group_kind.group && r.kind == group_kind.kind);
        let out = match selector {
            Selector::Index { name, value } => {
                let extract = state.indexes.get(&(group_kind.clone(), name.clone())).ok_or_else(|| {
                    StoreError::UnknownIndex { group_kind: group_kind.clone(), index: name.clone() }
                })?;
                of_kind.filter(|(_, o)| extract(o).iter().any(|k| k == value)).map(|(_, o)| o.clone()).collect()
            }
            _ => of_kind.filter(|(_, o)| selector.matches_labels(&o.metadata)).map(|(_, o)| o.clone()).collect(),
        };
        Ok(out)
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let r = self.identify(obj)?;
        let mut state = self.lock();
        if state.objects.contains_key(&r) {
            return Err(StoreError::AlreadyExists(r));
        }
        let mut stored = obj.clone();
        stored.metadata.resource_version = Some(state.next_revision());
        stored.metadata.uid = Some(Uuid::new_v4().to_string());
        stored.metadata.creation_timestamp = Some(Time(Utc::now()));
        stored.metadata.generation = Some(1);
        stored.metadata.deletion_timestamp = None;
        state.objects.insert(r.clone(), stored.clone());
        debug!(object = %r, rv = ?stored.metadata.resource_version, "created");
        self.publish(r, WatchEvent::Added(stored.clone()));
        Ok(stored)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let r = self.identify(obj)?;
        let mut state = self.lock();
        let current = state.objects.get(&r).cloned().ok_or_else(|| StoreError::NotFound(r.clone()))?;
        if let Some(rv) = obj.metadata.resource_version.as_deref().filter(|rv| !rv.is_empty()) {
            if Some(rv) != current.metadata.resource_version.as_deref() {
                return Err(StoreError::Conflict(r));
            }
        }

        let mut next = obj.clone();
        next.metadata.uid = current.metadata.uid.clone();
        next.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        next.metadata.deletion_timestamp = current.metadata.deletion_timestamp.clone();
        next.metadata.resource_version = current.metadata.resource_version.clone();
        next.metadata.generation = current.metadata.generation;
        if spec_of(&next) != spec_of(&current) {
            next.metadata.generation = Some(current.metadata.generation.unwrap_or(0) + 1);
        }
        if next == current {
            return Ok(current);
        }

        next.metadata.resource_version = Some(state.next_revision());
        let finalized = next.metadata.finalizers.as_ref().map_or(true, |f| f.is_empty());
        if next.metadata.deletion_timestamp.is_some() && finalized {
            state.objects.remove(&r);
            debug!(object = %r, "last finalizer removed; deleted");
            self.publish(r, WatchEvent::Deleted(next.clone()));
            return Ok(next);
        }
        state.objects.insert(r.clone(), next.clone());
        debug!(object = %r, rv = ?next.metadata.resource_version, "updated");
        self.publish(r, WatchEvent::Modified(next.clone()));
        Ok(next)
    }

    async fn delete(&self, r: &ObjectRef) -> Result<(), StoreError> {
        let mut state = self.lock();
        let mut current = state.objects.get(r).cloned().ok_or_else(|| StoreError::NotFound(r.clone()))?;
        let has_finalizers = current.metadata.finalizers.as_ref().map_or(false, |f| !f.is_empty());
        if has_finalizers {
            if current.metadata.deletion_timestamp.is_none() {
                current.metadata.deletion_timestamp = Some(Time(Utc::now()));
                current.metadata.resource_version = Some(state.next_revision());
                state.objects.insert(r.clone(), current.clone());
                debug!(object = %r, "marked for deletion; waiting on finalizers");
                self.publish(r.clone(), WatchEvent::Modified(current));
            }
            return Ok(());
        }
        state.objects.remove(r);
        current.metadata.resource_version = Some(state.next_revision());
        debug!(object = %r, "deleted");
        self.publish(r.clone(), WatchEvent::Deleted(current));
        Ok(())
    }

    async fn watch(&self, group_kind: &GroupKind, params: &WatchParams) -> Result<WatchStream, StoreError> {
        self.inner.registry.lookup(group_kind)?;
        let gk = group_kind.clone();
        let params = params.clone();
        let in_scope = move |r: &ObjectRef| r.group == gk.group && r.kind == gk.kind && params.matches(r);

        // Subscribe and snapshot under the same lock so no write falls between them.
        let (rx, initial) = {
            let state = self.lock();
            let rx = self.inner.events.subscribe();
            let initial: Vec<_> = state.objects.iter().filter(|(r, _)| in_scope(r)).map(|(_, o)| o.clone()).collect();
            (rx, initial)
        };

        let live = stream::unfold(Some(rx), move |rx| {
            let in_scope = in_scope.clone();
            async move {
                let mut rx = rx?;
                loop {
                    match rx.recv().await {
                        Ok(change) if in_scope(&change.object_ref) => return Some((Ok(change.event), Some(rx))),
                        Ok(_) => continue,
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "watch consumer lagged; closing stream");
                            let err = StoreError::Transient(format!("watch lagged by {} events", missed));
                            return Some((Err(err), None));
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream::once(async move { Ok(WatchEvent::Restarted(initial)) }).chain(live).boxed())
    }

    fn register_index(&self, group_kind: &GroupKind, name: &str, extract: IndexFn) -> Result<(), StoreError> {
        let mut state = self.lock();
        let key = (group_kind.clone(), name.to_string());
        if state.indexes.contains_key(&key) {
            return Err(StoreError::DuplicateIndex { group_kind: group_kind.clone(), index: name.to_string() });
        }
        state.indexes.insert(key, extract);
        Ok(())
    }
}
