//! Steward kubehub: the object store over a live cluster, and discovery of served resources.
//!
//! Reads and writes go straight to the API server. Field indexes are answered from a reflector
//! cache per dependent type, started by the first index query, so index queries are eventually
//! consistent with writes. Label-selector lists never start a reflector.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::{future, StreamExt};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    runtime::{reflector, watcher, WatchStreamExt},
    Client,
};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use steward_core::{GroupKind, ObjectRef, TypeRegistry};
use steward_store::{IndexFn, ObjectStore, Selector, StoreError, WatchEvent, WatchParams, WatchStream};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Served resources of a registry, in stable group/version/kind order.
pub fn describe_registry(registry: &TypeRegistry) -> Vec<DiscoveredResource> {
    let mut out: Vec<_> = registry
        .iter()
        .map(|rt| DiscoveredResource {
            group: rt.resource.group.clone(),
            version: rt.resource.version.clone(),
            kind: rt.resource.kind.clone(),
            namespaced: rt.namespaced,
        })
        .collect();
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    out
}

/// Build a registry of every served resource (incl. CRDs), at its preferred version.
pub async fn discover(client: Client) -> Result<TypeRegistry> {
    let discovery = Discovery::new(client).run().await?;
    let mut registry = TypeRegistry::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            registry.register(ar, matches!(caps.scope, Scope::Namespaced));
        }
    }
    info!(types = registry.len(), "discovery complete");
    Ok(registry)
}

/// Map an API failure on `r` to the store taxonomy.
pub fn map_kube_error(r: &ObjectRef, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ae) => match ae.code {
            404 => StoreError::NotFound(r.clone()),
            409 if ae.reason == "AlreadyExists" => StoreError::AlreadyExists(r.clone()),
            409 => StoreError::Conflict(r.clone()),
            400 | 422 => StoreError::Invalid { object: r.to_string(), reason: ae.message },
            429 | 500..=599 => StoreError::Transient(format!("{}: {}", ae.reason, ae.message)),
            _ => StoreError::Backend(format!("{} ({}): {}", ae.reason, ae.code, ae.message)),
        },
        kube::Error::HyperError(e) => StoreError::Transient(e.to_string()),
        kube::Error::Service(e) => StoreError::Transient(e.to_string()),
        other => StoreError::Backend(other.to_string()),
    }
}

fn name_selector(name: &str) -> String {
    format!("metadata.name={}", name)
}

#[derive(Default)]
struct Indexes {
    extractors: FxHashMap<(GroupKind, String), IndexFn>,
    readers: FxHashMap<GroupKind, reflector::Store<DynamicObject>>,
}

/// [`ObjectStore`] over the API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    registry: Arc<TypeRegistry>,
    indexes: Arc<Mutex<Indexes>>,
}

impl KubeStore {
    pub fn new(client: Client, registry: Arc<TypeRegistry>) -> Self {
        Self { client, registry, indexes: Arc::default() }
    }

    /// Connect with the ambient kubeconfig and discover every served type.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await?;
        let registry = discover(client.clone()).await?;
        Ok(Self::new(client, Arc::new(registry)))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn resource(&self, gk: &GroupKind) -> Result<(ApiResource, bool), StoreError> {
        let rt = self.registry.lookup(gk)?;
        Ok((rt.resource.clone(), rt.namespaced))
    }

    fn api(&self, gk: &GroupKind, namespace: Option<&str>) -> Result<Api<DynamicObject>, StoreError> {
        let (ar, namespaced) = self.resource(gk)?;
        Ok(match namespace {
            Some(ns) if namespaced => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }

    fn api_for(&self, r: &ObjectRef) -> Result<Api<DynamicObject>, StoreError> {
        self.api(&r.group_kind(), r.namespace())
    }

    /// Reflector cache for `gk`, started on first use.
    fn reader(&self, indexes: &mut Indexes, gk: &GroupKind) -> Result<reflector::Store<DynamicObject>, StoreError> {
        if let Some(reader) = indexes.readers.get(gk) {
            return Ok(reader.clone());
        }
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| StoreError::Backend(format!("index reflector needs a tokio runtime: {}", e)))?;
        let (ar, _) = self.resource(gk)?;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let writer = reflector::store::Writer::new(ar);
        let reader = writer.as_reader();
        let gk_label = gk.to_string();
        let stream = reflector(writer, watcher(api, watcher::Config::default()).default_backoff());
        handle.spawn(async move {
            stream
                .for_each(|ev| {
                    if let Err(e) = ev {
                        warn!(group_kind = %gk_label, error = %e, "index reflector error");
                    }
                    future::ready(())
                })
                .await;
            warn!(group_kind = %gk_label, "index reflector ended");
        });
        info!(group_kind = %gk, "index reflector started");
        indexes.readers.insert(gk.clone(), reader.clone());
        Ok(reader)
    }

    async fn list_indexed(&self, gk: &GroupKind, name: &str, value: &str) -> Result<Vec<DynamicObject>, StoreError> {
        let (extract, reader) = {
            let mut guard = self.indexes.lock().unwrap_or_else(|e| e.into_inner());
            let Some(extract) = guard.extractors.get(&(gk.clone(), name.to_string())).cloned() else {
                return Err(StoreError::UnknownIndex { group_kind: gk.clone(), index: name.to_string() });
            };
            (extract, self.reader(&mut guard, gk)?)
        };
        reader
            .wait_until_ready()
            .await
            .map_err(|e| StoreError::Backend(format!("index cache for {} unavailable: {}", gk, e)))?;
        Ok(reader
            .state()
            .into_iter()
            .filter(|o| extract(o).iter().any(|k| k == value))
            .map(|o| (*o).clone())
            .collect())
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    async fn get(&self, r: &ObjectRef) -> Result<DynamicObject, StoreError> {
        self.api_for(r)?.get(&r.name).await.map_err(|e| map_kube_error(r, e))
    }

    async fn list(&self, group_kind: &GroupKind, selector: &Selector) -> Result<Vec<DynamicObject>, StoreError> {
        let lp = match selector {
            Selector::Index { name, value } => return self.list_indexed(group_kind, name, value).await,
            Selector::Labels(_) => ListParams::default().labels(&selector.label_selector().unwrap_or_default()),
            Selector::Everything => ListParams::default(),
        };
        let api = self.api(group_kind, None)?;
        let list = api.list(&lp).await.map_err(|e| {
            let scope = ObjectRef::new(group_kind, None, "*");
            map_kube_error(&scope, e)
        })?;
        debug!(group_kind = %group_kind, count = list.items.len(), "listed");
        Ok(list.items)
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let r = self.registry.object_ref(obj)?;
        let out = self.api_for(&r)?.create(&PostParams::default(), obj).await;
        metrics::counter!("kube_store_writes", 1u64, "verb" => "create");
        out.map_err(|e| map_kube_error(&r, e))
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let r = self.registry.object_ref(obj)?;
        let out = self.api_for(&r)?.replace(&r.name, &PostParams::default(), obj).await;
        metrics::counter!("kube_store_writes", 1u64, "verb" => "update");
        out.map_err(|e| map_kube_error(&r, e))
    }

    async fn delete(&self, r: &ObjectRef) -> Result<(), StoreError> {
        let out = self.api_for(r)?.delete(&r.name, &DeleteParams::default()).await;
        metrics::counter!("kube_store_writes", 1u64, "verb" => "delete");
        out.map(|_| ()).map_err(|e| map_kube_error(r, e))
    }

    async fn watch(&self, group_kind: &GroupKind, params: &WatchParams) -> Result<WatchStream, StoreError> {
        let api = self.api(group_kind, params.namespace.as_deref())?;
        let mut cfg = watcher::Config::default();
        if let Some(name) = params.name.as_deref() {
            cfg = cfg.fields(&name_selector(name));
        }
        info!(group_kind = %group_kind, ns = ?params.namespace, name = ?params.name, "watch started");
        let stream = watcher(api, cfg).default_backoff().map(|ev| match ev {
            Ok(watcher::Event::Applied(o)) => Ok(WatchEvent::Modified(o)),
            Ok(watcher::Event::Deleted(o)) => Ok(WatchEvent::Deleted(o)),
            Ok(watcher::Event::Restarted(list)) => Ok(WatchEvent::Restarted(list)),
            Err(e) => Err(StoreError::Transient(e.to_string())),
        });
        Ok(stream.boxed())
    }

    fn register_index(&self, group_kind: &GroupKind, name: &str, extract: IndexFn) -> Result<(), StoreError> {
        self.registry.lookup(group_kind)?;
        let mut guard = self.indexes.lock().unwrap_or_else(|e| e.into_inner());
        let key = (group_kind.clone(), name.to_string());
        if guard.extractors.contains_key(&key) {
            return Err(StoreError::DuplicateIndex { group_kind: group_kind.clone(), index: name.to_string() });
        }
        guard.extractors.insert(key, extract);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{} happened", reason),
            reason: reason.into(),
            code,
        })
    }

    fn cm_ref() -> ObjectRef {
        ObjectRef::new(&GroupKind::new("", "ConfigMap"), Some("default"), "cma")
    }

    #[test]
    fn api_errors_map_to_store_taxonomy() {
        let r = cm_ref();
        assert!(map_kube_error(&r, api_error(404, "NotFound")).is_not_found());
        assert!(map_kube_error(&r, api_error(409, "AlreadyExists")).is_already_exists());
        assert!(map_kube_error(&r, api_error(409, "Conflict")).is_conflict());
        assert!(map_kube_error(&r, api_error(429, "TooManyRequests")).is_retryable());
        assert!(map_kube_error(&r, api_error(503, "ServiceUnavailable")).is_retryable());
        assert!(matches!(map_kube_error(&r, api_error(422, "Invalid")), StoreError::Invalid { .. }));
        let forbidden = map_kube_error(&r, api_error(403, "Forbidden"));
        assert!(!forbidden.is_retryable());
        assert!(forbidden.to_string().contains("Forbidden"), "err={}", forbidden);
    }

    #[test]
    fn registry_description_is_sorted_with_gvk_keys() {
        let mut reg = TypeRegistry::new();
        reg.register_kind::<Namespace>(false).register_kind::<ConfigMap>(true);
        let out = describe_registry(&reg);
        let keys: Vec<_> = out.iter().map(|r| r.gvk_key()).collect();
        assert_eq!(keys, vec!["v1/ConfigMap", "v1/Namespace"]);
        assert!(out[0].namespaced);
        assert!(!out[1].namespaced);
    }

    #[tokio::test]
    async fn index_registration_defers_the_reflector() {
        let client = Client::try_from(kube::Config::new("http://127.0.0.1:9".parse().unwrap())).unwrap();
        let mut reg = TypeRegistry::new();
        reg.register_kind::<ConfigMap>(true);
        let store = KubeStore::new(client, Arc::new(reg));
        let gk = GroupKind::new("", "ConfigMap");
        let extract: IndexFn = Arc::new(|_: &DynamicObject| Vec::new());

        store.register_index(&gk, "steward.io/owner", extract.clone()).unwrap();
        assert!(store.indexes.lock().unwrap().readers.is_empty());
        let again = store.register_index(&gk, "steward.io/owner", extract);
        assert!(matches!(again, Err(StoreError::DuplicateIndex { .. })));
        let unknown = store.list(&gk, &Selector::Index { name: "other".into(), value: "x".into() }).await;
        assert!(matches!(unknown, Err(StoreError::UnknownIndex { .. })));
        assert!(store.indexes.lock().unwrap().readers.is_empty());
    }

    #[test]
    fn watch_scopes_by_name_field() {
        assert_eq!(name_selector("cma"), "metadata.name=cma");
    }
}
