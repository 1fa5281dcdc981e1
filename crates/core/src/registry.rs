//! Explicit type registry: maps apiVersion/kind and group/kind to served API resources.
//!
//! A registry is an ordinary value built once at start-up (by hand or from cluster discovery)
//! and shared by reference, so tests and multi-cluster processes can hold several of them.

use kube::core::{ApiResource, DynamicObject};
use rustc_hash::FxHashMap;

use crate::{Error, GroupKind, ObjectRef, Result};

#[derive(Debug, Clone)]
pub struct RegisteredType {
    pub resource: ApiResource,
    pub namespaced: bool,
}

impl RegisteredType {
    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(self.resource.group.clone(), self.resource.kind.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    by_api_version: FxHashMap<(String, String), GroupKind>,
    by_group_kind: FxHashMap<GroupKind, RegisteredType>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a served resource. Re-registering the same group/kind replaces its version.
    pub fn register(&mut self, resource: ApiResource, namespaced: bool) -> &mut Self {
        let gk = GroupKind::new(resource.group.clone(), resource.kind.clone());
        self.by_api_version.insert((resource.api_version.clone(), resource.kind.clone()), gk.clone());
        self.by_group_kind.insert(gk, RegisteredType { resource, namespaced });
        self
    }

    /// Register a statically typed resource such as `k8s_openapi::api::core::v1::ConfigMap`.
    pub fn register_kind<K>(&mut self, namespaced: bool) -> &mut Self
    where
        K: kube::Resource<DynamicType = ()>,
    {
        self.register(ApiResource::erase::<K>(&()), namespaced)
    }

    pub fn len(&self) -> usize {
        self.by_group_kind.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_group_kind.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredType> {
        self.by_group_kind.values()
    }

    pub fn lookup(&self, gk: &GroupKind) -> Result<&RegisteredType> {
        self.by_group_kind.get(gk).ok_or_else(|| Error::UnregisteredGroupKind(gk.to_string()))
    }

    /// Resolve a `v1/ConfigMap` or `group/v1/Kind` key.
    pub fn lookup_key(&self, key: &str) -> Result<&RegisteredType> {
        let (api_version, kind) = key.rsplit_once('/').ok_or_else(|| Error::UnregisteredType {
            api_version: String::new(),
            kind: key.to_string(),
        })?;
        let gk = self
            .by_api_version
            .get(&(api_version.to_string(), kind.to_string()))
            .ok_or_else(|| Error::UnregisteredType { api_version: api_version.to_string(), kind: kind.to_string() })?;
        self.lookup(gk)
    }

    /// Group/kind of an in-memory object, from its TypeMeta.
    pub fn resolve(&self, obj: &DynamicObject) -> Result<GroupKind> {
        let types = obj.types.as_ref().ok_or_else(|| Error::MissingTypeMeta { name: obj.metadata.name.clone() })?;
        self.by_api_version
            .get(&(types.api_version.clone(), types.kind.clone()))
            .cloned()
            .ok_or_else(|| Error::UnregisteredType { api_version: types.api_version.clone(), kind: types.kind.clone() })
    }

    pub fn object_ref(&self, obj: &DynamicObject) -> Result<ObjectRef> {
        let gk = self.resolve(obj)?;
        let name = obj.metadata.name.clone().ok_or_else(|| Error::MissingName { kind: gk.to_string() })?;
        Ok(ObjectRef::new(&gk, obj.metadata.namespace.as_deref(), name))
    }
}
