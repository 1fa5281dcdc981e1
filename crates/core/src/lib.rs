//! Steward core types: object identities, owner claims and status conditions.

#![forbid(unsafe_code)]

use std::fmt;

use kube::core::DynamicObject;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub mod claim;
pub mod condition;
pub mod error;
pub mod finalizer;
pub mod generation;
pub mod registry;

pub use claim::{ClaimCodec, ClaimMode};
pub use condition::{is_ready, CommonStatus, Condition, ConditionStatus, HasConditions, Phase};
pub use error::{Error, Result};
pub use registry::{RegisteredType, TypeRegistry};

pub mod prelude {
    pub use super::{
        ClaimCodec, ClaimMode, CommonStatus, Condition, ConditionStatus, GroupKind, HasConditions, ObjectRef, Phase,
        TypeRegistry,
    };
}

/// API group plus kind, version independent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), kind: kind.into() }
    }

    /// Parse the `Kind` / `Kind.group` form produced by `Display`.
    pub fn parse(s: &str) -> Option<Self> {
        let (kind, group) = match s.split_once('.') {
            Some((k, g)) => (k, g),
            None => (s, ""),
        };
        if kind.is_empty() {
            return None;
        }
        Some(Self::new(group, kind))
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// Stable identity of an object in the store.
///
/// Field order matters: it fixes both the serialized form stored in shared claims and the
/// ordering used when iterating sets of references.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub group: String,
    pub kind: String,
}

impl ObjectRef {
    pub fn new(gk: &GroupKind, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.unwrap_or_default().to_string(),
            group: gk.group.clone(),
            kind: gk.kind.clone(),
        }
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(self.group.clone(), self.kind.clone())
    }

    /// Namespace, or `None` for cluster scoped objects.
    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(&self.namespace)
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gk = self.group_kind();
        match self.namespace() {
            Some(ns) => write!(f, "{} {}/{}", gk, ns, self.name),
            None => write!(f, "{} {}", gk, self.name),
        }
    }
}

/// Convert a typed resource (e.g. a k8s-openapi `ConfigMap`) into a `DynamicObject`.
pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject> {
    let value = serde_json::to_value(obj)?;
    Ok(serde_json::from_value(value)?)
}

/// Convert a `DynamicObject` back into a typed resource.
pub fn from_dynamic<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K> {
    let value = serde_json::to_value(obj)?;
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    #[test]
    fn group_kind_display_round_trips_through_parse() {
        let core = GroupKind::new("", "ConfigMap");
        assert_eq!(core.to_string(), "ConfigMap");
        assert_eq!(GroupKind::parse("ConfigMap"), Some(core));

        let custom = GroupKind::new("catalog.steward.io", "Account");
        assert_eq!(custom.to_string(), "Account.catalog.steward.io");
        assert_eq!(GroupKind::parse("Account.catalog.steward.io"), Some(custom));

        assert_eq!(GroupKind::parse(""), None);
        assert_eq!(GroupKind::parse(".apps"), None);
    }

    #[test]
    fn object_ref_serializes_in_claim_field_order() {
        let r = ObjectRef::new(&GroupKind::new("apps", "Deployment"), Some("ns"), "web");
        let s = serde_json::to_string(&r).unwrap();
        assert_eq!(s, r#"{"name":"web","namespace":"ns","group":"apps","kind":"Deployment"}"#);
        assert_eq!(r.to_string(), "Deployment.apps ns/web");
    }

    #[test]
    fn typed_resources_convert_through_dynamic() {
        let cm = ConfigMap {
            metadata: ObjectMeta { name: Some("cma".into()), namespace: Some("default".into()), ..Default::default() },
            data: Some([("cm".to_string(), "a".to_string())].into_iter().collect()),
            ..Default::default()
        };
        let dynamic = to_dynamic(&cm).unwrap();
        let types = dynamic.types.as_ref().unwrap();
        assert_eq!(types.api_version, "v1");
        assert_eq!(types.kind, "ConfigMap");
        assert_eq!(dynamic.data["data"]["cm"], "a");

        let back: ConfigMap = from_dynamic(&dynamic).unwrap();
        assert_eq!(back, cm);
    }
}
