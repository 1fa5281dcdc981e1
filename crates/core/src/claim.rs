//! Owner claims: the link stored on a dependent object back to the owner(s) it exists for.
//!
//! Two encodings share one codec:
//!
//! - [`ClaimMode::Exclusive`] keeps a single claim in three labels. Labels are indexed by the
//!   API server, so owned objects can be listed with a plain label selector. Claiming an object
//!   that already has an owner overwrites the previous claim (last writer wins).
//! - [`ClaimMode::Shared`] keeps a JSON array of [`ObjectRef`] in one annotation, so several
//!   owners can claim the same dependent. The dependent is only garbage collected once the last
//!   claim is gone.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{Error, GroupKind, ObjectRef, Result};

/// Annotation holding the shared claim set.
pub const OWNER_ANNOTATION: &str = "steward.io/owner";
/// Labels holding the exclusive claim.
pub const OWNER_NAME_LABEL: &str = "owner.steward.io/name";
pub const OWNER_NAMESPACE_LABEL: &str = "owner.steward.io/namespace";
pub const OWNER_TYPE_LABEL: &str = "owner.steward.io/type";

pub type Claims = SmallVec<[ObjectRef; 2]>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimMode {
    Exclusive,
    #[default]
    Shared,
}

impl fmt::Display for ClaimMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exclusive => write!(f, "exclusive"),
            Self::Shared => write!(f, "shared"),
        }
    }
}

impl FromStr for ClaimMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exclusive" => Ok(Self::Exclusive),
            "shared" => Ok(Self::Shared),
            other => Err(format!("unknown claim mode {:?} (expected shared or exclusive)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClaimCodec {
    mode: ClaimMode,
}

impl ClaimCodec {
    pub fn new(mode: ClaimMode) -> Self {
        Self { mode }
    }

    pub fn exclusive() -> Self {
        Self::new(ClaimMode::Exclusive)
    }

    pub fn shared() -> Self {
        Self::new(ClaimMode::Shared)
    }

    pub fn mode(&self) -> ClaimMode {
        self.mode
    }

    /// Record `owner`'s claim on the dependent. Returns whether the metadata changed.
    pub fn insert(&self, owner: &ObjectRef, meta: &mut ObjectMeta) -> Result<bool> {
        match self.mode {
            ClaimMode::Exclusive => {
                let labels = meta.labels.get_or_insert_with(BTreeMap::new);
                let mut changed = false;
                for (k, v) in exclusive_labels(owner) {
                    if labels.get(k) != Some(&v) {
                        labels.insert(k.to_string(), v);
                        changed = true;
                    }
                }
                Ok(changed)
            }
            ClaimMode::Shared => {
                let mut refs = shared_claims(meta)?;
                if refs.iter().any(|r| r == owner) {
                    return Ok(false);
                }
                refs.push(owner.clone());
                set_shared_claims(meta, &refs)?;
                Ok(true)
            }
        }
    }

    /// Drop `owner`'s claim from the dependent. Returns whether the metadata changed.
    ///
    /// In exclusive mode the labels are only cleared when they name `owner`; a claim taken over
    /// by another owner is left alone.
    pub fn remove(&self, owner: &ObjectRef, meta: &mut ObjectMeta) -> Result<bool> {
        match self.mode {
            ClaimMode::Exclusive => {
                if exclusive_claim(meta)?.as_ref() != Some(owner) {
                    return Ok(false);
                }
                if let Some(labels) = meta.labels.as_mut() {
                    labels.remove(OWNER_NAME_LABEL);
                    labels.remove(OWNER_NAMESPACE_LABEL);
                    labels.remove(OWNER_TYPE_LABEL);
                }
                Ok(true)
            }
            ClaimMode::Shared => {
                let mut refs = shared_claims(meta)?;
                let Some(pos) = refs.iter().position(|r| r == owner) else {
                    return Ok(false);
                };
                refs.remove(pos);
                set_shared_claims(meta, &refs)?;
                Ok(true)
            }
        }
    }

    pub fn is_claimed(&self, meta: &ObjectMeta) -> Result<bool> {
        Ok(!self.claims_of(meta)?.is_empty())
    }

    pub fn claims_of(&self, meta: &ObjectMeta) -> Result<Claims> {
        match self.mode {
            ClaimMode::Exclusive => Ok(exclusive_claim(meta)?.into_iter().collect()),
            ClaimMode::Shared => Ok(shared_claims(meta)?.into_iter().collect()),
        }
    }

    /// Whether `owner` is among the dependent's claimants.
    pub fn is_claimed_by(&self, owner: &ObjectRef, meta: &ObjectMeta) -> Result<bool> {
        Ok(self.claims_of(meta)?.iter().any(|r| r == owner))
    }

    /// Index keys of the dependent: one per claim.
    pub fn index_keys(&self, meta: &ObjectMeta) -> Result<Vec<String>> {
        self.claims_of(meta)?.iter().map(index_key).collect()
    }

    /// Label equality selector matching dependents exclusively claimed by `owner`.
    pub fn owner_labels(&self, owner: &ObjectRef) -> BTreeMap<String, String> {
        exclusive_labels(owner).into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }
}

/// Index key for an owner: its JSON encoded reference.
pub fn index_key(owner: &ObjectRef) -> Result<String> {
    Ok(serde_json::to_string(owner)?)
}

fn exclusive_labels(owner: &ObjectRef) -> [(&'static str, String); 3] {
    [
        (OWNER_NAME_LABEL, owner.name.clone()),
        (OWNER_NAMESPACE_LABEL, owner.namespace.clone()),
        (OWNER_TYPE_LABEL, owner.group_kind().to_string()),
    ]
}

fn describe(meta: &ObjectMeta) -> String {
    match (&meta.namespace, &meta.name) {
        (Some(ns), Some(name)) => format!("{}/{}", ns, name),
        (None, Some(name)) => name.clone(),
        _ => "<unnamed>".to_string(),
    }
}

fn exclusive_claim(meta: &ObjectMeta) -> Result<Option<ObjectRef>> {
    let Some(labels) = meta.labels.as_ref() else {
        return Ok(None);
    };
    let name = labels.get(OWNER_NAME_LABEL).filter(|v| !v.is_empty());
    let kind = labels.get(OWNER_TYPE_LABEL).filter(|v| !v.is_empty());
    let namespace = labels.get(OWNER_NAMESPACE_LABEL).cloned().unwrap_or_default();
    match (name, kind) {
        (None, None) => Ok(None),
        (Some(name), Some(kind)) => {
            let gk = GroupKind::parse(kind)
                .ok_or_else(|| Error::corrupt_claim(describe(meta), format!("invalid owner type {:?}", kind)))?;
            Ok(Some(ObjectRef::new(&gk, Some(namespace.as_str()), name.clone())))
        }
        _ => Err(Error::corrupt_claim(describe(meta), "incomplete owner labels")),
    }
}

fn shared_claims(meta: &ObjectMeta) -> Result<Vec<ObjectRef>> {
    let Some(raw) = meta.annotations.as_ref().and_then(|a| a.get(OWNER_ANNOTATION)) else {
        return Ok(Vec::new());
    };
    serde_json::from_str(raw).map_err(|e| Error::corrupt_claim(describe(meta), e.to_string()))
}

fn set_shared_claims(meta: &mut ObjectMeta, refs: &[ObjectRef]) -> Result<()> {
    if refs.is_empty() {
        if let Some(annotations) = meta.annotations.as_mut() {
            annotations.remove(OWNER_ANNOTATION);
        }
        return Ok(());
    }
    let raw = serde_json::to_string(refs)?;
    meta.annotations.get_or_insert_with(BTreeMap::new).insert(OWNER_ANNOTATION.to_string(), raw);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(name: &str) -> ObjectRef {
        ObjectRef::new(&GroupKind::new("catalog.steward.io", "Account"), Some("steward-system"), name)
    }

    fn dependent() -> ObjectMeta {
        ObjectMeta { name: Some("cma".into()), namespace: Some("default".into()), ..Default::default() }
    }

    #[test]
    fn shared_claims_behave_like_a_set() {
        let codec = ClaimCodec::shared();
        let mut meta = dependent();
        assert!(!codec.is_claimed(&meta).unwrap());

        assert!(codec.insert(&owner("o1"), &mut meta).unwrap());
        assert!(!codec.insert(&owner("o1"), &mut meta).unwrap(), "second insert is a no-op");
        assert!(codec.insert(&owner("o2"), &mut meta).unwrap());
        let claims = codec.claims_of(&meta).unwrap();
        assert_eq!(claims.as_slice(), &[owner("o1"), owner("o2")]);

        assert!(!codec.remove(&owner("o3"), &mut meta).unwrap(), "removing an absent claim is a no-op");
        assert!(codec.remove(&owner("o1"), &mut meta).unwrap());
        assert!(codec.is_claimed_by(&owner("o2"), &meta).unwrap());
        assert!(!codec.is_claimed_by(&owner("o1"), &meta).unwrap());

        assert!(codec.remove(&owner("o2"), &mut meta).unwrap());
        assert!(!codec.is_claimed(&meta).unwrap());
        assert!(!meta.annotations.unwrap().contains_key(OWNER_ANNOTATION), "empty set drops the annotation");
    }

    #[test]
    fn shared_encoding_is_a_json_list() {
        let codec = ClaimCodec::shared();
        let mut meta = dependent();
        codec.insert(&owner("o1"), &mut meta).unwrap();
        let raw = &meta.annotations.as_ref().unwrap()[OWNER_ANNOTATION];
        assert_eq!(
            raw,
            r#"[{"name":"o1","namespace":"steward-system","group":"catalog.steward.io","kind":"Account"}]"#
        );
        assert_eq!(codec.index_keys(&meta).unwrap(), vec![index_key(&owner("o1")).unwrap()]);
    }

    #[test]
    fn exclusive_claim_is_overwritten_on_reassignment() {
        let codec = ClaimCodec::exclusive();
        let mut meta = dependent();
        assert!(codec.insert(&owner("o1"), &mut meta).unwrap());
        assert!(!codec.insert(&owner("o1"), &mut meta).unwrap());
        let labels = meta.labels.as_ref().unwrap();
        assert_eq!(labels[OWNER_NAME_LABEL], "o1");
        assert_eq!(labels[OWNER_NAMESPACE_LABEL], "steward-system");
        assert_eq!(labels[OWNER_TYPE_LABEL], "Account.catalog.steward.io");

        assert!(codec.insert(&owner("o2"), &mut meta).unwrap());
        assert_eq!(codec.claims_of(&meta).unwrap().as_slice(), &[owner("o2")]);

        assert!(!codec.remove(&owner("o1"), &mut meta).unwrap(), "displaced owner cannot release the claim");
        assert!(codec.remove(&owner("o2"), &mut meta).unwrap());
        assert!(!codec.is_claimed(&meta).unwrap());
    }

    #[test]
    fn exclusive_claim_supports_cluster_scoped_owners() {
        let codec = ClaimCodec::exclusive();
        let mut meta = dependent();
        let cluster_owner = ObjectRef::new(&GroupKind::new("", "Namespace"), None, "tenant-a");
        codec.insert(&cluster_owner, &mut meta).unwrap();
        assert_eq!(codec.claims_of(&meta).unwrap().as_slice(), &[cluster_owner.clone()]);
        assert_eq!(codec.owner_labels(&cluster_owner)[OWNER_TYPE_LABEL], "Namespace");
    }

    #[test]
    fn malformed_claims_are_reported() {
        let mut meta = dependent();
        meta.annotations = Some([(OWNER_ANNOTATION.to_string(), "{not json".to_string())].into_iter().collect());
        let err = ClaimCodec::shared().claims_of(&meta).unwrap_err();
        assert!(matches!(err, Error::CorruptClaim { .. }));
        assert!(err.to_string().contains("default/cma"), "err={}", err);

        let mut meta = dependent();
        meta.labels = Some([(OWNER_NAME_LABEL.to_string(), "o1".to_string())].into_iter().collect());
        assert!(matches!(ClaimCodec::exclusive().is_claimed(&meta), Err(Error::CorruptClaim { .. })));
    }

    #[test]
    fn claim_mode_parses_case_insensitively() {
        assert_eq!("Shared".parse::<ClaimMode>().unwrap(), ClaimMode::Shared);
        assert_eq!("exclusive".parse::<ClaimMode>().unwrap(), ClaimMode::Exclusive);
        assert!("both".parse::<ClaimMode>().is_err());
        assert_eq!(ClaimMode::default().to_string(), "shared");
    }
}
