//! Reverse index: owner identity to the dependents that claim it.

use std::sync::Arc;

use kube::core::DynamicObject;
use steward_core::{claim, ClaimCodec, ClaimMode, GroupKind, ObjectRef};
use steward_store::{IndexFn, ObjectStore, Selector, StoreError};
use tracing::error;

/// Name of the field index registered per dependent type.
pub const OWNER_INDEX: &str = "steward.io/owner";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OwnerIndex {
    codec: ClaimCodec,
}

impl OwnerIndex {
    pub fn new(codec: ClaimCodec) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> &ClaimCodec {
        &self.codec
    }

    /// Extractor yielding one key per claim. Corrupt claims are logged and yield nothing.
    pub fn extractor(&self) -> IndexFn {
        let codec = self.codec;
        Arc::new(move |obj: &DynamicObject| match codec.index_keys(&obj.metadata) {
            Ok(keys) => keys,
            Err(e) => {
                error!(name = ?obj.metadata.name, ns = ?obj.metadata.namespace, error = %e, "unindexable owner claim");
                Vec::new()
            }
        })
    }

    /// Register the owner index for a dependent type. Fails if already registered.
    pub fn register<S: ObjectStore + ?Sized>(&self, store: &S, group_kind: &GroupKind) -> Result<(), StoreError> {
        store.register_index(group_kind, OWNER_INDEX, self.extractor())
    }

    /// Store filter selecting the dependents claimed by `owner`.
    pub fn query_owner(&self, owner: &ObjectRef) -> steward_core::Result<Selector> {
        Ok(match self.codec.mode() {
            ClaimMode::Exclusive => Selector::Labels(self.codec.owner_labels(owner)),
            ClaimMode::Shared => Selector::index(OWNER_INDEX, claim::index_key(owner)?),
        })
    }

    /// Owners of `owner_kind` claiming `dependent`, for fanning dependent events out to owner
    /// reconciles. A corrupt claim yields no owners.
    pub fn owners_of(&self, dependent: &DynamicObject, owner_kind: &GroupKind) -> Vec<ObjectRef> {
        match self.codec.claims_of(&dependent.metadata) {
            Ok(claims) => claims.into_iter().filter(|o| o.group == owner_kind.group && o.kind == owner_kind.kind).collect(),
            Err(e) => {
                error!(
                    name = ?dependent.metadata.name,
                    ns = ?dependent.metadata.namespace,
                    error = %e,
                    "cannot map dependent to owners"
                );
                Vec::new()
            }
        }
    }
}
