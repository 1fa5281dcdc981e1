//! The convergence engine: make the set of objects an owner claims equal a desired set.
//!
//! For one (owner, types) pair the engine lists the dependents currently claimed by the owner,
//! drops its claim from every dependent no longer desired (deleting dependents left without
//! claims), then creates or updates every desired object with the owner's claim attached. All
//! writes use optimistic concurrency; conflicts and transient store errors re-read and retry with
//! backoff inside the call deadline. Repeating a call with the same desired set writes nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use kube::core::DynamicObject;
use serde::Serialize;
use steward_core::{ClaimCodec, GroupKind, ObjectRef};
use steward_store::{ObjectStore, StoreError};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ConvergeConfig;
use crate::index::OwnerIndex;
use crate::retry::{retry_with_backoff, RetryConfig};

/// Reconciles an already existing object with the wanted one: `merge(current, wanted)`.
///
/// `current` already carries the owner's claim. Must be pure and idempotent; it can run once
/// per retry.
pub type MergeFn = dyn Fn(&DynamicObject, &DynamicObject) -> anyhow::Result<DynamicObject> + Send + Sync;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConvergeError {
    #[error("desired set contains {0} twice")]
    DuplicateDesired(ObjectRef),

    #[error("desired object {object} is not one of the converged types")]
    OutsideTypeFilter { object: ObjectRef },

    /// Unregistered type or missing identity; a configuration error.
    #[error("cannot identify object: {0}")]
    Registry(#[source] steward_core::Error),

    #[error("owner claim on {object}: {source}")]
    Claim {
        object: ObjectRef,
        #[source]
        source: steward_core::Error,
    },

    #[error("{op} {object} for owner {owner}: {source}")]
    Store {
        op: &'static str,
        object: ObjectRef,
        owner: ObjectRef,
        #[source]
        source: StoreError,
    },

    #[error("listing {group_kind} owned by {owner}: {source}")]
    List {
        group_kind: GroupKind,
        owner: ObjectRef,
        #[source]
        source: StoreError,
    },

    #[error("merge {object}: {source}")]
    Merge {
        object: ObjectRef,
        #[source]
        source: anyhow::Error,
    },
}

impl ConvergeError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Store { source, .. } | Self::List { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

/// Which objects a converge call touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConvergeReport {
    pub created: Vec<ObjectRef>,
    pub updated: Vec<ObjectRef>,
    /// Dependents that lost this owner's claim but are still claimed by others.
    pub released: Vec<ObjectRef>,
    pub deleted: Vec<ObjectRef>,
}

impl ConvergeReport {
    /// Whether any store mutation happened.
    pub fn changed(&self) -> bool {
        !(self.created.is_empty() && self.updated.is_empty() && self.released.is_empty() && self.deleted.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Upserted {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Released {
    /// Claim removed; other owners keep the dependent alive.
    ClaimRemoved,
    /// Last claim removed; delete issued.
    Deleted,
    /// Last claim already removed by an earlier call; deletion is pending on finalizers.
    Terminating,
    /// Already gone.
    Gone,
    /// Not claimed by this owner (stale index, or exclusive claim taken over).
    NotClaimed,
}

pub struct Converger<S> {
    store: S,
    index: OwnerIndex,
    retry: RetryConfig,
    deadline: std::time::Duration,
}

impl<S: ObjectStore> Converger<S> {
    pub fn new(store: S, config: &ConvergeConfig) -> Self {
        Self {
            store,
            index: OwnerIndex::new(ClaimCodec::new(config.claim_mode)),
            retry: config.retry.clone(),
            deadline: config.deadline,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn index(&self) -> &OwnerIndex {
        &self.index
    }

    fn codec(&self) -> &ClaimCodec {
        self.index.codec()
    }

    /// Register the owner index for each dependent type. Call once per type at start-up.
    pub fn register(&self, types: &[GroupKind]) -> Result<(), StoreError> {
        for gk in types {
            self.index.register(&self.store, gk)?;
        }
        Ok(())
    }

    /// Dependents of `types` currently claimed by `owner`.
    ///
    /// Index hits whose stored claims do not name the owner are dropped.
    pub async fn list_owned(&self, owner: &ObjectRef, types: &[GroupKind]) -> Result<Vec<DynamicObject>, ConvergeError> {
        self.list_owned_until(owner, types, tokio::time::Instant::now() + self.deadline).await
    }

    async fn list_owned_until(
        &self,
        owner: &ObjectRef,
        types: &[GroupKind],
        deadline: tokio::time::Instant,
    ) -> Result<Vec<DynamicObject>, ConvergeError> {
        let selector = &self.index.query_owner(owner).map_err(ConvergeError::Registry)?;
        let mut out = Vec::new();
        for gk in types {
            let items = retry_with_backoff(&self.retry, Some(deadline), "list", ConvergeError::is_retryable, || async move {
                self.store.list(gk, selector).await.map_err(|source| ConvergeError::List {
                    group_kind: gk.clone(),
                    owner: owner.clone(),
                    source,
                })
            })
            .await?;
            for obj in items {
                let object = self.store.registry().object_ref(&obj).map_err(ConvergeError::Registry)?;
                let claimed = self
                    .codec()
                    .is_claimed_by(owner, &obj.metadata)
                    .map_err(|source| ConvergeError::Claim { object: object.clone(), source })?;
                if claimed {
                    out.push(obj);
                } else {
                    debug!(object = %object, owner = %owner, "ignoring stale index entry");
                }
            }
        }
        Ok(out)
    }

    /// Converge the dependents of `owner` among `types` to `desired`.
    ///
    /// Every desired object must be of one of `types` and appear once; both are checked before
    /// anything is written.
    pub async fn converge(
        &self,
        owner: &ObjectRef,
        desired: Vec<DynamicObject>,
        types: &[GroupKind],
        merge: Option<&MergeFn>,
    ) -> Result<ConvergeReport, ConvergeError> {
        metrics::counter!("converge_calls", 1u64);
        let started = Instant::now();
        let res = self.converge_inner(owner, desired, types, merge).await;
        metrics::histogram!("converge_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(report) => {
                metrics::counter!("converge_created", report.created.len() as u64);
                metrics::counter!("converge_updated", report.updated.len() as u64);
                metrics::counter!("converge_released", report.released.len() as u64);
                metrics::counter!("converge_deleted", report.deleted.len() as u64);
                if report.changed() {
                    info!(
                        owner = %owner,
                        created = report.created.len(),
                        updated = report.updated.len(),
                        released = report.released.len(),
                        deleted = report.deleted.len(),
                        "converged"
                    );
                }
            }
            Err(_) => {
                metrics::counter!("converge_err", 1u64);
            }
        }
        res
    }

    async fn converge_inner(
        &self,
        owner: &ObjectRef,
        desired: Vec<DynamicObject>,
        types: &[GroupKind],
        merge: Option<&MergeFn>,
    ) -> Result<ConvergeReport, ConvergeError> {
        let deadline = tokio::time::Instant::now() + self.deadline;

        let mut wanted: BTreeMap<ObjectRef, DynamicObject> = BTreeMap::new();
        for obj in desired {
            let object = self.store.registry().object_ref(&obj).map_err(ConvergeError::Registry)?;
            if !types.contains(&object.group_kind()) {
                return Err(ConvergeError::OutsideTypeFilter { object });
            }
            if wanted.contains_key(&object) {
                return Err(ConvergeError::DuplicateDesired(object));
            }
            wanted.insert(object, obj);
        }

        let mut existing = BTreeSet::new();
        for obj in self.list_owned_until(owner, types, deadline).await? {
            existing.insert(self.store.registry().object_ref(&obj).map_err(ConvergeError::Registry)?);
        }

        let mut report = ConvergeReport::default();
        for object in existing.iter().filter(|r| !wanted.contains_key(*r)) {
            match self.release_with_retry(owner, object, deadline).await? {
                Released::ClaimRemoved => report.released.push(object.clone()),
                Released::Deleted => report.deleted.push(object.clone()),
                Released::Terminating | Released::Gone | Released::NotClaimed => {}
            }
        }

        for (object, obj) in &wanted {
            let observed = existing.contains(object);
            match self.upsert(owner, object, obj, observed, merge, deadline).await? {
                Upserted::Created => report.created.push(object.clone()),
                Upserted::Updated => report.updated.push(object.clone()),
                Upserted::Unchanged => {}
            }
        }
        Ok(report)
    }

    /// Drop `owner`'s claim from every dependent of `types`, deleting dependents left unclaimed.
    ///
    /// Returns true once no dependent of the owner remains; false while deleted dependents are
    /// still terminating. Safe to call repeatedly.
    pub async fn release(&self, owner: &ObjectRef, types: &[GroupKind]) -> Result<bool, ConvergeError> {
        let deadline = tokio::time::Instant::now() + self.deadline;
        let mut cleaned_up = true;
        for obj in self.list_owned_until(owner, types, deadline).await? {
            let object = self.store.registry().object_ref(&obj).map_err(ConvergeError::Registry)?;
            match self.release_with_retry(owner, &object, deadline).await? {
                Released::Terminating => cleaned_up = false,
                Released::Deleted => match self.store.get(&object).await {
                    Err(e) if e.is_not_found() => {}
                    _ => cleaned_up = false,
                },
                Released::ClaimRemoved | Released::Gone | Released::NotClaimed => {}
            }
        }
        if cleaned_up {
            info!(owner = %owner, "all dependents released");
        }
        Ok(cleaned_up)
    }

    async fn release_with_retry(
        &self,
        owner: &ObjectRef,
        object: &ObjectRef,
        deadline: tokio::time::Instant,
    ) -> Result<Released, ConvergeError> {
        retry_with_backoff(&self.retry, Some(deadline), "release", ConvergeError::is_retryable, || {
            self.release_once(owner, object)
        })
        .await
    }

    async fn release_once(&self, owner: &ObjectRef, object: &ObjectRef) -> Result<Released, ConvergeError> {
        let store_err = |op, source| self.store_error(op, object, owner, source);
        let mut current = match self.store.get(object).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => return Ok(Released::Gone),
            Err(e) => return Err(store_err("get", e)),
        };
        let removed = self
            .codec()
            .remove(owner, &mut current.metadata)
            .map_err(|source| ConvergeError::Claim { object: object.clone(), source })?;
        if !removed {
            return Ok(Released::NotClaimed);
        }
        let still_claimed = self
            .codec()
            .is_claimed(&current.metadata)
            .map_err(|source| ConvergeError::Claim { object: object.clone(), source })?;

        if still_claimed {
            self.store.update(&current).await.map_err(|e| store_err("update", e))?;
            debug!(object = %object, owner = %owner, "released claim");
            return Ok(Released::ClaimRemoved);
        }
        // Delete already issued; the claim stays until finalizers let go.
        if current.metadata.deletion_timestamp.is_some() {
            return Ok(Released::Terminating);
        }
        match self.store.delete(object).await {
            Ok(()) => {
                debug!(object = %object, owner = %owner, "deleted unclaimed dependent");
                Ok(Released::Deleted)
            }
            Err(e) if e.is_not_found() => Ok(Released::Gone),
            Err(e) => Err(store_err("delete", e)),
        }
    }

    async fn upsert(
        &self,
        owner: &ObjectRef,
        object: &ObjectRef,
        wanted: &DynamicObject,
        observed: bool,
        merge: Option<&MergeFn>,
        deadline: tokio::time::Instant,
    ) -> Result<Upserted, ConvergeError> {
        if !observed {
            let created = retry_with_backoff(&self.retry, Some(deadline), "create", ConvergeError::is_retryable, || {
                self.create_claimed(owner, object, wanted)
            })
            .await?;
            if created {
                return Ok(Upserted::Created);
            }
        }
        retry_with_backoff(&self.retry, Some(deadline), "update", ConvergeError::is_retryable, || {
            self.update_once(owner, object, wanted, merge)
        })
        .await
    }

    /// Create `wanted` with the owner's claim. False if the object already exists.
    async fn create_claimed(
        &self,
        owner: &ObjectRef,
        object: &ObjectRef,
        wanted: &DynamicObject,
    ) -> Result<bool, ConvergeError> {
        let mut obj = wanted.clone();
        obj.metadata.resource_version = None;
        self.codec()
            .insert(owner, &mut obj.metadata)
            .map_err(|source| ConvergeError::Claim { object: object.clone(), source })?;
        match self.store.create(&obj).await {
            Ok(_) => {
                debug!(object = %object, owner = %owner, "created");
                Ok(true)
            }
            Err(e) if e.is_already_exists() => Ok(false),
            Err(e) => Err(self.store_error("create", object, owner, e)),
        }
    }

    async fn update_once(
        &self,
        owner: &ObjectRef,
        object: &ObjectRef,
        wanted: &DynamicObject,
        merge: Option<&MergeFn>,
    ) -> Result<Upserted, ConvergeError> {
        let current = match self.store.get(object).await {
            Ok(obj) => obj,
            // Deleted since we looked: recreate, or retry if it raced back into existence.
            Err(e) if e.is_not_found() => {
                return match self.create_claimed(owner, object, wanted).await? {
                    true => Ok(Upserted::Created),
                    false => Err(self.store_error("create", object, owner, StoreError::Conflict(object.clone()))),
                };
            }
            Err(e) => return Err(self.store_error("get", object, owner, e)),
        };

        let claim_err = |source| ConvergeError::Claim { object: object.clone(), source };
        let mut next = current.clone();
        self.codec().insert(owner, &mut next.metadata).map_err(claim_err)?;
        if let Some(merge) = merge {
            next = merge(&next, wanted).map_err(|source| ConvergeError::Merge { object: object.clone(), source })?;
            let merged = self.store.registry().object_ref(&next).map_err(ConvergeError::Registry)?;
            if &merged != object {
                return Err(ConvergeError::Merge {
                    object: object.clone(),
                    source: anyhow::anyhow!("merge changed identity to {}", merged),
                });
            }
            self.codec().insert(owner, &mut next.metadata).map_err(claim_err)?;
            next.metadata.resource_version = current.metadata.resource_version.clone();
        }
        if next == current {
            return Ok(Upserted::Unchanged);
        }
        self.store.update(&next).await.map_err(|e| self.store_error("update", object, owner, e))?;
        debug!(object = %object, owner = %owner, "updated");
        Ok(Upserted::Updated)
    }

    fn store_error(&self, op: &'static str, object: &ObjectRef, owner: &ObjectRef, source: StoreError) -> ConvergeError {
        if source.is_conflict() {
            metrics::counter!("converge_conflicts", 1u64);
        }
        ConvergeError::Store { op, object: object.clone(), owner: owner.clone(), source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_changed_tracks_any_mutation() {
        let r = ObjectRef::new(&GroupKind::new("", "ConfigMap"), Some("default"), "cma");
        let mut report = ConvergeReport::default();
        assert!(!report.changed());
        report.released.push(r);
        assert!(report.changed());
    }

    #[test]
    fn only_store_conflicts_and_transients_retry() {
        let object = ObjectRef::new(&GroupKind::new("", "ConfigMap"), Some("default"), "cma");
        let owner = ObjectRef::new(&GroupKind::new("catalog.steward.io", "Account"), None, "o1");
        let conflict = ConvergeError::Store {
            op: "update",
            object: object.clone(),
            owner: owner.clone(),
            source: StoreError::Conflict(object.clone()),
        };
        assert!(conflict.is_retryable());
        assert!(conflict.to_string().contains("owner Account.catalog.steward.io o1"), "err={}", conflict);
        let missing = ConvergeError::Store { op: "get", object: object.clone(), owner, source: StoreError::NotFound(object.clone()) };
        assert!(!missing.is_retryable());
        assert!(!ConvergeError::DuplicateDesired(object).is_retryable());
    }
}
