//! Block until an object's live state satisfies a set of predicates.
//!
//! Level triggered: each observation (the replayed current value, then every change) is
//! checked on its own, so missed intermediate states do not matter. A watch that lags or
//! fails transiently is reopened, which replays the current value again.

use std::time::{Duration, Instant};

use futures::StreamExt;
use kube::core::DynamicObject;
use serde::Deserialize;
use steward_core::{is_ready, CommonStatus, Condition, ObjectRef};
use steward_store::{ObjectStore, StoreError, WatchEvent, WatchParams};
use thiserror::Error;
use tracing::{debug, warn};

const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(100);

/// Condition on an observed object. An `Err` aborts the wait.
pub type Predicate = Box<dyn Fn(&DynamicObject) -> anyhow::Result<bool> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    /// Past this a warning is logged; the wait continues until `timeout`.
    pub soft_timeout: Option<Duration>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(300), soft_timeout: Some(Duration::from_secs(30)) }
    }
}

impl WaitOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout, soft_timeout: None }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WaitError {
    #[error("timed out after {timeout:?} waiting for {object}")]
    Timeout { object: ObjectRef, timeout: Duration },

    #[error("predicate failed on {object}: {source}")]
    Predicate {
        object: ObjectRef,
        #[source]
        source: anyhow::Error,
    },

    #[error("watching {object}: {source}")]
    Store {
        object: ObjectRef,
        #[source]
        source: StoreError,
    },
}

impl WaitError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// The part of a status block readiness depends on. Other fields, such as a free-form phase,
/// are ignored.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadinessView {
    #[serde(default)]
    observed_generation: Option<i64>,
    #[serde(default)]
    conditions: Vec<Condition>,
}

/// Readiness of an object with a conventional status block (`observedGeneration`, `conditions`).
pub fn ready() -> Predicate {
    Box::new(|obj: &DynamicObject| -> anyhow::Result<bool> {
        let view: ReadinessView = match obj.data.get("status") {
            None | Some(serde_json::Value::Null) => return Ok(false),
            Some(raw) => serde_json::from_value(raw.clone())?,
        };
        let status = CommonStatus {
            observed_generation: view.observed_generation,
            conditions: view.conditions,
            ..Default::default()
        };
        Ok(is_ready(&obj.metadata, &status))
    })
}

enum Observed {
    Object(DynamicObject),
    Absent,
}

/// Wait until `target` exists and every predicate holds for the same observation.
pub async fn wait_until<S: ObjectStore + ?Sized>(
    store: &S,
    target: &ObjectRef,
    options: WaitOptions,
    predicates: &[Predicate],
) -> Result<DynamicObject, WaitError> {
    let check = |seen: &Observed| -> Result<Option<DynamicObject>, WaitError> {
        let Observed::Object(obj) = seen else {
            return Ok(None);
        };
        for p in predicates {
            let ok = p(obj).map_err(|source| WaitError::Predicate { object: target.clone(), source })?;
            if !ok {
                return Ok(None);
            }
        }
        Ok(Some(obj.clone()))
    };
    timed(target, options, observe(store, target, check)).await
}

/// Wait until `target` no longer exists.
pub async fn wait_until_not_found<S: ObjectStore + ?Sized>(
    store: &S,
    target: &ObjectRef,
    options: WaitOptions,
) -> Result<(), WaitError> {
    let check = |seen: &Observed| -> Result<Option<()>, WaitError> {
        Ok(match seen {
            Observed::Absent => Some(()),
            Observed::Object(_) => None,
        })
    };
    timed(target, options, observe(store, target, check)).await
}

async fn timed<T>(
    target: &ObjectRef,
    options: WaitOptions,
    fut: impl std::future::Future<Output = Result<T, WaitError>>,
) -> Result<T, WaitError> {
    let started = Instant::now();
    let bounded = tokio::time::timeout(options.timeout, async {
        tokio::pin!(fut);
        if let Some(soft) = options.soft_timeout.filter(|s| *s < options.timeout) {
            tokio::select! {
                res = &mut fut => return res,
                _ = tokio::time::sleep(soft) => {
                    warn!(object = %target, waited_ms = soft.as_millis() as u64, "still waiting");
                }
            }
        }
        fut.await
    })
    .await;
    metrics::histogram!("wait_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
    match bounded {
        Ok(res) => res,
        Err(_) => {
            metrics::counter!("wait_timeouts", 1u64);
            Err(WaitError::Timeout { object: target.clone(), timeout: options.timeout })
        }
    }
}

/// Feed every observation of `target` to `check` until it yields a value.
async fn observe<S, T, F>(store: &S, target: &ObjectRef, check: F) -> Result<T, WaitError>
where
    S: ObjectStore + ?Sized,
    F: Fn(&Observed) -> Result<Option<T>, WaitError>,
{
    let store_err = |source| WaitError::Store { object: target.clone(), source };
    let gk = target.group_kind();
    let params = WatchParams::for_object(target);
    loop {
        let mut stream = match store.watch(&gk, &params).await {
            Ok(stream) => stream,
            Err(e) if e.is_retryable() => {
                warn!(object = %target, error = %e, "watch failed to open; retrying");
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                continue;
            }
            Err(e) => return Err(store_err(e)),
        };
        while let Some(ev) = stream.next().await {
            let seen = match ev {
                Ok(WatchEvent::Restarted(items)) => {
                    match items.into_iter().find(|o| o.metadata.name.as_deref() == Some(target.name.as_str())) {
                        Some(obj) => Observed::Object(obj),
                        None => Observed::Absent,
                    }
                }
                Ok(WatchEvent::Added(obj)) | Ok(WatchEvent::Modified(obj)) => Observed::Object(obj),
                Ok(WatchEvent::Deleted(_)) => Observed::Absent,
                Err(e) if e.is_retryable() => {
                    warn!(object = %target, error = %e, "watch interrupted; resubscribing");
                    break;
                }
                Err(e) => return Err(store_err(e)),
            };
            if let Some(done) = check(&seen)? {
                return Ok(done);
            }
        }
        debug!(object = %target, "watch ended; resubscribing");
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{ApiResource, GroupVersionKind};
    use serde_json::json;

    fn obj(generation: i64, status: serde_json::Value) -> DynamicObject {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("catalog.steward.io", "v1alpha1", "Account"));
        let mut o = DynamicObject::new("a1", &ar).data(json!({ "status": status }));
        o.metadata.generation = Some(generation);
        o
    }

    #[test]
    fn ready_predicate_reads_conventional_status() {
        let ready_status = json!({
            "observedGeneration": 2,
            "phase": "Provisioned",
            "conditions": [{
                "type": "Ready",
                "status": "True",
                "reason": "SetupComplete",
                "message": "",
                "lastTransitionTime": "2024-01-01T00:00:00Z"
            }]
        });
        let p = ready();
        assert!(p(&obj(2, ready_status.clone())).unwrap());
        assert!(!p(&obj(3, ready_status)).unwrap(), "stale observedGeneration");
        assert!(!p(&obj(1, serde_json::Value::Null)).unwrap());
        assert!(p(&obj(1, json!({ "conditions": "nope" }))).is_err());
    }

    #[test]
    fn timeout_is_distinguishable() {
        let r = ObjectRef::new(&steward_core::GroupKind::new("", "ConfigMap"), Some("default"), "cma");
        let err = WaitError::Timeout { object: r, timeout: Duration::from_secs(1) };
        assert!(err.is_timeout());
    }
}
