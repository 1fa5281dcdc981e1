//! Kubernetes-style status conditions and the phase derived from them.
//!
//! Every resource status that embeds a condition list implements [`HasConditions`]; the
//! provided methods keep the list free of duplicate types, stamp transition times only when a
//! status actually flips, and recompute the cached [`Phase`] after each mutation.

use std::fmt;

use chrono::{DateTime, Utc};
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};

/// Primary readiness condition type.
pub const READY: &str = "Ready";
/// Reason put on the primary condition while the object is being deleted.
pub const TERMINATING_REASON: &str = "Deleting";

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    pub fn ready(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(READY, ConditionStatus::True, reason, message)
    }

    pub fn not_ready(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(READY, ConditionStatus::False, reason, message)
    }
}

/// Display-only summary of the condition list. Never use it as authoritative state.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum Phase {
    Ready,
    NotReady,
    #[default]
    Unknown,
    Terminating,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "Ready"),
            Self::NotReady => write!(f, "NotReady"),
            Self::Unknown => write!(f, "Unknown"),
            Self::Terminating => write!(f, "Terminating"),
        }
    }
}

/// Phase as a pure function of the conditions and the deletion-pending flag.
pub fn compute_phase(conditions: &[Condition], primary: &str, deletion_pending: bool) -> Phase {
    if deletion_pending {
        return Phase::Terminating;
    }
    match conditions.iter().find(|c| c.type_ == primary).map(|c| c.status) {
        Some(ConditionStatus::True) => Phase::Ready,
        Some(ConditionStatus::False) => Phase::NotReady,
        Some(ConditionStatus::Unknown) | None => Phase::Unknown,
    }
}

fn deletion_marked(conditions: &[Condition], primary: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.type_ == primary && c.status == ConditionStatus::False && c.reason == TERMINATING_REASON)
}

/// A status value holding an ordered condition list and its cached phase.
pub trait HasConditions {
    fn conditions(&self) -> &[Condition];
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
    fn phase(&self) -> Phase;
    fn set_phase(&mut self, phase: Phase);
    fn observed_generation(&self) -> Option<i64>;

    /// Condition type whose status drives the phase.
    fn primary_condition(&self) -> &str {
        READY
    }

    fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions().iter().find(|c| c.type_ == type_)
    }

    fn set_condition(&mut self, condition: Condition) {
        self.set_condition_at(condition, Utc::now())
    }

    /// Upsert `condition`, using `now` as transition time if its status changes.
    fn set_condition_at(&mut self, mut condition: Condition, now: DateTime<Utc>) {
        let list = self.conditions_mut();
        match list.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                if existing.status != condition.status {
                    existing.status = condition.status;
                    existing.last_transition_time = now;
                }
                existing.reason = condition.reason;
                existing.message = condition.message;
            }
            None => {
                condition.last_transition_time = now;
                list.push(condition);
            }
        }
        self.refresh_phase();
    }

    /// Flip the primary condition to False with the deletion reason; phase becomes Terminating.
    fn mark_terminating(&mut self, message: impl Into<String>)
    where
        Self: Sized,
    {
        let primary = self.primary_condition().to_string();
        self.set_condition(Condition::new(primary, ConditionStatus::False, TERMINATING_REASON, message));
    }

    fn refresh_phase(&mut self) {
        let primary = self.primary_condition();
        let pending = deletion_marked(self.conditions(), primary);
        let phase = compute_phase(self.conditions(), primary, pending);
        self.set_phase(phase);
    }
}

/// Ready-made status block: observed generation, conditions and phase.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommonStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub phase: Phase,
}

impl HasConditions for CommonStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }

    fn phase(&self) -> Phase {
        self.phase
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    fn observed_generation(&self) -> Option<i64> {
        self.observed_generation
    }
}

/// Ready only when the status reflects the current spec and the primary condition is True.
///
/// Objects being deleted are never ready.
pub fn is_ready<S: HasConditions + ?Sized>(meta: &ObjectMeta, status: &S) -> bool {
    if meta.deletion_timestamp.is_some() {
        return false;
    }
    if meta.generation != status.observed_generation() {
        return false;
    }
    status
        .get_condition(status.primary_condition())
        .map(|c| c.status == ConditionStatus::True)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn unchanged_status_keeps_transition_time() {
        let mut status = CommonStatus::default();
        status.set_condition_at(Condition::not_ready("Provisioning", "waiting"), t(0));
        assert_eq!(status.phase, Phase::NotReady);

        status.set_condition_at(Condition::not_ready("StillProvisioning", "waiting more"), t(10));
        let c = status.get_condition(READY).unwrap();
        assert_eq!(c.last_transition_time, t(0));
        assert_eq!(c.reason, "StillProvisioning");
        assert_eq!(c.message, "waiting more");
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn status_change_stamps_time_and_recomputes_phase() {
        let mut status = CommonStatus::default();
        assert_eq!(status.phase, Phase::Unknown);
        status.set_condition_at(Condition::not_ready("Provisioning", ""), t(0));
        status.set_condition_at(Condition::ready("Provisioned", "all set"), t(30));

        let c = status.get_condition(READY).unwrap();
        assert_eq!(c.status, ConditionStatus::True);
        assert_eq!(c.last_transition_time, t(0) + Duration::seconds(30));
        assert_eq!(status.phase, Phase::Ready);

        status.set_condition_at(Condition::new(READY, ConditionStatus::Unknown, "Lost", ""), t(40));
        assert_eq!(status.phase, Phase::Unknown);
    }

    #[test]
    fn secondary_conditions_do_not_drive_phase() {
        let mut status = CommonStatus::default();
        status.set_condition(Condition::new("Established", ConditionStatus::True, "Ok", ""));
        assert_eq!(status.phase, Phase::Unknown);
        assert!(status.get_condition("Established").is_some());
        assert!(status.get_condition(READY).is_none());

        status.set_condition(Condition::ready("Ok", ""));
        assert_eq!(status.phase, Phase::Ready);
        assert_eq!(status.conditions.len(), 2);
    }

    #[test]
    fn terminating_overrides_condition_values() {
        let mut status = CommonStatus::default();
        status.set_condition(Condition::ready("Ok", ""));
        status.mark_terminating("owner is being deleted");
        assert_eq!(status.phase, Phase::Terminating);
        let c = status.get_condition(READY).unwrap();
        assert_eq!(c.status, ConditionStatus::False);
        assert_eq!(c.reason, TERMINATING_REASON);

        status.set_condition(Condition::new("Cleanup", ConditionStatus::True, "Done", ""));
        assert_eq!(status.phase, Phase::Terminating);

        assert_eq!(compute_phase(&[], READY, true), Phase::Terminating);
        assert_eq!(compute_phase(&status.conditions, READY, false), Phase::NotReady);
    }

    #[test]
    fn readiness_requires_current_generation() {
        let mut status = CommonStatus::default();
        status.set_condition(Condition::ready("Ok", ""));
        status.observed_generation = Some(1);

        let mut meta = ObjectMeta { generation: Some(1), ..Default::default() };
        assert!(is_ready(&meta, &status));

        meta.generation = Some(2);
        assert!(!is_ready(&meta, &status), "stale status must not report ready");

        status.observed_generation = Some(2);
        assert!(is_ready(&meta, &status));

        status.set_condition(Condition::not_ready("Degraded", ""));
        assert!(!is_ready(&meta, &status));
    }

    #[test]
    fn status_serializes_with_kubernetes_field_names() {
        let mut status = CommonStatus { observed_generation: Some(3), ..Default::default() };
        status.set_condition_at(Condition::ready("Ok", "fine"), t(0));
        let v = serde_json::to_value(&status).unwrap();
        assert_eq!(v["observedGeneration"], 3);
        assert_eq!(v["phase"], "Ready");
        assert_eq!(v["conditions"][0]["type"], "Ready");
        assert_eq!(v["conditions"][0]["status"], "True");
        assert!(v["conditions"][0]["lastTransitionTime"].is_string());

        let back: CommonStatus = serde_json::from_value(v).unwrap();
        assert_eq!(back, status);
    }
}
