// ── Per-device feature state ──
//
// One `FeatureState` per (device, feature). Status moves only through
// job callbacks, or through a new apply overwriting a settled status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use super::entity_id::PolicyId;

// ── Feature ─────────────────────────────────────────────────────────

/// Logical method names routed by the dispatcher.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
pub enum Feature {
    #[serde(rename = "notifications")]
    #[strum(serialize = "notifications")]
    Notifications,
    #[serde(rename = "appIdentification")]
    #[strum(serialize = "appIdentification")]
    AppIdentification,
    #[serde(rename = "modify")]
    #[strum(serialize = "modify")]
    Modify,
    #[serde(rename = "staticroutes")]
    #[strum(serialize = "staticroutes")]
    StaticRoutes,
    #[serde(rename = "dhcp")]
    #[strum(serialize = "dhcp")]
    Dhcp,
    #[serde(rename = "vrrp")]
    #[strum(serialize = "vrrp")]
    Vrrp,
    #[serde(rename = "qosTrafficMap")]
    #[strum(serialize = "qosTrafficMap")]
    QosTrafficMap,
    #[serde(rename = "qosPolicy")]
    #[strum(serialize = "qosPolicy")]
    QosPolicy,
    #[serde(rename = "firewallPolicy")]
    #[strum(serialize = "firewallPolicy")]
    FirewallPolicy,
    #[serde(rename = "upgrade")]
    #[strum(serialize = "upgrade")]
    Upgrade,
    #[serde(rename = "sync")]
    #[strum(serialize = "sync")]
    Sync,
}

// ── FeatureStatus ───────────────────────────────────────────────────

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum FeatureStatus {
    #[default]
    None,
    Installing,
    Installed,
    Uninstalling,
    InstallFailed,
    UninstallFailed,
    JobDeleted,
    JobQueueFailed,
}

impl FeatureStatus {
    /// A job is outstanding for this feature.
    pub fn in_transition(self) -> bool {
        matches!(self, Self::Installing | Self::Uninstalling)
    }

    /// The device is expected to carry this feature's configuration
    /// (installed, on its way, or failed while trying).
    pub fn wants_installed(self) -> bool {
        matches!(
            self,
            Self::Installing | Self::Installed | Self::InstallFailed | Self::JobDeleted
        )
    }

    /// A removal was requested and has not been confirmed.
    pub fn pending_removal(self) -> bool {
        matches!(self, Self::Uninstalling | Self::UninstallFailed)
    }
}

// ── FeatureState ────────────────────────────────────────────────────

/// Persisted `{status, policy, requestTime}` record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureState {
    pub status: FeatureStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_time: Option<DateTime<Utc>>,
    /// Installed document revision (traffic map, application DB).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
}

impl FeatureState {
    /// Start a transition: `status` with a fresh request time.
    pub fn begin(&mut self, status: FeatureStatus, at: DateTime<Utc>) {
        self.status = status;
        self.request_time = Some(at);
    }

    /// Put back the record a removal replaced, request time included, so
    /// the job that was outstanding before it can still settle.
    pub fn restore(&mut self, previous: Option<&FeatureState>) {
        match previous {
            Some(prev) => *self = prev.clone(),
            None => self.status = FeatureStatus::Installed,
        }
    }

    /// `true` when `at` is still the latest request for this feature.
    pub fn is_current(&self, at: DateTime<Utc>) -> bool {
        self.request_time == Some(at)
    }

    /// `true` when no apply has been issued after `at`.
    pub fn not_newer_than(&self, at: DateTime<Utc>) -> bool {
        self.request_time.is_none_or(|t| t <= at)
    }

    /// Already installed or installing exactly `policy` at `revision`.
    pub fn targets(&self, policy: Option<&PolicyId>, revision: Option<u64>) -> bool {
        matches!(
            self.status,
            FeatureStatus::Installed | FeatureStatus::Installing
        ) && self.policy.as_ref() == policy
            && self.revision == revision
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn status_uses_kebab_case_on_the_wire() {
        assert_eq!(
            serde_json::to_string(&FeatureStatus::InstallFailed).unwrap(),
            "\"install-failed\""
        );
        assert_eq!(
            "job-queue-failed".parse::<FeatureStatus>().unwrap(),
            FeatureStatus::JobQueueFailed
        );
    }

    #[test]
    fn feature_names_match_method_names() {
        assert_eq!(Feature::QosPolicy.as_ref(), "qosPolicy");
        assert_eq!("staticroutes".parse::<Feature>().unwrap(), Feature::StaticRoutes);
        assert_eq!(
            serde_json::to_string(&Feature::AppIdentification).unwrap(),
            "\"appIdentification\""
        );
    }

    #[test]
    fn request_time_guards() {
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap();
        let mut state = FeatureState::default();
        assert!(state.not_newer_than(t1));
        state.begin(FeatureStatus::Installing, t2);
        assert!(state.is_current(t2));
        assert!(!state.is_current(t1));
        assert!(!state.not_newer_than(t1));
    }
}
