//! Feature object model.
//!
//! A [`FeatureRecord`] has an operator-owned `spec` (the desired
//! enablement) and a host-owned `status` (what the hosts of the feature's
//! class have actually published). Hosts only ever write `status`, and
//! only through a [`StatusApply`].

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Enumerations ──────────────────────────────────────────────────

/// Requested or default enablement of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Enablement {
    Enabled,
    Disabled,
}

impl Enablement {
    pub fn from_bool(on: bool) -> Self {
        if on { Enablement::Enabled } else { Enablement::Disabled }
    }

    pub fn is_enabled(self) -> bool {
        self == Enablement::Enabled
    }
}

/// Published run state of a feature.
///
/// `TurningOn` and `TurningOff` mark a dynamic transition that has been
/// started but not yet confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureState {
    On,
    Off,
    TurningOn,
    TurningOff,
}

impl FeatureState {
    pub fn from_bool(on: bool) -> Self {
        if on { FeatureState::On } else { FeatureState::Off }
    }

    /// Whether a consumer should treat the feature as on.
    pub fn reads_as_on(self) -> bool {
        matches!(self, FeatureState::On | FeatureState::TurningOn)
    }
}

impl fmt::Display for FeatureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FeatureState::On => "On",
            FeatureState::Off => "Off",
            FeatureState::TurningOn => "TurningOn",
            FeatureState::TurningOff => "TurningOff",
        })
    }
}

/// Stability as published for a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StabilityLevel {
    /// Not present at the current version.
    #[default]
    Unavailable,
    Alpha,
    Beta,
    GA,
    Deprecated,
    /// Present in every supported version; needs no gating.
    Universal,
}

// ── Records ───────────────────────────────────────────────────────

/// A single host's report of having used a feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureUse {
    /// Unix timestamp (seconds) of the report.
    pub report_time: u64,
    pub version: String,
    pub enabled: Enablement,
}

/// Operator-owned half of a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredSpec {
    /// `None` means the operator has expressed no preference.
    pub desired: Option<Enablement>,
}

/// Host-owned half of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureStatus {
    pub class: String,
    pub name: String,
    pub stability: StabilityLevel,
    /// Version of the hosts that last published this status. Empty until
    /// a host has published.
    pub version: String,
    pub default: Enablement,
    pub state: FeatureState,
    pub uses: Vec<FeatureUse>,
}

impl FeatureStatus {
    fn empty(class: &str, name: &str) -> Self {
        Self {
            class: class.to_string(),
            name: name.to_string(),
            stability: StabilityLevel::Unavailable,
            version: String::new(),
            default: Enablement::Disabled,
            state: FeatureState::Off,
            uses: Vec::new(),
        }
    }
}

/// A stored Feature object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRecord {
    pub spec: DesiredSpec,
    pub status: FeatureStatus,
    /// Store-wide counter, bumped on every write that changes the record.
    pub resource_version: u64,
    /// Identity of the last writer of `status`, if any.
    pub field_manager: Option<String>,
    /// Unix timestamp (seconds) of the last change.
    pub updated_at: u64,
}

impl FeatureRecord {
    /// A record that has not been published yet.
    pub fn new(class: &str, name: &str) -> Self {
        Self {
            spec: DesiredSpec::default(),
            status: FeatureStatus::empty(class, name),
            resource_version: 0,
            field_manager: None,
            updated_at: 0,
        }
    }

    pub fn class(&self) -> &str {
        &self.status.class
    }

    pub fn name(&self) -> &str {
        &self.status.name
    }
}

/// Build the `{class}/{name}` key.
pub(crate) fn table_key(class: &str, name: &str) -> String {
    format!("{class}/{name}")
}

// ── Patches ───────────────────────────────────────────────────────

/// Additive status patch.
///
/// Only the fields set to `Some` are written; everything else on the
/// stored status is left alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusApply {
    pub class: String,
    pub name: String,
    pub stability: Option<StabilityLevel>,
    pub version: Option<String>,
    pub default: Option<Enablement>,
    pub state: Option<FeatureState>,
}

impl StatusApply {
    pub fn new(class: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            name: name.into(),
            stability: None,
            version: None,
            default: None,
            state: None,
        }
    }

    pub fn with_stability(mut self, stability: StabilityLevel) -> Self {
        self.stability = Some(stability);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_default(mut self, default: Enablement) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_state(mut self, state: FeatureState) -> Self {
        self.state = Some(state);
        self
    }

    /// Merge into `status`, returning whether anything changed.
    pub fn merge_into(&self, status: &mut FeatureStatus) -> bool {
        let before = status.clone();
        if let Some(stability) = self.stability {
            status.stability = stability;
        }
        if let Some(version) = &self.version {
            status.version.clone_from(version);
        }
        if let Some(default) = self.default {
            status.default = default;
        }
        if let Some(state) = self.state {
            status.state = state;
        }
        *status != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_only_touches_set_fields() {
        let mut status = FeatureStatus::empty("x", "f");
        status.version = "1.28".to_string();
        status.state = FeatureState::On;

        let apply = StatusApply::new("x", "f").with_default(Enablement::Enabled);
        assert!(apply.merge_into(&mut status));
        assert_eq!(status.version, "1.28");
        assert_eq!(status.state, FeatureState::On);
        assert_eq!(status.default, Enablement::Enabled);

        assert!(!apply.merge_into(&mut status));
    }

    #[test]
    fn turning_on_reads_as_on() {
        assert!(FeatureState::On.reads_as_on());
        assert!(FeatureState::TurningOn.reads_as_on());
        assert!(!FeatureState::TurningOff.reads_as_on());
        assert!(!FeatureState::Off.reads_as_on());
    }

    #[test]
    fn record_serializes_with_wire_names() {
        let mut record = FeatureRecord::new("x", "f");
        record.spec.desired = Some(Enablement::Enabled);
        record.status.uses.push(FeatureUse {
            report_time: 10,
            version: "1.28".to_string(),
            enabled: Enablement::Enabled,
        });

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["spec"]["desired"], "Enabled");
        assert_eq!(json["status"]["state"], "Off");
        assert_eq!(json["status"]["stability"], "Unavailable");
        assert_eq!(json["status"]["uses"][0]["reportTime"], 10);
        assert_eq!(json["resourceVersion"], 0);
    }
}
