//! Version resolution — what a feature looks like at a given version.
//!
//! Pure functions of (history, version). A [`VersionedSpec`] is the
//! validated, parsed form of a [`FeatureSpec`]; the gate stores one per
//! registered feature and evaluates it against the active compatibility
//! version on every read.

use std::collections::BTreeMap;

use semver::Version;

use crate::error::{GateError, GateResult};
use crate::spec::{Feature, FeatureSpec, HistoryEvent, PreRelease};
use crate::version::{format_major_minor, parse_major_minor};

/// Everything the gate needs to know about a feature at one version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub default: bool,
    pub pre_release: PreRelease,
    pub locked: bool,
    pub deprecated: bool,
    pub removed: bool,
}

/// A registered feature spec with its history parsed into versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedSpec {
    spec: FeatureSpec,
    history: BTreeMap<HistoryEvent, Version>,
}

impl VersionedSpec {
    /// Validate and parse a spec.
    ///
    /// Fails if a history version is not `MAJOR.MINOR`, or if the same
    /// event is anchored at two different versions. The same event at the
    /// same version twice is accepted.
    pub fn new(feature: &Feature, spec: FeatureSpec) -> GateResult<Self> {
        let mut history: BTreeMap<HistoryEvent, Version> = BTreeMap::new();

        for (event, raw) in &spec.history {
            let version =
                parse_major_minor(raw).map_err(|_| GateError::InvalidHistoryVersion {
                    feature: feature.clone(),
                    event: *event,
                    version: raw.clone(),
                })?;

            if let Some(existing) = history.get(event) {
                if *existing != version {
                    return Err(GateError::DuplicateHistoryEvent {
                        feature: feature.clone(),
                        event: *event,
                        first: format_major_minor(existing),
                        second: raw.clone(),
                    });
                }
                continue;
            }
            history.insert(*event, version);
        }

        Ok(Self { spec, history })
    }

    /// The spec as it was registered.
    pub fn spec(&self) -> &FeatureSpec {
        &self.spec
    }

    fn reached(&self, event: HistoryEvent, at: &Version) -> Option<bool> {
        self.history.get(&event).map(|v| v <= at)
    }

    /// True once a `FeatureDeprecated` event is reached. A statically
    /// `Deprecated` spec without the event only reports the stage.
    pub fn deprecated_at(&self, at: &Version) -> bool {
        self.reached(HistoryEvent::FeatureDeprecated, at)
            .unwrap_or(false)
    }

    pub fn removed_at(&self, at: &Version) -> bool {
        self.reached(HistoryEvent::Removed, at).unwrap_or(false)
    }

    /// Maturity stage at `at`.
    ///
    /// The number of promotion anchors reached decides the stage: one is
    /// alpha, two beta, three GA, whichever anchors they are. With no
    /// promotion anchors the static stage applies.
    pub fn prerelease_at(&self, at: &Version) -> PreRelease {
        if self.deprecated_at(at) {
            return PreRelease::Deprecated;
        }

        let anchors = [
            HistoryEvent::PromotedToAlpha,
            HistoryEvent::PromotedToBeta,
            HistoryEvent::PromotedToGA,
        ];
        if !anchors.iter().any(|e| self.history.contains_key(e)) {
            return self.spec.pre_release;
        }

        let reached = anchors
            .iter()
            .filter(|e| self.reached(**e, at) == Some(true))
            .count();
        match reached {
            0 => PreRelease::PreAlpha,
            1 => PreRelease::Alpha,
            2 => PreRelease::Beta,
            _ => PreRelease::GA,
        }
    }

    /// Default value at `at`.
    ///
    /// The latest applicable `DefaultEnabled`/`DefaultDisabled` event
    /// wins; when both sit at the same version `DefaultEnabled` wins.
    /// Before any default event applies the default is `false`.
    pub fn default_at(&self, at: &Version) -> bool {
        let enabled = self.history.get(&HistoryEvent::DefaultEnabled);
        let disabled = self.history.get(&HistoryEvent::DefaultDisabled);
        if enabled.is_none() && disabled.is_none() {
            return self.spec.default;
        }

        let enabled = enabled.filter(|v| *v <= at);
        let disabled = disabled.filter(|v| *v <= at);
        match (enabled, disabled) {
            (Some(e), Some(d)) => e >= d,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub fn locked_to_default_at(&self, at: &Version) -> bool {
        self.reached(HistoryEvent::LockedToDefault, at)
            .unwrap_or(self.spec.lock_to_default)
    }

    pub fn resolve(&self, at: &Version) -> Resolution {
        Resolution {
            default: self.default_at(at),
            pre_release: self.prerelease_at(at),
            locked: self.locked_to_default_at(at),
            deprecated: self.deprecated_at(at),
            removed: self.removed_at(at),
        }
    }
}
