//! The feature gate — registry, overrides, and enablement decisions.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use semver::Version;
use tracing::{debug, warn};

use crate::error::{GateError, GateResult};
use crate::resolve::{Resolution, VersionedSpec};
use crate::spec::{Feature, FeatureSpec, PreRelease};
use crate::version::{format_major_minor, parse_major_minor};

/// Global toggle for alpha features. Per-feature keys set in the same
/// call take precedence: `AllAlpha=true,NewFeature=false` leaves
/// `NewFeature` off.
pub const ALL_ALPHA: Feature = Feature::from_static("AllAlpha");

/// Global toggle for beta features, same precedence rules as [`ALL_ALPHA`].
pub const ALL_BETA: Feature = Feature::from_static("AllBeta");

const FLAG_NAME: &str = "feature-gates";

type KnownMap = HashMap<Feature, Arc<VersionedSpec>>;
type EnabledMap = HashMap<Feature, bool>;

/// Stage that a special gate back-fills when set.
fn special_stage(feature: &str) -> Option<PreRelease> {
    match feature {
        "AllAlpha" => Some(PreRelease::Alpha),
        "AllBeta" => Some(PreRelease::Beta),
        _ => None,
    }
}

/// Versioned feature gate.
///
/// Readers load immutable snapshots and never block. Writers (`add`,
/// `set_from_map`, `set_compatibility_version`) serialize on `writer`,
/// copy the current snapshot, modify the copy, and publish it.
pub struct FeatureGate {
    name: String,
    binary_version: Version,
    /// Guards writes; the flag records whether the gate is bound to the
    /// command line, after which `add` is refused.
    writer: Mutex<bool>,
    known: ArcSwap<KnownMap>,
    enabled: ArcSwap<EnabledMap>,
    compatibility_version: ArcSwapOption<Version>,
}

impl FeatureGate {
    /// Create a gate for a binary at `binary_version` (`"MAJOR.MINOR"`).
    ///
    /// # Panics
    ///
    /// Panics if `binary_version` is malformed; the binary version is
    /// compiled in, so a bad one is a build defect.
    pub fn new(binary_version: &str) -> Self {
        match Self::try_new(binary_version) {
            Ok(gate) => gate,
            Err(e) => panic!("no binary version detected, can't initialize feature gates: {e}"),
        }
    }

    /// Fallible form of [`FeatureGate::new`].
    pub fn try_new(binary_version: &str) -> GateResult<Self> {
        let binary_version = parse_major_minor(binary_version)?;

        let mut known = KnownMap::new();
        for (feature, spec) in [
            (ALL_ALPHA, FeatureSpec::alpha(false)),
            (ALL_BETA, FeatureSpec::beta(false)),
        ] {
            let versioned = VersionedSpec::new(&feature, spec)?;
            known.insert(feature, Arc::new(versioned));
        }

        Ok(Self {
            name: FLAG_NAME.to_string(),
            binary_version,
            writer: Mutex::new(false),
            known: ArcSwap::from_pointee(known),
            enabled: ArcSwap::from_pointee(EnabledMap::new()),
            compatibility_version: ArcSwapOption::empty(),
        })
    }

    /// Name used in diagnostics.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn binary_version(&self) -> &Version {
        &self.binary_version
    }

    /// The explicitly set compatibility version, if any.
    pub fn compatibility_version(&self) -> Option<Version> {
        self.compatibility_version.load_full().map(|v| (*v).clone())
    }

    /// The version all resolution happens against: the compatibility
    /// version when set, otherwise the binary version.
    pub fn effective_version(&self) -> Version {
        self.compatibility_version()
            .unwrap_or_else(|| self.binary_version.clone())
    }

    // ── Registry ───────────────────────────────────────────────────

    /// Register features.
    ///
    /// Fails when the gate is already bound to the flag surface, when a
    /// spec is malformed, or when a name is already registered with a
    /// different spec. Nothing is registered if any entry fails.
    pub fn add(
        &self,
        features: impl IntoIterator<Item = (Feature, FeatureSpec)>,
    ) -> GateResult<()> {
        let closed = self.writer.lock();
        if *closed {
            return Err(GateError::Closed);
        }

        let mut known = KnownMap::clone(&self.known.load());
        let mut added = 0usize;

        for (feature, spec) in features {
            if let Some(existing) = known.get(&feature) {
                if *existing.spec() == spec {
                    continue;
                }
                return Err(GateError::Conflict(feature));
            }
            let versioned = VersionedSpec::new(&feature, spec)?;
            known.insert(feature, Arc::new(versioned));
            added += 1;
        }

        self.known.store(Arc::new(known));
        debug!(gate = %self.name, added, "feature gates registered");
        Ok(())
    }

    /// Copy of every registered spec.
    pub fn get_all(&self) -> HashMap<Feature, FeatureSpec> {
        self.known
            .load()
            .iter()
            .map(|(k, v)| (k.clone(), v.spec().clone()))
            .collect()
    }

    /// Whether `feature` is registered.
    pub fn is_known(&self, feature: impl AsRef<str>) -> bool {
        self.known.load().contains_key(feature.as_ref())
    }

    // ── Compatibility version ──────────────────────────────────────

    /// Resolve every feature against `"MAJOR.MINOR"` from now on.
    pub fn set_compatibility_version(&self, raw: &str) -> GateResult<()> {
        let version = parse_major_minor(raw)?;
        let _guard = self.writer.lock();
        self.compatibility_version.store(Some(Arc::new(version)));
        debug!(gate = %self.name, compatibility_version = raw, "compatibility version set");
        Ok(())
    }

    // ── Overrides ──────────────────────────────────────────────────

    /// Parse `"k1=v1,k2=v2,..."` and apply it with [`set_from_map`].
    ///
    /// Empty segments are skipped. Booleans accept the same spellings as
    /// `1`, `t`, `TRUE`, `true`, `True`, `0`, `f`, `FALSE`, `false`, `False`.
    ///
    /// [`set_from_map`]: FeatureGate::set_from_map
    pub fn set(&self, value: &str) -> GateResult<()> {
        let mut m = BTreeMap::new();
        for segment in value.split(',') {
            if segment.is_empty() {
                continue;
            }
            let (key, raw) = match segment.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => return Err(GateError::MissingValue(segment.trim().to_string())),
            };
            let parsed = parse_bool(raw).ok_or_else(|| GateError::InvalidValue {
                key: key.to_string(),
                value: raw.to_string(),
                reason: format!("parsing {raw:?}: invalid syntax"),
            })?;
            m.insert(key.to_string(), parsed);
        }
        self.set_from_map(m)
    }

    /// Apply explicit overrides.
    ///
    /// Every key must be registered. A feature locked to its default at
    /// the effective version may only be set to that default. Keys are
    /// applied in a fixed order: ordinary keys first (sorted), then
    /// `AllAlpha`, then `AllBeta`. A special key back-fills every
    /// feature of its stage that was not named in the same call and is
    /// not locked.
    ///
    /// The whole call is published at once; on error nothing changes.
    pub fn set_from_map<I, K>(&self, m: I) -> GateResult<()>
    where
        I: IntoIterator<Item = (K, bool)>,
        K: Into<String>,
    {
        let requested: BTreeMap<String, bool> =
            m.into_iter().map(|(k, v)| (k.into(), v)).collect();

        let _guard = self.writer.lock();
        let known = self.known.load_full();
        let mut enabled = EnabledMap::clone(&self.enabled.load());
        let at = self.effective_version();

        let (special, ordinary): (Vec<_>, Vec<_>) = requested
            .iter()
            .partition(|(k, _)| special_stage(k).is_some());

        for (key, value) in ordinary.into_iter().chain(special) {
            let (feature, spec) = known
                .get_key_value(key.as_str())
                .ok_or_else(|| GateError::Unrecognized(key.clone()))?;
            let resolution = spec.resolve(&at);

            if resolution.locked && resolution.default != *value {
                return Err(GateError::Locked {
                    feature: feature.clone(),
                    requested: *value,
                    locked: resolution.default,
                });
            }
            enabled.insert(feature.clone(), *value);

            if let Some(stage) = special_stage(key) {
                backfill(&known, &mut enabled, &requested, stage, *value, &at);
            }

            match resolution.pre_release {
                PreRelease::Deprecated => warn!(
                    feature = %feature,
                    value,
                    "setting deprecated feature gate, it will be removed in a future release"
                ),
                PreRelease::GA => warn!(
                    feature = %feature,
                    value,
                    "setting GA feature gate, it will be removed in a future release"
                ),
                _ => {}
            }
        }

        let enabled = Arc::new(enabled);
        self.enabled.store(enabled.clone());
        debug!(gate = %self.name, gates = %render(&enabled), "feature gates updated");
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Whether `feature` is enabled.
    ///
    /// An explicit override wins. Otherwise the feature's default at the
    /// effective version applies, except that a feature deprecated or
    /// removed at that version is always off.
    ///
    /// # Panics
    ///
    /// Panics if `feature` was never registered. Features must be added
    /// before they are queried.
    pub fn enabled(&self, feature: impl AsRef<str>) -> bool {
        let key = feature.as_ref();
        if let Some(v) = self.enabled.load().get(key) {
            return *v;
        }
        match self.known.load().get(key) {
            Some(spec) => {
                let r = spec.resolve(&self.effective_version());
                !r.deprecated && !r.removed && r.default
            }
            None => panic!("feature {key:?} is not registered in FeatureGate {:?}", self.name),
        }
    }

    /// Resolution of a registered feature at the effective version.
    pub fn resolution(&self, feature: impl AsRef<str>) -> Option<Resolution> {
        self.known
            .load()
            .get(feature.as_ref())
            .map(|spec| spec.resolve(&self.effective_version()))
    }

    /// Default value of a registered feature at the effective version.
    pub fn default_value(&self, feature: impl AsRef<str>) -> Option<bool> {
        self.resolution(feature).map(|r| r.default)
    }

    /// Whether a registered feature may be flipped at runtime: declared
    /// dynamic, and neither locked nor removed at the effective version.
    pub fn may_be_set_dynamically(&self, feature: impl AsRef<str>) -> bool {
        let key = feature.as_ref();
        let known = self.known.load();
        let Some(spec) = known.get(key) else {
            return false;
        };
        let r = spec.resolve(&self.effective_version());
        spec.spec().dynamic && !r.locked && !r.removed
    }

    /// Human-readable list of settable features, sorted.
    ///
    /// GA, deprecated, and removed features are hidden.
    pub fn known_features(&self) -> Vec<String> {
        let at = self.effective_version();
        let mut known: Vec<String> = self
            .known
            .load()
            .iter()
            .filter_map(|(feature, spec)| {
                let r = spec.resolve(&at);
                if matches!(r.pre_release, PreRelease::GA | PreRelease::Deprecated) || r.removed {
                    return None;
                }
                Some(format!(
                    "{feature}=true|false ({} - default={})",
                    r.pre_release, r.default
                ))
            })
            .collect();
        known.sort();
        known
    }

    // ── Flag binding ───────────────────────────────────────────────

    /// Bind the gate to the command line. Further `add` calls fail.
    pub fn close(&self) {
        *self.writer.lock() = true;
    }

    pub fn is_closed(&self) -> bool {
        *self.writer.lock()
    }

    /// Close the gate and return help text for `--feature-gates`.
    pub fn flag_help(&self) -> String {
        self.close();
        format!(
            "A set of key=value pairs that describe feature gates for alpha/experimental features. \
             Options are:\n{}",
            self.known_features().join("\n")
        )
    }

    /// Independent copy for "what-if" validation.
    ///
    /// The copy shares nothing mutable with `self`; setting gates on it
    /// leaves the original untouched. The closed flag and compatibility
    /// version carry over.
    pub fn deep_copy(&self) -> FeatureGate {
        let closed = *self.writer.lock();
        FeatureGate {
            name: self.name.clone(),
            binary_version: self.binary_version.clone(),
            writer: Mutex::new(closed),
            known: ArcSwap::from_pointee(KnownMap::clone(&self.known.load())),
            enabled: ArcSwap::from_pointee(EnabledMap::clone(&self.enabled.load())),
            compatibility_version: ArcSwapOption::new(self.compatibility_version.load_full()),
        }
    }
}

impl fmt::Display for FeatureGate {
    /// Explicit overrides as `"k1=v1,k2=v2"`, sorted.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render(&self.enabled.load()))
    }
}

impl fmt::Debug for FeatureGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureGate")
            .field("name", &self.name)
            .field("binary_version", &format_major_minor(&self.binary_version))
            .field("compatibility_version", &self.compatibility_version().map(|v| format_major_minor(&v)))
            .field("enabled", &render(&self.enabled.load()))
            .finish()
    }
}

fn backfill(
    known: &KnownMap,
    enabled: &mut EnabledMap,
    requested: &BTreeMap<String, bool>,
    stage: PreRelease,
    value: bool,
    at: &Version,
) {
    for (feature, spec) in known {
        if requested.contains_key(feature.as_str()) {
            continue;
        }
        if spec.prerelease_at(at) != stage || spec.locked_to_default_at(at) {
            continue;
        }
        enabled.insert(feature.clone(), value);
    }
}

fn render(enabled: &EnabledMap) -> String {
    let mut pairs: Vec<String> = enabled.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    pairs.join(",")
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GateErrorKind;
    use crate::spec::HistoryEvent;
    use proptest::prelude::*;

    const TEST_ALPHA: Feature = Feature::from_static("TestAlpha");
    const TEST_BETA: Feature = Feature::from_static("TestBeta");
    const TEST_GA: Feature = Feature::from_static("TestGA");
    const TEST_DEPRECATED: Feature = Feature::from_static("TestDeprecated");
    const TEST_LOCKED_TRUE: Feature = Feature::from_static("TestLockedTrue");
    const TEST_LOCKED_FALSE: Feature = Feature::from_static("TestLockedFalse");

    fn alpha_beta_gate() -> FeatureGate {
        let gate = FeatureGate::new("1.29");
        gate.add([
            (TEST_ALPHA, FeatureSpec::alpha(false)),
            (TEST_BETA, FeatureSpec::beta(false)),
        ])
        .unwrap();
        gate
    }

    fn override_of(gate: &FeatureGate, feature: &Feature) -> bool {
        gate.enabled.load().get(feature).copied().unwrap_or(false)
    }

    #[test]
    fn flag_parsing_and_special_gates() {
        // (arg, AllAlpha, AllBeta, TestAlpha, TestBeta, error)
        let cases: &[(&str, [bool; 4], Option<&str>)] = &[
            ("", [false, false, false, false], None),
            ("fooBarBaz=true", [false, false, false, false], Some("unrecognized feature gate: fooBarBaz")),
            ("AllAlpha=false", [false, false, false, false], None),
            ("AllAlpha=true", [true, false, true, false], None),
            ("AllAlpha=banana", [false, false, false, false], Some("invalid value of AllAlpha")),
            ("AllAlpha=false,TestAlpha=true", [false, false, true, false], None),
            ("TestAlpha=true,AllAlpha=false", [false, false, true, false], None),
            ("AllAlpha=true,TestAlpha=false", [true, false, false, false], None),
            ("TestAlpha=false,AllAlpha=true", [true, false, false, false], None),
            ("TestBeta=true,AllAlpha=false", [false, false, false, true], None),
            ("AllBeta=false", [false, false, false, false], None),
            ("AllBeta=true", [false, true, false, true], None),
            ("AllBeta=banana", [false, false, false, false], Some("invalid value of AllBeta")),
            ("AllBeta=false,TestBeta=true", [false, false, false, true], None),
            ("TestBeta=true,AllBeta=false", [false, false, false, true], None),
            ("AllBeta=true,TestBeta=false", [false, true, false, false], None),
            ("TestBeta=false,AllBeta=true", [false, true, false, false], None),
            ("TestAlpha=true,AllBeta=false", [false, false, true, false], None),
        ];

        for (arg, expect, error) in cases {
            let gate = alpha_beta_gate();
            let result = gate.set(arg);
            match error {
                Some(msg) => {
                    let err = result.expect_err(arg);
                    assert!(err.to_string().contains(msg), "{arg}: got {err}");
                }
                None => result.unwrap_or_else(|e| panic!("{arg}: {e}")),
            }
            let actual = [
                override_of(&gate, &ALL_ALPHA),
                override_of(&gate, &ALL_BETA),
                override_of(&gate, &TEST_ALPHA),
                override_of(&gate, &TEST_BETA),
            ];
            assert_eq!(&actual, expect, "{arg}");
        }
    }

    #[test]
    fn missing_value_is_rejected() {
        let gate = alpha_beta_gate();
        assert_eq!(
            gate.set("TestAlpha"),
            Err(GateError::MissingValue("TestAlpha".to_string()))
        );
    }

    #[test]
    fn empty_segments_are_skipped() {
        let gate = alpha_beta_gate();
        gate.set(",TestAlpha=true,,").unwrap();
        assert!(gate.enabled(&TEST_ALPHA));
    }

    #[test]
    fn later_set_overrides_earlier() {
        let gate = alpha_beta_gate();
        gate.set("TestAlpha=true,TestBeta=true").unwrap();
        assert!(gate.enabled(&TEST_ALPHA));
        assert!(gate.enabled(&TEST_BETA));

        gate.set("TestAlpha=false").unwrap();
        assert!(!gate.enabled(&TEST_ALPHA));
        assert!(gate.enabled(&TEST_BETA));
    }

    #[test]
    fn defaults_apply_without_overrides() {
        let gate = FeatureGate::new("1.29");
        gate.add([
            (TEST_ALPHA, FeatureSpec::alpha(false)),
            (TEST_BETA, FeatureSpec::beta(true)),
        ])
        .unwrap();
        assert!(!gate.enabled(&TEST_ALPHA));
        assert!(gate.enabled(&TEST_BETA));
    }

    #[test]
    fn known_features_hide_ga_and_deprecated() {
        let gate = FeatureGate::new("1.29");
        gate.add([
            (TEST_ALPHA, FeatureSpec::alpha(false)),
            (TEST_BETA, FeatureSpec::beta(true)),
            (TEST_GA, FeatureSpec::ga(true)),
            (TEST_DEPRECATED, FeatureSpec::deprecated(false)),
        ])
        .unwrap();

        let known = gate.known_features();
        let joined = known.join(" ");
        assert!(joined.contains("TestAlpha=true|false (ALPHA - default=false)"));
        assert!(joined.contains("TestBeta=true|false (BETA - default=true)"));
        assert!(!joined.contains("TestGA"));
        assert!(!joined.contains("TestDeprecated"));

        let mut sorted = known.clone();
        sorted.sort();
        assert_eq!(known, sorted);
    }

    #[test]
    fn locked_gates_only_accept_their_default() {
        let gate = FeatureGate::new("1.29");
        gate.add([
            (TEST_LOCKED_TRUE, FeatureSpec::ga(true).locked()),
            (TEST_LOCKED_FALSE, FeatureSpec::ga(false).locked()),
        ])
        .unwrap();

        gate.set_from_map([("TestLockedTrue", true), ("TestLockedFalse", false)])
            .unwrap();

        let err = gate.set_from_map([("TestLockedTrue", false)]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot set feature gate TestLockedTrue to false, feature is locked to true"
        );
        assert_eq!(err.kind(), GateErrorKind::Conflict);

        let err = gate.set_from_map([("TestLockedFalse", true)]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot set feature gate TestLockedFalse to true, feature is locked to false"
        );
    }

    #[test]
    fn failed_set_leaves_state_unchanged() {
        let gate = FeatureGate::new("1.29");
        gate.add([
            (TEST_ALPHA, FeatureSpec::alpha(false)),
            (TEST_LOCKED_TRUE, FeatureSpec::ga(true).locked()),
        ])
        .unwrap();
        gate.set("TestAlpha=false").unwrap();
        let before = gate.to_string();

        assert!(gate.set_from_map([("TestAlpha", true), ("TestLockedTrue", false)]).is_err());
        assert!(gate.set_from_map([("TestAlpha", true), ("Nope", true)]).is_err());
        assert_eq!(gate.to_string(), before);
        assert!(!gate.enabled(&TEST_ALPHA));
    }

    #[test]
    fn lock_follows_compatibility_version() {
        let gate = FeatureGate::new("1.30");
        gate.add([(
            TEST_GA,
            FeatureSpec::ga(true)
                .at(HistoryEvent::DefaultEnabled, "1.27")
                .at(HistoryEvent::LockedToDefault, "1.29"),
        )])
        .unwrap();

        assert!(gate.set_from_map([("TestGA", false)]).is_err());

        gate.set_compatibility_version("1.28").unwrap();
        gate.set_from_map([("TestGA", false)]).unwrap();
        assert!(!gate.enabled(&TEST_GA));
    }

    #[test]
    fn all_alpha_skips_locked_features() {
        let gate = FeatureGate::new("1.29");
        gate.add([
            (TEST_ALPHA, FeatureSpec::alpha(false)),
            (TEST_LOCKED_FALSE, FeatureSpec::alpha(false).locked()),
        ])
        .unwrap();
        gate.set("AllAlpha=true").unwrap();
        assert!(gate.enabled(&TEST_ALPHA));
        assert!(!gate.enabled(&TEST_LOCKED_FALSE));
    }

    #[test]
    fn display_renders_sorted_overrides() {
        let cases: &[(&[(&str, bool)], &str)] = &[
            (&[("TestAlpha", false)], "TestAlpha=false"),
            (&[("TestAlpha", false), ("TestBeta", true)], "TestAlpha=false,TestBeta=true"),
            (
                &[("TestGA", true), ("TestAlpha", false), ("TestBeta", true)],
                "TestAlpha=false,TestBeta=true,TestGA=true",
            ),
        ];
        for (setmap, expect) in cases {
            let gate = FeatureGate::new("1.29");
            gate.add([
                (TEST_GA, FeatureSpec::ga(true)),
                (TEST_ALPHA, FeatureSpec::alpha(false)),
                (TEST_BETA, FeatureSpec::beta(true)),
            ])
            .unwrap();
            gate.set_from_map(setmap.iter().copied()).unwrap();
            assert_eq!(gate.to_string(), *expect);
        }
    }

    #[test]
    fn add_is_idempotent_for_identical_specs() {
        let gate = alpha_beta_gate();
        gate.add([(TEST_ALPHA, FeatureSpec::alpha(false))]).unwrap();
        assert_eq!(
            gate.add([(TEST_ALPHA, FeatureSpec::alpha(true))]),
            Err(GateError::Conflict(TEST_ALPHA))
        );
    }

    #[test]
    fn add_with_conflict_registers_nothing() {
        let gate = alpha_beta_gate();
        let fresh = Feature::from_static("Fresh");
        assert!(
            gate.add([
                (fresh.clone(), FeatureSpec::beta(true)),
                (TEST_ALPHA, FeatureSpec::beta(true)),
            ])
            .is_err()
        );
        assert!(!gate.is_known(&fresh));
    }

    #[test]
    fn add_after_close_fails() {
        let gate = alpha_beta_gate();
        let help = gate.flag_help();
        assert!(help.contains("TestAlpha=true|false"));
        assert!(gate.is_closed());
        assert_eq!(
            gate.add([(Feature::from_static("Late"), FeatureSpec::beta(true))]),
            Err(GateError::Closed)
        );
    }

    #[test]
    #[should_panic(expected = "is not registered")]
    fn enabled_panics_for_unregistered() {
        let gate = FeatureGate::new("1.29");
        gate.enabled("Unregistered");
    }

    #[test]
    fn compatibility_version_shape_is_enforced() {
        let gate = FeatureGate::new("1.29");
        assert_eq!(
            gate.set_compatibility_version("1.28.1"),
            Err(GateError::MajorAndMinorOnly("1.28.1".to_string()))
        );
        assert!(gate.compatibility_version().is_none());
    }

    #[test]
    fn default_enabled_follows_compatibility_version() {
        let gate = FeatureGate::new("1.29");
        let f = Feature::from_static("f");
        gate.add([(f.clone(), FeatureSpec::beta(true).at(HistoryEvent::DefaultEnabled, "1.28"))])
            .unwrap();

        gate.set_compatibility_version("1.27").unwrap();
        assert!(!gate.enabled(&f));
        gate.set_compatibility_version("1.28").unwrap();
        assert!(gate.enabled(&f));
    }

    #[test]
    fn compatibility_matrix() {
        let gate = FeatureGate::new("1.30");
        gate.add([
            (
                Feature::from("alpha_default_on_v1_29"),
                FeatureSpec::alpha(true).at(HistoryEvent::DefaultEnabled, "1.29"),
            ),
            (Feature::from("alpha_default_off"), FeatureSpec::alpha(false)),
            (
                Feature::from("beta_default_on_v1_28_deprecated_from_v1_29"),
                FeatureSpec::beta(true)
                    .at(HistoryEvent::DefaultEnabled, "1.28")
                    .at(HistoryEvent::FeatureDeprecated, "1.29"),
            ),
            (Feature::from("beta_default_off"), FeatureSpec::beta(false)),
            (
                Feature::from("stable_default_on_v1_24"),
                FeatureSpec::ga(true).at(HistoryEvent::DefaultEnabled, "1.24"),
            ),
            (Feature::from("stable_default_off"), FeatureSpec::ga(false)),
        ])
        .unwrap();

        let expectations: &[(&str, [bool; 6])] = &[
            ("1.24", [false, false, false, false, true, false]),
            ("1.27", [false, false, false, false, true, false]),
            ("1.28", [false, false, true, false, true, false]),
            ("1.29", [true, false, false, false, true, false]),
            ("1.30", [true, false, false, false, true, false]),
        ];
        let names = [
            "alpha_default_on_v1_29",
            "alpha_default_off",
            "beta_default_on_v1_28_deprecated_from_v1_29",
            "beta_default_off",
            "stable_default_on_v1_24",
            "stable_default_off",
        ];

        for (version, expected) in expectations {
            gate.set_compatibility_version(version).unwrap();
            for (name, want) in names.iter().zip(expected) {
                assert_eq!(gate.enabled(name), *want, "{name} at {version}");
            }
        }
    }

    #[test]
    fn removed_feature_is_off_without_override() {
        let gate = FeatureGate::new("1.30");
        let f = Feature::from_static("Gone");
        gate.add([(f.clone(), FeatureSpec::ga(true).at(HistoryEvent::Removed, "1.30"))])
            .unwrap();
        assert!(!gate.enabled(&f));
        assert!(!gate.known_features().iter().any(|k| k.starts_with("Gone")));

        gate.set_compatibility_version("1.29").unwrap();
        assert!(gate.enabled(&f));
    }

    #[test]
    fn deprecated_stage_without_event_keeps_default() {
        let gate = FeatureGate::new("1.30");
        gate.add([
            (Feature::from_static("OldOn"), FeatureSpec::deprecated(true)),
            (Feature::from_static("OldOff"), FeatureSpec::deprecated(false)),
        ])
        .unwrap();
        assert!(gate.enabled("OldOn"));
        assert!(!gate.enabled("OldOff"));
        assert!(!gate.known_features().iter().any(|k| k.starts_with("Old")));
    }

    #[test]
    fn deep_copy_is_independent() {
        let gate = alpha_beta_gate();
        gate.set("TestAlpha=true").unwrap();

        let copy = gate.deep_copy();
        copy.set("TestAlpha=false,TestBeta=true").unwrap();
        copy.set_compatibility_version("1.20").unwrap();
        copy.add([(Feature::from_static("OnlyInCopy"), FeatureSpec::beta(true))])
            .unwrap();

        assert!(gate.enabled(&TEST_ALPHA));
        assert!(!gate.enabled(&TEST_BETA));
        assert!(gate.compatibility_version().is_none());
        assert!(!gate.is_known("OnlyInCopy"));

        assert!(!copy.enabled(&TEST_ALPHA));
        assert!(copy.enabled(&TEST_BETA));
    }

    #[test]
    fn dynamic_settability() {
        let gate = FeatureGate::new("1.29");
        gate.add([
            (TEST_ALPHA, FeatureSpec::alpha(false).dynamic()),
            (TEST_BETA, FeatureSpec::beta(true)),
            (TEST_LOCKED_TRUE, FeatureSpec::ga(true).locked().dynamic()),
        ])
        .unwrap();
        assert!(gate.may_be_set_dynamically(&TEST_ALPHA));
        assert!(!gate.may_be_set_dynamically(&TEST_BETA));
        assert!(!gate.may_be_set_dynamically(&TEST_LOCKED_TRUE));
        assert!(!gate.may_be_set_dynamically("Unregistered"));
        assert_eq!(gate.default_value(&TEST_BETA), Some(true));
    }

    #[test]
    fn concurrent_readers_see_whole_snapshots() {
        let gate = Arc::new(alpha_beta_gate());
        let writer = {
            let gate = gate.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    let on = i % 2 == 0;
                    gate.set_from_map([("TestAlpha", on), ("TestBeta", on)]).unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let snapshot = gate.enabled.load();
                        let a = snapshot.get(&TEST_ALPHA).copied().unwrap_or(false);
                        let b = snapshot.get(&TEST_BETA).copied().unwrap_or(false);
                        assert_eq!(a, b);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }

    proptest! {
        #[test]
        fn set_from_map_is_idempotent(alpha: bool, beta: bool, all_alpha: bool) {
            let gate = alpha_beta_gate();
            let m = [("TestAlpha", alpha), ("TestBeta", beta), ("AllAlpha", all_alpha)];

            gate.set_from_map(m).unwrap();
            let first = (gate.enabled(&TEST_ALPHA), gate.enabled(&TEST_BETA), gate.to_string());
            gate.set_from_map(m).unwrap();
            let second = (gate.enabled(&TEST_ALPHA), gate.enabled(&TEST_BETA), gate.to_string());
            prop_assert_eq!(first, second);
        }

        #[test]
        fn unset_compatibility_resolves_at_binary_version(
            default in any::<bool>(),
            anchor in 0u64..40,
            binary in 0u64..40,
        ) {
            let gate = FeatureGate::new(&format!("1.{binary}"));
            let f = Feature::from_static("Probe");
            let spec = FeatureSpec::beta(default).at(HistoryEvent::DefaultEnabled, format!("1.{anchor}"));
            gate.add([(f.clone(), spec.clone())]).unwrap();

            let versioned = VersionedSpec::new(&f, spec).unwrap();
            let expected = versioned.default_at(&Version::new(1, binary, 0));
            prop_assert_eq!(gate.enabled(&f), expected);
        }
    }
}
