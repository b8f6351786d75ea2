//! Feature names and feature specs.

use std::borrow::{Borrow, Cow};
use std::fmt;

/// Name of a feature gate.
///
/// Cheap to clone for `'static` names, so gates can be declared as
/// constants with [`Feature::from_static`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Feature(Cow<'static, str>);

impl Feature {
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Feature {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Feature {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Feature {
    fn from(name: &str) -> Self {
        Self(Cow::Owned(name.to_string()))
    }
}

impl From<String> for Feature {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

/// Maturity stage of a feature.
///
/// Ordered so that promotion moves "up": `PreAlpha < Alpha < Beta < GA`.
/// `Deprecated` sorts last but is not a promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PreRelease {
    PreAlpha,
    Alpha,
    Beta,
    GA,
    Deprecated,
}

impl fmt::Display for PreRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PreRelease::PreAlpha => "PRE-ALPHA",
            PreRelease::Alpha => "ALPHA",
            PreRelease::Beta => "BETA",
            PreRelease::GA => "GA",
            PreRelease::Deprecated => "DEPRECATED",
        })
    }
}

/// A life-cycle event in a feature's history, anchored to a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HistoryEvent {
    PromotedToAlpha,
    PromotedToBeta,
    PromotedToGA,
    DefaultEnabled,
    DefaultDisabled,
    LockedToDefault,
    FeatureDeprecated,
    Removed,
}

impl fmt::Display for HistoryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HistoryEvent::PromotedToAlpha => "PromotedToAlpha",
            HistoryEvent::PromotedToBeta => "PromotedToBeta",
            HistoryEvent::PromotedToGA => "PromotedToGA",
            HistoryEvent::DefaultEnabled => "DefaultEnabled",
            HistoryEvent::DefaultDisabled => "DefaultDisabled",
            HistoryEvent::LockedToDefault => "LockedToDefault",
            HistoryEvent::FeatureDeprecated => "FeatureDeprecated",
            HistoryEvent::Removed => "Removed",
        })
    }
}

/// Declared behavior of a feature gate.
///
/// The static fields describe the feature at the binary's own version.
/// `history` anchors life-cycle events to `MAJOR.MINOR` versions so the
/// gate can answer for older compatibility versions too. An aspect with
/// no matching history event falls back to its static field.
///
/// Once added to a gate a spec is frozen. Re-adding an identical spec is
/// a no-op; re-adding a different one is a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSpec {
    pub default: bool,
    pub lock_to_default: bool,
    pub pre_release: PreRelease,
    /// Whether the feature may be flipped at runtime through the cluster
    /// Feature object rather than only at process start.
    pub dynamic: bool,
    pub history: Vec<(HistoryEvent, String)>,
}

impl FeatureSpec {
    pub fn new(pre_release: PreRelease, default: bool) -> Self {
        Self {
            default,
            lock_to_default: false,
            pre_release,
            dynamic: false,
            history: Vec::new(),
        }
    }

    pub fn alpha(default: bool) -> Self {
        Self::new(PreRelease::Alpha, default)
    }

    pub fn beta(default: bool) -> Self {
        Self::new(PreRelease::Beta, default)
    }

    pub fn ga(default: bool) -> Self {
        Self::new(PreRelease::GA, default)
    }

    pub fn deprecated(default: bool) -> Self {
        Self::new(PreRelease::Deprecated, default)
    }

    /// Lock the feature to its default.
    pub fn locked(mut self) -> Self {
        self.lock_to_default = true;
        self
    }

    /// Mark the feature as settable at runtime.
    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }

    /// Record a history event at a `MAJOR.MINOR` version.
    ///
    /// The version is validated when the spec is added to a gate.
    pub fn at(mut self, event: HistoryEvent, version: impl Into<String>) -> Self {
        self.history.push((event, version.into()));
        self
    }
}
