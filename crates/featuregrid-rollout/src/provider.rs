//! Feature providers.
//!
//! A [`Provider`] is the local owner of one feature: it reports the
//! feature's settings and carries out the work a version change or a
//! runtime flip requires. Feature authors rarely implement the trait by
//! hand; they describe the operations they need in an [`Operations`]
//! bundle and let [`Class`] derive the rest from the feature gate.

use std::fmt;
use std::sync::Arc;

use featuregrid_gate::{Feature, FeatureGate, PreRelease};
use featuregrid_state::{FeatureState, StabilityLevel};
use tracing::debug;

use crate::error::ProviderError;

/// Whether a feature may change while the host runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settability {
    Immutable,
    Dynamic,
}

/// A provider's view of its feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureLocalState {
    pub name: String,
    pub class: String,
    pub settability: Settability,
    pub default_value: FeatureState,
    /// The value in effect at startup. For dynamic features this is only
    /// the initial state until a desired state is published.
    pub configured_value: FeatureState,
    pub stability: StabilityLevel,
}

/// Local owner of one feature.
///
/// Every operation must be idempotent: the host may call any of them
/// several times with the same arguments before it observes the effect.
pub trait Provider: Send + Sync {
    fn feature_name(&self) -> &str;

    fn feature_class(&self) -> &str;

    fn settings(&self) -> FeatureLocalState;

    /// Called on hosts still at `old_version` while the cluster moves to
    /// `new_version`.
    fn pre_version_change(&self, old_version: &str, new_version: &str)
    -> Result<(), ProviderError>;

    /// Called on hosts at the latched version once the cluster has moved
    /// there from `old_version`.
    fn post_version_change(
        &self,
        old_version: &str,
        new_version: &str,
    ) -> Result<(), ProviderError>;

    /// Move toward `desired`, returning the state actually reached.
    fn state_change(&self, desired: FeatureState) -> FeatureState;

    /// Exercise the feature so it can be tested automatically.
    fn exercise(&self) -> Result<(), ProviderError>;
}

pub type VersionChangeFn = Arc<dyn Fn(&str, &str) -> Result<(), ProviderError> + Send + Sync>;
pub type StateChangeFn = Arc<dyn Fn(FeatureState) -> FeatureState + Send + Sync>;
pub type ExerciseFn = Arc<dyn Fn() -> Result<(), ProviderError> + Send + Sync>;

/// The operations a feature author may implement. Unset operations get
/// a default: version hooks succeed, `state_change` reaches the desired
/// state at once, and `exercise` fails with
/// [`ProviderError::Unimplemented`].
#[derive(Clone, Default)]
pub struct Operations {
    pub pre_version_change: Option<VersionChangeFn>,
    pub post_version_change: Option<VersionChangeFn>,
    pub state_change: Option<StateChangeFn>,
    pub exercise: Option<ExerciseFn>,
}

impl Operations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_pre_version_change(
        mut self,
        f: impl Fn(&str, &str) -> Result<(), ProviderError> + Send + Sync + 'static,
    ) -> Self {
        self.pre_version_change = Some(Arc::new(f));
        self
    }

    pub fn on_post_version_change(
        mut self,
        f: impl Fn(&str, &str) -> Result<(), ProviderError> + Send + Sync + 'static,
    ) -> Self {
        self.post_version_change = Some(Arc::new(f));
        self
    }

    pub fn on_state_change(
        mut self,
        f: impl Fn(FeatureState) -> FeatureState + Send + Sync + 'static,
    ) -> Self {
        self.state_change = Some(Arc::new(f));
        self
    }

    pub fn on_exercise(
        mut self,
        f: impl Fn() -> Result<(), ProviderError> + Send + Sync + 'static,
    ) -> Self {
        self.exercise = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for Operations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operations")
            .field("pre_version_change", &self.pre_version_change.is_some())
            .field("post_version_change", &self.post_version_change.is_some())
            .field("state_change", &self.state_change.is_some())
            .field("exercise", &self.exercise.is_some())
            .finish()
    }
}

/// Provider built by [`Class::add_provider`].
#[derive(Debug)]
struct GateProvider {
    local_state: FeatureLocalState,
    operations: Operations,
}

impl Provider for GateProvider {
    fn feature_name(&self) -> &str {
        &self.local_state.name
    }

    fn feature_class(&self) -> &str {
        &self.local_state.class
    }

    fn settings(&self) -> FeatureLocalState {
        self.local_state.clone()
    }

    fn pre_version_change(
        &self,
        old_version: &str,
        new_version: &str,
    ) -> Result<(), ProviderError> {
        match &self.operations.pre_version_change {
            Some(f) => f(old_version, new_version),
            None => Ok(()),
        }
    }

    fn post_version_change(
        &self,
        old_version: &str,
        new_version: &str,
    ) -> Result<(), ProviderError> {
        match &self.operations.post_version_change {
            Some(f) => f(old_version, new_version),
            None => Ok(()),
        }
    }

    fn state_change(&self, desired: FeatureState) -> FeatureState {
        match &self.operations.state_change {
            Some(f) => f(desired),
            None => desired,
        }
    }

    fn exercise(&self) -> Result<(), ProviderError> {
        match &self.operations.exercise {
            Some(f) => f(),
            None => Err(ProviderError::Unimplemented),
        }
    }
}

/// Builds the providers of one feature class from a command-line gate.
///
/// ```ignore
/// let providers = Class::new("apiserver", &gate)
///     .add_provider(&MY_FEATURE, Operations::new())
///     .list();
/// ```
pub struct Class<'g> {
    class: String,
    gate: &'g FeatureGate,
    providers: Vec<Arc<dyn Provider>>,
}

impl<'g> Class<'g> {
    pub fn new(class: impl Into<String>, gate: &'g FeatureGate) -> Self {
        Self {
            class: class.into(),
            gate,
            providers: Vec::new(),
        }
    }

    /// Add a provider for `feature`, reading its settings from the gate.
    ///
    /// # Panics
    ///
    /// Panics if `feature` is not registered with the gate.
    pub fn add_provider(mut self, feature: &Feature, operations: Operations) -> Self {
        let on = self.gate.enabled(feature);
        let dynamic = self.gate.may_be_set_dynamically(feature);
        let resolution = self.gate.resolution(feature);
        let default = resolution.map(|r| r.default).unwrap_or(false);
        let stability = resolution
            .map(|r| stability_of(r.pre_release))
            .unwrap_or_default();

        let local_state = FeatureLocalState {
            name: feature.to_string(),
            class: self.class.clone(),
            settability: if dynamic {
                Settability::Dynamic
            } else {
                Settability::Immutable
            },
            default_value: FeatureState::from_bool(default),
            configured_value: FeatureState::from_bool(on),
            stability,
        };
        debug!(
            class = %self.class,
            feature = %feature,
            settability = ?local_state.settability,
            configured = %local_state.configured_value,
            "provider added"
        );

        self.providers.push(Arc::new(GateProvider {
            local_state,
            operations,
        }));
        self
    }

    pub fn list(self) -> Vec<Arc<dyn Provider>> {
        self.providers
    }
}

fn stability_of(pre_release: PreRelease) -> StabilityLevel {
    match pre_release {
        PreRelease::PreAlpha => StabilityLevel::Unavailable,
        PreRelease::Alpha => StabilityLevel::Alpha,
        PreRelease::Beta => StabilityLevel::Beta,
        PreRelease::GA => StabilityLevel::GA,
        PreRelease::Deprecated => StabilityLevel::Deprecated,
    }
}
