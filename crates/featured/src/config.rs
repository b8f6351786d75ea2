//! featured.toml configuration parser.
//!
//! ```toml
//! data_dir = "/var/lib/featured"
//! workers = 2
//! feature_gates = "Foo=true,AllAlpha=false"
//! compatibility_version = "1.28"
//!
//! [host]
//! class = "apiserver"
//! name = "apiserver-node-1"
//! version = "1.29"
//!
//! [[peers]]
//! class = "apiserver"
//! name = "apiserver-node-2"
//! version = "1.28"
//!
//! [[features]]
//! name = "Foo"
//! stage = "beta"
//! default = true
//! dynamic = true
//! history = [{ event = "PromotedToBeta", version = "1.28" }]
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use featuregrid_gate::{Feature, FeatureSpec, HistoryEvent, PreRelease, parse_major_minor};
use featuregrid_rollout::HostInfo;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub host: HostInfo,
    pub data_dir: Option<PathBuf>,
    pub workers: Option<usize>,
    /// Overrides in `k1=v1,k2=v2` form, applied before any from the
    /// command line.
    pub feature_gates: Option<String>,
    pub compatibility_version: Option<String>,
    #[serde(default)]
    pub peers: Vec<HostInfo>,
    #[serde(default)]
    pub features: Vec<FeatureConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub name: String,
    pub stage: Stage,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub lock_to_default: bool,
    #[serde(default)]
    pub dynamic: bool,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    PreAlpha,
    Alpha,
    Beta,
    Ga,
    Deprecated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub event: EventName,
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventName {
    PromotedToAlpha,
    PromotedToBeta,
    PromotedToGA,
    DefaultEnabled,
    DefaultDisabled,
    LockedToDefault,
    FeatureDeprecated,
    Removed,
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.host.class.is_empty() || self.host.name.is_empty() {
            bail!("host class and name must be set");
        }
        parse_major_minor(&self.host.version)
            .with_context(|| format!("host version {:?}", self.host.version))?;
        for peer in &self.peers {
            parse_major_minor(&peer.version)
                .with_context(|| format!("peer {} version {:?}", peer.name, peer.version))?;
        }

        let mut seen = HashSet::new();
        for feature in &self.features {
            if feature.name.is_empty() {
                bail!("feature with empty name");
            }
            if !seen.insert(feature.name.as_str()) {
                bail!("feature {} declared twice", feature.name);
            }
        }
        Ok(())
    }
}

impl FeatureConfig {
    pub fn feature(&self) -> Feature {
        Feature::from(self.name.clone())
    }

    pub fn to_spec(&self) -> FeatureSpec {
        let mut spec = FeatureSpec::new(self.stage.into(), self.default);
        spec.lock_to_default = self.lock_to_default;
        spec.dynamic = self.dynamic;
        for entry in &self.history {
            spec = spec.at(entry.event.into(), entry.version.clone());
        }
        spec
    }
}

impl From<Stage> for PreRelease {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::PreAlpha => PreRelease::PreAlpha,
            Stage::Alpha => PreRelease::Alpha,
            Stage::Beta => PreRelease::Beta,
            Stage::Ga => PreRelease::GA,
            Stage::Deprecated => PreRelease::Deprecated,
        }
    }
}

impl From<EventName> for HistoryEvent {
    fn from(event: EventName) -> Self {
        match event {
            EventName::PromotedToAlpha => HistoryEvent::PromotedToAlpha,
            EventName::PromotedToBeta => HistoryEvent::PromotedToBeta,
            EventName::PromotedToGA => HistoryEvent::PromotedToGA,
            EventName::DefaultEnabled => HistoryEvent::DefaultEnabled,
            EventName::DefaultDisabled => HistoryEvent::DefaultDisabled,
            EventName::LockedToDefault => HistoryEvent::LockedToDefault,
            EventName::FeatureDeprecated => HistoryEvent::FeatureDeprecated,
            EventName::Removed => HistoryEvent::Removed,
        }
    }
}
