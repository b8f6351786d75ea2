//! Daemon assembly: gate, store, providers and the feature host.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use featuregrid_gate::FeatureGate;
use featuregrid_rollout::{Class, Host, HostConfig, HostInfo, Operations, Provider};
use featuregrid_state::{FeatureState, StateStore};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::DaemonConfig;

pub const DEFAULT_DATA_DIR: &str = "/var/lib/featured";
const DB_FILE: &str = "featured.redb";

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub data_dir: Option<PathBuf>,
    pub feature_gates: Vec<String>,
    pub compatibility_version: Option<String>,
    pub workers: Option<usize>,
    pub name: Option<String>,
}

impl Overrides {
    pub fn apply(&self, config: &mut DaemonConfig) {
        if let Some(dir) = &self.data_dir {
            config.data_dir = Some(dir.clone());
        }
        if let Some(v) = &self.compatibility_version {
            config.compatibility_version = Some(v.clone());
        }
        if let Some(workers) = self.workers {
            config.workers = Some(workers);
        }
        if let Some(name) = &self.name {
            config.host.name = name.clone();
        }
    }
}

pub fn data_dir(config: &DaemonConfig) -> PathBuf {
    config
        .data_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

pub fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let store = StateStore::open(&data_dir.join(DB_FILE))?;
    Ok(store)
}

/// Register the configured features and apply overrides, config file
/// first and then `extra` in order.
pub fn build_gate(config: &DaemonConfig, extra: &[String]) -> anyhow::Result<FeatureGate> {
    let gate = FeatureGate::try_new(&config.host.version)?.with_name(config.host.class.clone());
    gate.add(config.features.iter().map(|f| (f.feature(), f.to_spec())))?;

    if let Some(v) = &config.compatibility_version {
        gate.set_compatibility_version(v)?;
    }
    for value in config.feature_gates.iter().chain(extra) {
        gate.set(value)
            .with_context(|| format!("invalid --feature-gates {value:?}"))?;
    }
    gate.close();
    Ok(gate)
}

/// One provider per configured feature. The daemon has no work of its
/// own to do around a version change, so the hooks record the event.
pub fn providers(config: &DaemonConfig, gate: &FeatureGate) -> Vec<Arc<dyn Provider>> {
    let class = config.host.class.clone();
    config
        .features
        .iter()
        .fold(Class::new(class, gate), |builder, feature| {
            let name = feature.name.clone();
            builder.add_provider(&feature.feature(), logging_operations(name))
        })
        .list()
}

fn logging_operations(name: String) -> Operations {
    let pre = name.clone();
    let post = name.clone();
    Operations::new()
        .on_pre_version_change(move |old, new| {
            info!(feature = %pre, %old, %new, "preparing for version change");
            Ok(())
        })
        .on_post_version_change(move |old, new| {
            info!(feature = %post, %old, %new, "version change complete");
            Ok(())
        })
        .on_state_change(move |desired: FeatureState| {
            info!(feature = %name, %desired, "feature state change");
            desired
        })
}

/// Run the feature host until `shutdown` flips.
pub async fn run(
    config: DaemonConfig,
    extra_gates: &[String],
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let gate = build_gate(&config, extra_gates)?;
    info!(
        gate = %gate.name(),
        effective_version = %featuregrid_gate::format_major_minor(&gate.effective_version()),
        overrides = %gate,
        "feature gate ready"
    );

    let dir = data_dir(&config);
    let store = Arc::new(open_store(&dir)?);
    info!(path = %dir.display(), "state store opened");
    store.mark_synced();

    let me = config.host.clone();
    let mut host_config = HostConfig::new(store.clone(), me.clone())
        .with_providers(providers(&config, &gate));
    if let Some(workers) = config.workers {
        host_config = host_config.with_workers(workers);
    }
    let host = Host::new(host_config);

    let siblings = membership(&me, &config.peers);
    host.on_remote_host_change(&siblings);
    info!(
        host = %me.name,
        leader = host.is_leader(),
        hosts = siblings.len(),
        features = ?host.local_features(),
        "membership announced"
    );

    host.run(shutdown).await?;
    Ok(())
}

/// The full sibling list: configured peers of our class plus ourselves.
fn membership(me: &HostInfo, peers: &[HostInfo]) -> Vec<HostInfo> {
    let mut hosts: Vec<HostInfo> = peers
        .iter()
        .filter(|p| {
            if p.class != me.class {
                warn!(peer = %p.name, class = %p.class, "peer belongs to another class, ignoring");
                return false;
            }
            p.name != me.name
        })
        .cloned()
        .collect();
    hosts.push(me.clone());
    hosts
}
