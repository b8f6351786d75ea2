//! Reads feature enablement from published Feature records.

use std::collections::HashMap;
use std::sync::Arc;

use featuregrid_state::FeatureStore;
use parking_lot::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct Usage {
    requires_restart: bool,
    /// Only meaningful when `requires_restart` is set.
    latched: bool,
}

/// Enablement as the cluster has published it for one class.
///
/// Two kinds of read are offered. [`enabled`](FeatureGateClient::enabled)
/// is for callers that cannot change behavior without a restart: the
/// first answer they get is the answer forever. [`enabled_stateless`]
/// re-reads on every call and suits code that checks the feature at each
/// use. Once any caller has used `enabled` for a feature, every read of
/// that feature returns the latched value.
///
/// [`enabled_stateless`]: FeatureGateClient::enabled_stateless
pub struct FeatureGateClient<S> {
    class: String,
    store: Arc<S>,
    checked: Mutex<HashMap<String, Usage>>,
}

impl<S: FeatureStore> FeatureGateClient<S> {
    pub fn new(class: impl Into<String>, store: Arc<S>) -> Self {
        Self {
            class: class.into(),
            store,
            checked: Mutex::new(HashMap::new()),
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    /// Resolve once the underlying cache has synced.
    pub async fn wait_synced(&self) {
        self.store.wait_for_sync().await;
    }

    /// Whether `feature` is on, latched for the life of the process.
    pub async fn enabled(&self, feature: impl AsRef<str>) -> bool {
        self.wait_synced().await;
        self.read(feature.as_ref(), true)
    }

    /// Whether `feature` is on right now.
    pub async fn enabled_stateless(&self, feature: impl AsRef<str>) -> bool {
        self.wait_synced().await;
        self.read(feature.as_ref(), false)
    }

    fn read(&self, feature: &str, requires_restart: bool) -> bool {
        let mut checked = self.checked.lock();
        if let Some(prev) = checked.get(feature) {
            if prev.requires_restart {
                return prev.latched;
            }
        }

        let current = self.current(feature);
        let usage = checked.entry(feature.to_string()).or_insert(Usage {
            requires_restart: false,
            latched: current,
        });
        if requires_restart && !usage.requires_restart {
            usage.requires_restart = true;
            usage.latched = current;
            debug!(class = %self.class, %feature, value = current, "feature value latched");
        }
        current
    }

    fn current(&self, feature: &str) -> bool {
        match self.store.get(&self.class, feature) {
            Ok(Some(record)) => record.status.state.reads_as_on(),
            Ok(None) => false,
            Err(e) => {
                warn!(class = %self.class, %feature, error = %e, "reading feature failed, treating as off");
                false
            }
        }
    }
}
