//! The read/watch/apply surface hosts and clients program against.

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::error::StateResult;
use crate::types::{Enablement, FeatureRecord, StatusApply};

/// Poll interval while waiting for the initial sync.
const SYNC_POLL_PERIOD: Duration = Duration::from_millis(100);

/// A change to a stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureEvent {
    Added(FeatureRecord),
    Updated {
        old: FeatureRecord,
        new: FeatureRecord,
    },
    Deleted(FeatureRecord),
}

impl FeatureEvent {
    /// The most recent version of the record the event is about.
    pub fn record(&self) -> &FeatureRecord {
        match self {
            FeatureEvent::Added(r) | FeatureEvent::Deleted(r) => r,
            FeatureEvent::Updated { new, .. } => new,
        }
    }
}

/// Eventually-consistent access to Feature objects.
///
/// Reads come from a local cache. Writes go through scoped, additive
/// patches; a patch that changes nothing is not written and produces
/// no event.
pub trait FeatureStore: Send + Sync + 'static {
    fn get(&self, class: &str, name: &str) -> StateResult<Option<FeatureRecord>>;

    fn list(&self, class: &str) -> StateResult<Vec<FeatureRecord>>;

    /// Whether the cache has completed its initial load.
    fn has_synced(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<FeatureEvent>;

    /// Merge `apply` into the record's status under `field_manager`,
    /// creating the record if needed. Returns the resulting record.
    fn apply_status(
        &self,
        apply: StatusApply,
        field_manager: &str,
    ) -> impl Future<Output = StateResult<FeatureRecord>> + Send;

    /// Set the operator-owned desired enablement of an existing record.
    fn set_desired(
        &self,
        class: &str,
        name: &str,
        desired: Option<Enablement>,
    ) -> StateResult<FeatureRecord>;

    /// Resolve once [`has_synced`](FeatureStore::has_synced) turns true.
    fn wait_for_sync(&self) -> impl Future<Output = ()> + Send {
        async move {
            while !self.has_synced() {
                tokio::time::sleep(SYNC_POLL_PERIOD).await;
            }
        }
    }
}
