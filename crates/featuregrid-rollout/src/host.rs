//! Feature host — the per-binary rollout coordinator.
//!
//! A host owns a work queue keyed by feature name, a watch on the
//! Feature records of its class, the local providers, and the combined
//! state. Record events enqueue the affected feature; sibling-list and
//! latched-version changes recompute the combined state under the lock
//! and re-enqueue every local feature. Workers pull names off the queue
//! and run [`Host::sync_feature`].

use std::collections::HashMap;
use std::sync::Arc;

use featuregrid_state::{FeatureEvent, FeatureRecord, FeatureStore};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::HostResult;
use crate::provider::Provider;
use crate::queue::WorkQueue;
use crate::state::{
    ClusterState, CombinedState, HostInfo, StateMachine, Transition, summarize_remotes,
};

/// Reserved feature whose published version is the cluster's latched
/// version.
pub const CLUSTER_VERSION: &str = "ClusterVersion";

/// Identity every host applies status patches under.
pub const FIELD_MANAGER: &str = "featurecontroller";

const DEFAULT_WORKERS: usize = 2;

/// What to do with records of our class that no local provider owns.
pub trait ForeignFeaturePolicy: Send + Sync {
    fn handle(&self, me: &HostInfo, name: &str, record: Option<&FeatureRecord>);
}

/// Leaves foreign records alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreForeign;

impl ForeignFeaturePolicy for IgnoreForeign {
    fn handle(&self, me: &HostInfo, name: &str, record: Option<&FeatureRecord>) {
        debug!(
            host = %me.name,
            feature = %name,
            published_version = record.map(|r| r.status.version.as_str()).unwrap_or_default(),
            "no local provider, ignoring"
        );
    }
}

/// Parameters for [`Host::new`].
pub struct HostConfig<S> {
    pub store: Arc<S>,
    pub local: Vec<Arc<dyn Provider>>,
    pub me: HostInfo,
    pub workers: usize,
    pub foreign: Arc<dyn ForeignFeaturePolicy>,
}

impl<S: FeatureStore> HostConfig<S> {
    pub fn new(store: Arc<S>, me: HostInfo) -> Self {
        Self {
            store,
            local: Vec::new(),
            me,
            workers: DEFAULT_WORKERS,
            foreign: Arc::new(IgnoreForeign),
        }
    }

    pub fn with_providers(mut self, providers: Vec<Arc<dyn Provider>>) -> Self {
        self.local = providers;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_foreign_policy(mut self, policy: impl ForeignFeaturePolicy + 'static) -> Self {
        self.foreign = Arc::new(policy);
        self
    }
}

pub(crate) struct Inner<S> {
    pub(crate) store: Arc<S>,
    pub(crate) me: HostInfo,
    pub(crate) providers: HashMap<String, Arc<dyn Provider>>,
    pub(crate) foreign: Arc<dyn ForeignFeaturePolicy>,
    pub(crate) queue: WorkQueue<String>,
    pub(crate) state: Mutex<StateMachine>,
    workers: usize,
}

/// Cloneable handle to a feature host.
pub struct Host<S> {
    pub(crate) inner: Arc<Inner<S>>,
}

impl<S> Clone for Host<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: FeatureStore> Host<S> {
    /// Build a host and enqueue every local feature.
    ///
    /// Providers of another class are dropped with a warning.
    pub fn new(config: HostConfig<S>) -> Self {
        let mut providers = HashMap::new();
        for provider in config.local {
            if provider.feature_class() != config.me.class {
                warn!(
                    host = %config.me.name,
                    feature = %provider.feature_name(),
                    class = %provider.feature_class(),
                    "provider belongs to another class, skipping"
                );
                continue;
            }
            providers.insert(provider.feature_name().to_string(), provider);
        }

        let host = Self {
            inner: Arc::new(Inner {
                store: config.store,
                me: config.me,
                providers,
                foreign: config.foreign,
                queue: WorkQueue::new(),
                state: Mutex::new(StateMachine::new()),
                workers: config.workers,
            }),
        };
        host.enqueue_all_local();
        host
    }

    pub fn me(&self) -> &HostInfo {
        &self.inner.me
    }

    /// The combined state decisions are made on.
    pub fn state(&self) -> CombinedState {
        self.inner.state.lock().current()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.state.lock().is_leader()
    }

    /// Names of the features this host owns, sorted.
    pub fn local_features(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue(&self) -> &WorkQueue<String> {
        &self.inner.queue
    }

    // ── Events ─────────────────────────────────────────────────────

    /// Replace the sibling list. Call with the complete list whenever it
    /// changes.
    ///
    /// Returns the version-change edge this update crossed, if any.
    pub fn on_remote_host_change(&self, remotes: &[HostInfo]) -> Option<Transition> {
        let summary = summarize_remotes(remotes, &self.inner.me);
        let transition = self.inner.state.lock().change_host_state(summary);
        self.log_transition(transition.as_ref());
        self.enqueue_all_local();
        transition
    }

    /// Record the cluster's latched version.
    ///
    /// Returns the version-change edge this update crossed, if any.
    pub fn observe_cluster_version(&self, version: &str) -> Option<Transition> {
        let transition = {
            let mut state = self.inner.state.lock();
            if state.latest().cluster.latched_version == version {
                return None;
            }
            debug!(host = %self.inner.me.name, %version, "latched version observed");
            state.change_cluster_state(ClusterState {
                latched_version: version.to_string(),
            })
        };
        self.log_transition(transition.as_ref());
        self.enqueue_all_local();
        transition
    }

    fn log_transition(&self, transition: Option<&Transition>) {
        let me = &self.inner.me;
        match transition {
            Some(Transition::VersionChangeStarted { from, to }) => {
                info!(host = %me.name, class = %me.class, %from, %to, "version change started");
            }
            Some(Transition::VersionChangeFinished { version }) => {
                info!(host = %me.name, class = %me.class, %version, "version change finished");
            }
            None => {}
        }
    }

    fn handle_event(&self, event: &FeatureEvent) {
        let record = event.record();
        if record.class() != self.inner.me.class {
            return;
        }
        if record.name() == CLUSTER_VERSION
            && !matches!(event, FeatureEvent::Deleted(_))
            && !record.status.version.is_empty()
        {
            self.observe_cluster_version(&record.status.version);
        }
        self.inner.queue.add(record.name().to_string());
    }

    fn enqueue_all_local(&self) {
        for name in self.inner.providers.keys() {
            self.inner.queue.add(name.clone());
        }
        self.inner.queue.add(CLUSTER_VERSION.to_string());
    }

    /// Re-read everything after missing watch events.
    fn resync(&self) -> HostResult<()> {
        for record in self.inner.store.list(&self.inner.me.class)? {
            if record.name() == CLUSTER_VERSION && !record.status.version.is_empty() {
                self.observe_cluster_version(&record.status.version);
            }
            self.inner.queue.add(record.name().to_string());
        }
        self.enqueue_all_local();
        Ok(())
    }

    // ── Run loop ───────────────────────────────────────────────────

    /// Run until `shutdown` flips.
    ///
    /// Waits for the store's initial sync, then runs the workers and the
    /// event pump. On shutdown the queue is shut down so idle workers
    /// return, and in-flight syncs finish before this returns.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> HostResult<()> {
        let me = &self.inner.me;
        info!(
            host = %me.name,
            class = %me.class,
            version = %me.version,
            workers = self.inner.workers,
            "starting feature host controller"
        );

        let mut events = self.inner.store.subscribe();

        tokio::select! {
            _ = self.inner.store.wait_for_sync() => {}
            _ = shutdown.changed() => {
                self.inner.queue.shut_down();
                info!(host = %me.name, "shutting down feature host controller");
                return Ok(());
            }
        }
        self.resync()?;

        let workers: Vec<JoinHandle<()>> = (0..self.inner.workers)
            .map(|_| {
                let host = self.clone();
                tokio::spawn(async move { host.run_worker().await })
            })
            .collect();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(&event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(host = %me.name, missed, "feature watch lagged, resyncing");
                        if let Err(e) = self.resync() {
                            error!(host = %me.name, error = %e, "resync failed");
                        }
                    }
                    Err(RecvError::Closed) => {
                        warn!(host = %me.name, "feature watch closed");
                        break;
                    }
                },
            }
        }

        self.inner.queue.shut_down();
        for worker in workers {
            if let Err(e) = worker.await {
                error!(host = %me.name, error = %e, "worker exited abnormally");
            }
        }
        info!(host = %me.name, "shutting down feature host controller");
        Ok(())
    }

    async fn run_worker(&self) {
        while let Some(key) = self.inner.queue.get().await {
            self.process(key).await;
        }
    }

    async fn process(&self, key: String) {
        let queue = &self.inner.queue;
        match self.sync_feature(&key).await {
            Ok(()) => queue.forget(&key),
            Err(e) => {
                error!(
                    host = %self.inner.me.name,
                    feature = %key,
                    requeues = queue.num_requeues(&key),
                    error = %e,
                    "syncing feature failed"
                );
                queue.add_rate_limited(key.clone());
            }
        }
        queue.done(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::{Class, Operations};
    use featuregrid_gate::{Feature, FeatureGate, FeatureSpec};
    use featuregrid_state::{FeatureState, StateStore, StatusApply};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const F1: Feature = Feature::from_static("MyTestFeature1");
    const F2: Feature = Feature::from_static("MyTestFeature2");

    fn providers(class: &str) -> Vec<Arc<dyn Provider>> {
        let gate = FeatureGate::new("1.29");
        gate.add([(F1, FeatureSpec::beta(true)), (F2, FeatureSpec::alpha(false))])
            .unwrap();
        Class::new(class, &gate)
            .add_provider(&F1, Operations::new())
            .add_provider(&F2, Operations::new())
            .list()
    }

    fn host(store: Arc<StateStore>, name: &str, version: &str) -> Host<StateStore> {
        Host::new(
            HostConfig::new(store, HostInfo::new("x", name, version))
                .with_providers(providers("x")),
        )
    }

    #[test]
    fn new_host_enqueues_local_features() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let h = host(store, "h1", "1.29");
        assert_eq!(h.local_features(), ["MyTestFeature1", "MyTestFeature2"]);
        assert_eq!(h.queue().len(), 3);
    }

    #[test]
    fn foreign_class_providers_are_dropped() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let mut local = providers("x");
        local.extend(providers("y"));
        let h = Host::new(
            HostConfig::new(store, HostInfo::new("x", "h1", "1.29")).with_providers(local),
        );
        assert_eq!(h.local_features().len(), 2);
    }

    #[tokio::test]
    async fn unchanged_latched_version_is_ignored() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let h = host(store, "h1", "1.29");
        h.on_remote_host_change(&[h.me().clone()]);
        h.observe_cluster_version("1.29");
        assert!(h.state().sensible);

        while !h.queue().is_empty() {
            let key = h.queue().get().await.unwrap();
            h.queue().done(&key);
        }
        h.observe_cluster_version("1.29");
        assert!(h.queue().is_empty());

        h.observe_cluster_version("1.30");
        assert_eq!(h.queue().len(), 3);
    }

    #[test]
    fn version_change_edges_are_reported() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let h = host(store, "h1", "1.29");
        assert_eq!(h.on_remote_host_change(&[h.me().clone()]), None);

        assert_eq!(
            h.observe_cluster_version("1.28"),
            Some(Transition::VersionChangeStarted {
                from: "1.28".to_string(),
                to: "1.29".to_string(),
            })
        );
        assert_eq!(h.observe_cluster_version("1.28"), None);

        // A second new version is not sensible and reports nothing.
        let split = [h.me().clone(), HostInfo::new("x", "h2", "1.30")];
        assert_eq!(h.on_remote_host_change(&split), None);
        assert_eq!(h.state().changing_to_version, "1.29");

        assert_eq!(
            h.observe_cluster_version("1.29"),
            Some(Transition::VersionChangeStarted {
                from: "1.29".to_string(),
                to: "1.30".to_string(),
            })
        );
        assert_eq!(
            h.on_remote_host_change(&[h.me().clone()]),
            Some(Transition::VersionChangeFinished {
                version: "1.29".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn failing_feature_is_retried_without_blocking_others() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        for (name, version) in [(CLUSTER_VERSION, "1.29"), ("MyTestFeature1", "1.28")] {
            store
                .apply_status(
                    StatusApply::new("x", name)
                        .with_version(version)
                        .with_state(FeatureState::On),
                    "seed",
                )
                .await
                .unwrap();
        }

        let failing = Arc::new(AtomicBool::new(true));
        let gate = FeatureGate::new("1.29");
        gate.add([(F1, FeatureSpec::beta(true)), (F2, FeatureSpec::alpha(false))])
            .unwrap();
        let post = {
            let failing = failing.clone();
            Operations::new().on_post_version_change(move |_, _| {
                if failing.load(Ordering::SeqCst) {
                    Err(ProviderError::Failed("storage migration pending".to_string()))
                } else {
                    Ok(())
                }
            })
        };
        let local = Class::new("x", &gate)
            .add_provider(&F1, post)
            .add_provider(&F2, Operations::new())
            .list();
        let h = Host::new(
            HostConfig::new(store.clone(), HostInfo::new("x", "h1", "1.29"))
                .with_providers(local),
        );
        h.on_remote_host_change(&[h.me().clone()]);
        store.mark_synced();

        let (tx, rx) = watch::channel(false);
        let runner = {
            let h = h.clone();
            tokio::spawn(async move { h.run(rx).await })
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.get("x", "MyTestFeature2").unwrap().is_none()
            || h.queue().num_requeues(&"MyTestFeature1".to_string()) < 2
        {
            assert!(tokio::time::Instant::now() < deadline, "failure never retried");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let stuck = store.get("x", "MyTestFeature1").unwrap().unwrap();
        assert_eq!(stuck.status.version, "1.28", "failed hook publishes nothing");

        failing.store(false, Ordering::SeqCst);
        loop {
            let f1 = store.get("x", "MyTestFeature1").unwrap().unwrap();
            if f1.status.version == "1.29"
                && h.queue().num_requeues(&"MyTestFeature1".to_string()) == 0
            {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "retry never succeeded");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn run_reconciles_and_stops_on_shutdown() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let h = host(store.clone(), "h1", "1.29");
        h.on_remote_host_change(&[h.me().clone()]);

        let (tx, rx) = watch::channel(false);
        let runner = {
            let h = h.clone();
            tokio::spawn(async move { h.run(rx).await })
        };

        // Nothing happens until the store is synced.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get("x", "MyTestFeature1").unwrap().is_none());
        store.mark_synced();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let f1 = store.get("x", "MyTestFeature1").unwrap();
            let latched = h.state().cluster.latched_version;
            if latched == "1.29" && f1.is_some_and(|r| r.status.version == "1.29") {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "host never converged");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(h.queue().is_shutting_down());
    }
}
