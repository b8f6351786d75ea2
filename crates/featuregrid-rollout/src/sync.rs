//! Per-feature reconciliation.
//!
//! `sync_feature` is level-triggered: it reads the published record and
//! the combined state, runs whatever provider hook the host's role calls
//! for, and publishes one additive status patch. Running it again with
//! nothing changed publishes an identical patch, which the store drops.

use std::cmp::Ordering;
use std::time::Duration;

use featuregrid_gate::parse_major_minor;
use featuregrid_state::{
    Enablement, FeatureRecord, FeatureState, FeatureStore, StabilityLevel, StatusApply,
};
use tracing::{debug, info, trace, warn};

use crate::error::{HostError, HostResult};
use crate::host::{CLUSTER_VERSION, FIELD_MANAGER, Host};
use crate::provider::Settability;
use crate::state::CombinedState;

const APPLY_ATTEMPTS: u32 = 4;
const APPLY_INITIAL_BACKOFF: Duration = Duration::from_millis(10);

/// Role of this host for the current combined state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Running the version the cluster is at or moving to.
    Latest,
    /// Running the version the cluster is moving away from.
    Prior,
    /// Nothing sensible is known yet.
    Undecided,
}

fn role(state: &CombinedState, my_version: &str, published: Option<&str>) -> Role {
    if !state.sensible {
        return Role::Undecided;
    }
    let changing = state.changing_to_version.as_str();
    let latched = state.cluster.latched_version.as_str();
    if my_version == changing || (changing.is_empty() && my_version == latched) {
        return Role::Latest;
    }
    if !changing.is_empty() && published == Some(my_version) {
        return Role::Prior;
    }
    Role::Undecided
}

/// First step of a dynamic flip, if `desired` calls for one.
fn begin_transition(desired: Option<Enablement>, state: FeatureState) -> Option<FeatureState> {
    match (desired?, state) {
        (Enablement::Enabled, FeatureState::Off) => Some(FeatureState::TurningOn),
        (Enablement::Disabled, FeatureState::On) => Some(FeatureState::TurningOff),
        _ => None,
    }
}

fn oldest_version(versions: &[String]) -> Option<&String> {
    versions.iter().min_by(|a, b| {
        match (parse_major_minor(a), parse_major_minor(b)) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => a.cmp(b),
        }
    })
}

impl<S: FeatureStore> Host<S> {
    /// Reconcile one feature. Safe to call any number of times.
    ///
    /// Only the leader of this host's version bucket acts. Hook failures
    /// and publish failures come back as errors; nothing is published
    /// when a hook fails.
    pub async fn sync_feature(&self, name: &str) -> HostResult<()> {
        if name == CLUSTER_VERSION {
            return self.sync_cluster_version().await;
        }

        let me = &self.inner.me;
        let existing = self.inner.store.get(&me.class, name)?;

        let Some(local) = self.inner.providers.get(name).cloned() else {
            self.inner.foreign.handle(me, name, existing.as_ref());
            return Ok(());
        };

        let (leader, state) = {
            let sm = self.inner.state.lock();
            (sm.is_leader(), sm.current())
        };
        if !leader {
            trace!(host = %me.name, feature = %name, "not the leader, skipping");
            return Ok(());
        }

        let settings = local.settings();
        let published = existing.as_ref().map(|r| r.status.version.as_str());
        let role = role(&state, &me.version, published);
        let latched = state.cluster.latched_version.as_str();
        let may_create = role == Role::Latest || (state.sensible && me.version == latched);
        if existing.is_none() && (latched.is_empty() || !may_create) {
            trace!(
                host = %me.name,
                feature = %name,
                %latched,
                "no record and not at the cluster version, waiting"
            );
            return Ok(());
        }

        let mut apply = StatusApply::new(&settings.class, &settings.name);
        if role == Role::Latest || existing.is_none() {
            apply = apply
                .with_stability(settings.stability)
                .with_default(Enablement::from_bool(settings.default_value == FeatureState::On));
        }

        match &existing {
            None => {
                apply = apply
                    .with_version(latched)
                    .with_state(settings.configured_value);
            }
            Some(record) => {
                let published = record.status.version.as_str();
                match role {
                    Role::Latest if published != latched => {
                        info!(
                            host = %me.name,
                            feature = %name,
                            from = %published,
                            to = %latched,
                            "running post-version-change hook"
                        );
                        local
                            .post_version_change(published, latched)
                            .map_err(|source| HostError::Hook {
                                feature: name.to_string(),
                                hook: "post_version_change",
                                source,
                            })?;
                        apply = apply.with_version(latched);
                    }
                    Role::Prior => {
                        let to = state.changing_to_version.as_str();
                        info!(
                            host = %me.name,
                            feature = %name,
                            from = %published,
                            %to,
                            "running pre-version-change hook"
                        );
                        local
                            .pre_version_change(published, to)
                            .map_err(|source| HostError::Hook {
                                feature: name.to_string(),
                                hook: "pre_version_change",
                                source,
                            })?;
                    }
                    _ => {}
                }

                if settings.settability == Settability::Dynamic {
                    if let Some(next) = begin_transition(record.spec.desired, record.status.state) {
                        info!(
                            host = %me.name,
                            feature = %name,
                            from = %record.status.state,
                            to = %next,
                            "beginning dynamic transition"
                        );
                        apply = apply.with_state(next);
                    }
                }
            }
        }

        self.publish(apply).await?;
        Ok(())
    }

    /// Maintain the `ClusterVersion` record.
    ///
    /// A missing latch is bootstrapped to the oldest version running.
    /// Once every host runs the version being changed to, the latch is
    /// advanced to it.
    async fn sync_cluster_version(&self) -> HostResult<()> {
        let me = &self.inner.me;
        let existing = self.inner.store.get(&me.class, CLUSTER_VERSION)?;
        let latched = existing
            .as_ref()
            .map(|r| r.status.version.clone())
            .unwrap_or_default();
        if !latched.is_empty() {
            self.observe_cluster_version(&latched);
        }

        let (leader, latest) = {
            let sm = self.inner.state.lock();
            (sm.is_leader(), sm.latest().clone())
        };
        if !leader {
            return Ok(());
        }

        let target = if latched.is_empty() {
            match oldest_version(&latest.remote.versions) {
                Some(oldest) => oldest.clone(),
                None => return Ok(()),
            }
        } else if latest.sensible
            && latest.changing_to_version == me.version
            && latest.remote.versions == [me.version.as_str()]
        {
            me.version.clone()
        } else {
            return Ok(());
        };

        info!(host = %me.name, from = %latched, to = %target, "latching cluster version");
        let apply = StatusApply::new(&me.class, CLUSTER_VERSION)
            .with_version(target.as_str())
            .with_stability(StabilityLevel::Universal)
            .with_default(Enablement::Enabled)
            .with_state(FeatureState::On);
        let record = self.publish(apply).await?;
        self.observe_cluster_version(&record.status.version);
        Ok(())
    }

    /// Apply a status patch, retrying transient failures with a short
    /// backoff before giving the error back to the queue.
    async fn publish(&self, apply: StatusApply) -> HostResult<FeatureRecord> {
        let mut delay = APPLY_INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            match self
                .inner
                .store
                .apply_status(apply.clone(), FIELD_MANAGER)
                .await
            {
                Ok(record) => {
                    debug!(
                        feature = %record.name(),
                        resource_version = record.resource_version,
                        state = %record.status.state,
                        version = %record.status.version,
                        "feature status published"
                    );
                    return Ok(record);
                }
                Err(e) if e.is_transient() && attempt < APPLY_ATTEMPTS => {
                    warn!(feature = %apply.name, attempt, error = %e, "apply failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(HostError::Apply {
                        feature: apply.name.clone(),
                        source,
                    });
                }
            }
        }
    }
}
