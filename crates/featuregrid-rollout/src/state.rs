//! What a host believes about its siblings and the cluster.
//!
//! Two inputs arrive independently: the sibling host list (summarized
//! into a [`RemoteHostState`]) and the cluster's latched version (a
//! [`ClusterState`]). [`combine`] folds them into a [`CombinedState`];
//! the [`StateMachine`] keeps the last sensible result and reports
//! version-change edges.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Identity of a host, local or remote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostInfo {
    /// Kind of host, e.g. `"apiserver"`. Hosts only handle their own class.
    pub class: String,
    /// Identity of one running binary, e.g. `"apiserver on node-3"`.
    pub name: String,
    /// `MAJOR.MINOR` version of the binary.
    pub version: String,
}

impl HostInfo {
    pub fn new(
        class: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            class: class.into(),
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Summary of the sibling hosts of our class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteHostState {
    /// True when we lead the hosts running our version.
    pub leader: bool,
    /// Distinct versions running, ours included, sorted.
    pub versions: Vec<String>,
}

/// What we believe about the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterState {
    /// Version the cluster has converged to. Empty until published.
    pub latched_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CombinedState {
    /// Non-empty while a version change is in flight.
    pub changing_to_version: String,
    /// False when no conclusion can be drawn from the inputs.
    pub sensible: bool,
    pub remote: RemoteHostState,
    pub cluster: ClusterState,
}

/// A version-change edge, reported once per edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    VersionChangeStarted { from: String, to: String },
    VersionChangeFinished { version: String },
}

// ── Leader election ───────────────────────────────────────────────

/// Pick a leader from a set of names.
///
/// The name with the smallest SHA-256 digest wins. The result depends
/// only on the set of names, never on their order.
pub fn deterministic_leader<S: AsRef<str>>(names: &[S]) -> Option<&str> {
    names
        .iter()
        .map(|n| (digest(n.as_ref()), n.as_ref()))
        .min()
        .map(|(_, name)| name)
}

fn digest(name: &str) -> [u8; 32] {
    Sha256::digest(name.as_bytes()).into()
}

/// Summarize the sibling list from `me`'s point of view.
///
/// Hosts of other classes are ignored. `me` is always counted at its own
/// version; a remote entry carrying `me`'s name is taken to be a stale
/// view of ourselves and skipped.
pub fn summarize_remotes(remotes: &[HostInfo], me: &HostInfo) -> RemoteHostState {
    let mut by_version: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for remote in remotes
        .iter()
        .filter(|r| r.class == me.class && r.name != me.name)
    {
        by_version
            .entry(remote.version.as_str())
            .or_default()
            .insert(remote.name.as_str());
    }
    by_version
        .entry(me.version.as_str())
        .or_default()
        .insert(me.name.as_str());

    let peers: Vec<&str> = by_version
        .get(me.version.as_str())
        .map(|names| names.iter().copied().collect())
        .unwrap_or_default();
    let elected = deterministic_leader(&peers);
    if let Some(elected) = elected {
        debug!(
            host = %me.name,
            version = %me.version,
            leader = %elected,
            digest = %hex::encode(&digest(elected)[..8]),
            "bucket leader elected"
        );
    }

    RemoteHostState {
        leader: elected == Some(me.name.as_str()),
        versions: by_version.keys().map(|v| v.to_string()).collect(),
    }
}

// ── Combination ───────────────────────────────────────────────────

/// Fold the remote summary and the cluster state together.
///
/// With no latched version nothing can be concluded. Otherwise, with no
/// version other than the latched one running the state is steady; with
/// exactly one other version that version is being rolled to; with two
/// or more others the state is not sensible.
pub fn combine(remote: RemoteHostState, cluster: ClusterState) -> CombinedState {
    let mut state = CombinedState {
        changing_to_version: String::new(),
        sensible: false,
        remote,
        cluster,
    };
    if state.cluster.latched_version.is_empty() {
        return state;
    }

    let others: BTreeSet<&String> = state
        .remote
        .versions
        .iter()
        .filter(|v| **v != state.cluster.latched_version)
        .collect();
    let changing_to = match others.len() {
        0 => Some(String::new()),
        1 => others.into_iter().next().cloned(),
        _ => None,
    };

    if let Some(to) = changing_to {
        state.changing_to_version = to;
        state.sensible = true;
    }
    state
}

// ── State machine ─────────────────────────────────────────────────

/// Holds the raw inputs and the last sensible combined state.
///
/// Decisions read [`StateMachine::current`], which never regresses to an
/// insensible snapshot once a sensible one has been seen. Leadership is
/// read from the latest inputs regardless.
#[derive(Debug, Default)]
pub struct StateMachine {
    latest: CombinedState,
    sensible: Option<CombinedState>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn change_host_state(&mut self, remote: RemoteHostState) -> Option<Transition> {
        let next = combine(remote, self.latest.cluster.clone());
        self.advance(next)
    }

    pub fn change_cluster_state(&mut self, cluster: ClusterState) -> Option<Transition> {
        let next = combine(self.latest.remote.clone(), cluster);
        self.advance(next)
    }

    fn advance(&mut self, next: CombinedState) -> Option<Transition> {
        self.latest = next.clone();
        if !next.sensible {
            debug!(
                latched = %next.cluster.latched_version,
                versions = ?next.remote.versions,
                "combined state not sensible, keeping previous"
            );
            return None;
        }

        let previous = self.sensible.replace(next);
        edge(previous.as_ref(), &self.latest)
    }

    /// The state decisions are made on.
    ///
    /// The last sensible snapshot, or the latest inputs if nothing
    /// sensible has been seen yet.
    pub fn current(&self) -> CombinedState {
        self.sensible
            .clone()
            .unwrap_or_else(|| self.latest.clone())
    }

    /// The most recent combination, sensible or not.
    pub fn latest(&self) -> &CombinedState {
        &self.latest
    }

    pub fn is_leader(&self) -> bool {
        self.latest.remote.leader
    }
}

fn edge(previous: Option<&CombinedState>, next: &CombinedState) -> Option<Transition> {
    let was_changing = previous
        .map(|p| p.changing_to_version.as_str())
        .unwrap_or_default();

    if !next.changing_to_version.is_empty() && next.changing_to_version != was_changing {
        return Some(Transition::VersionChangeStarted {
            from: next.cluster.latched_version.clone(),
            to: next.changing_to_version.clone(),
        });
    }
    if next.changing_to_version.is_empty() && !was_changing.is_empty() {
        return Some(Transition::VersionChangeFinished {
            version: next.cluster.latched_version.clone(),
        });
    }
    None
}
