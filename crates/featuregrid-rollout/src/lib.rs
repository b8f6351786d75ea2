//! featuregrid rollout coordination.
//!
//! Every host of a feature class runs a [`Host`]. Hosts learn about their
//! siblings through [`Host::on_remote_host_change`] and about the cluster's
//! latched version through the reserved `ClusterVersion` feature record.
//! From those two inputs each host derives a [`CombinedState`] and
//! reconciles the Feature records it owns, running provider hooks on
//! either side of a version change.
//!
//! # Components
//!
//! - **`state`** — Remote summary, deterministic leader election, the combined state machine
//! - **`queue`** — Rate-limited work queue with per-key dedup and backoff
//! - **`provider`** — Provider contract and the gate-backed `Class` builder
//! - **`host`** — The coordinator: event pump, workers, shutdown
//! - **`sync`** — Per-feature reconciliation
//! - **`client`** — Reads enablement from published Feature records

pub mod client;
pub mod error;
pub mod host;
pub mod provider;
pub mod queue;
pub mod state;
pub mod sync;

pub use client::FeatureGateClient;
pub use error::{HostError, HostResult, ProviderError};
pub use host::{CLUSTER_VERSION, FIELD_MANAGER, ForeignFeaturePolicy, Host, HostConfig, IgnoreForeign};
pub use provider::{Class, FeatureLocalState, Operations, Provider, Settability};
pub use queue::WorkQueue;
pub use state::{
    ClusterState, CombinedState, HostInfo, RemoteHostState, StateMachine, Transition, combine,
    deterministic_leader, summarize_remotes,
};
