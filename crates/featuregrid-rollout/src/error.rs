//! Error types for rollout coordination.

use featuregrid_state::StateError;
use thiserror::Error;

/// Result type alias for reconciliation.
pub type HostResult<T> = Result<T, HostError>;

/// Errors returned by provider operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("unimplemented")]
    Unimplemented,

    #[error("{0}")]
    Failed(String),
}

/// Transient reconciliation failures. The host logs these and requeues
/// the feature with backoff; they never stop the worker loop.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("feature {feature}: {hook} hook failed: {source}")]
    Hook {
        feature: String,
        hook: &'static str,
        #[source]
        source: ProviderError,
    },

    #[error("feature {feature}: publishing status failed: {source}")]
    Apply {
        feature: String,
        #[source]
        source: StateError,
    },

    #[error("reading feature store: {0}")]
    Store(#[from] StateError),
}
