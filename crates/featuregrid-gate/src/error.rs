//! Error types for feature gates.

use thiserror::Error;

use crate::spec::{Feature, HistoryEvent};

/// Result type alias for feature gate operations.
pub type GateResult<T> = Result<T, GateError>;

/// Errors returned by [`FeatureGate`](crate::FeatureGate) operations.
///
/// None of these leave the gate partially updated: every failing call
/// returns before the new snapshot is published.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("version string must only contain major and minor: {0:?}")]
    MajorAndMinorOnly(String),

    #[error("missing bool value for {0}")]
    MissingValue(String),

    #[error("invalid value of {key}={value}, err: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("unrecognized feature gate: {0}")]
    Unrecognized(String),

    #[error("feature {feature}: {event} recorded at both {first} and {second}")]
    DuplicateHistoryEvent {
        feature: Feature,
        event: HistoryEvent,
        first: String,
        second: String,
    },

    #[error("feature {feature}: invalid {event} version {version:?}")]
    InvalidHistoryVersion {
        feature: Feature,
        event: HistoryEvent,
        version: String,
    },

    #[error("cannot set feature gate {feature} to {requested}, feature is locked to {locked}")]
    Locked {
        feature: Feature,
        requested: bool,
        locked: bool,
    },

    #[error("feature gate {0:?} with different spec already exists")]
    Conflict(Feature),

    #[error("cannot add a feature gate after adding it to the flag set")]
    Closed,
}

/// Coarse classification of a [`GateError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateErrorKind {
    /// Malformed input: bad version shape, bad boolean, unknown key.
    Validation,
    /// Input conflicts with what is already registered or locked.
    Conflict,
}

impl GateError {
    pub fn kind(&self) -> GateErrorKind {
        match self {
            GateError::MajorAndMinorOnly(_)
            | GateError::MissingValue(_)
            | GateError::InvalidValue { .. }
            | GateError::Unrecognized(_)
            | GateError::InvalidHistoryVersion { .. } => GateErrorKind::Validation,
            GateError::DuplicateHistoryEvent { .. }
            | GateError::Locked { .. }
            | GateError::Conflict(_)
            | GateError::Closed => GateErrorKind::Conflict,
        }
    }
}
