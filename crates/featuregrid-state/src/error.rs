//! Errors from the Feature record store.

use std::fmt;

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

/// The step of a store call that reached the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Open,
    Begin,
    Table,
    Read,
    Write,
    Commit,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Access::Open => "open",
            Access::Begin => "begin transaction",
            Access::Table => "open table",
            Access::Read => "read",
            Access::Write => "write",
            Access::Commit => "commit",
        })
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    /// The database refused a step of the call.
    #[error("feature store {access} failed: {reason}")]
    Backend { access: Access, reason: String },

    /// A stored record no longer decodes as a Feature.
    #[error("stored feature record is corrupt: {0}")]
    Corrupt(String),

    #[error("feature {class}/{name} cannot be encoded: {reason}")]
    Encode {
        class: String,
        name: String,
        reason: String,
    },

    /// Spec writes need a record the controller already published.
    #[error("feature {name} has not been published for class {class}")]
    NotFound { class: String, name: String },
}

impl StateError {
    /// Closure for `map_err` tagging a database error with its step.
    pub fn at<E: fmt::Display>(access: Access) -> impl FnOnce(E) -> Self {
        move |e| StateError::Backend {
            access,
            reason: e.to_string(),
        }
    }

    /// Whether repeating the same call can succeed.
    ///
    /// Database steps past opening may fail transiently. Corrupt or
    /// unencodable records and missing features stay that way until
    /// something else changes.
    pub fn is_transient(&self) -> bool {
        matches!(self, StateError::Backend { access, .. } if *access != Access::Open)
    }
}
