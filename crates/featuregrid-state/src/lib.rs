//! featuregrid-state — the cluster-wide Feature object store.
//!
//! Every host publishes one Feature record per feature it owns. Records
//! are keyed by `{class}/{name}` and JSON-serialized into redb's `&[u8]`
//! value columns.
//!
//! # Architecture
//!
//! ```text
//!   set_desired ──┐                       ┌──► subscribe() (broadcast)
//!                 ├──► StateStore (redb) ─┤
//!   apply_status ─┘                       └──► get / list (cache reads)
//! ```
//!
//! Writers never replace a record wholesale: `apply_status` merges only
//! the fields it carries, and a merge that changes nothing is not written
//! and emits no event. Reconcilers can therefore re-apply the same status
//! any number of times.
//!
//! The `StateStore` is `Clone + Send + Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks and across in-process hosts.

pub mod cache;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use cache::{FeatureEvent, FeatureStore};
pub use error::{Access, StateError, StateResult};
pub use store::StateStore;
pub use types::*;
