//! featuregrid-gate — versioned feature gates.
//!
//! Decides whether a feature is enabled, given the feature's maturity
//! history and a chosen compatibility version. Operators override the
//! computed defaults with `--feature-gates=k1=v1,k2=v2` style input.
//!
//! # Architecture
//!
//! ```text
//! FeatureGate
//!   ├── known    ArcSwap<HashMap<Feature, VersionedSpec>>   (registry, append-only)
//!   ├── enabled  ArcSwap<HashMap<Feature, bool>>            (operator overrides)
//!   ├── compat   ArcSwapOption<Version>                     (unset = binary version)
//!   └── writer lock (parking_lot::Mutex) — read-copy-mutate-publish
//!
//! VersionedSpec (resolver)
//!   ├── prerelease_at(v)      PreAlpha → Alpha → Beta → GA, or Deprecated
//!   ├── default_at(v)         last applicable DefaultEnabled/DefaultDisabled
//!   ├── locked_to_default_at(v)
//!   └── deprecated_at(v) / removed_at(v)
//! ```
//!
//! Reads never block: `enabled` loads the current snapshots and never sees
//! a half-written map. Writers serialize on one mutex and publish a fresh
//! map when they are done.

pub mod error;
pub mod gate;
pub mod resolve;
pub mod spec;
pub mod version;

pub use error::{GateError, GateErrorKind, GateResult};
pub use gate::{ALL_ALPHA, ALL_BETA, FeatureGate};
pub use resolve::{Resolution, VersionedSpec};
pub use spec::{Feature, FeatureSpec, HistoryEvent, PreRelease};
pub use version::{format_major_minor, parse_major_minor};
