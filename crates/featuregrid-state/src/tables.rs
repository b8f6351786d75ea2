//! redb table definitions for the Feature object store.

use redb::TableDefinition;

/// Feature records keyed by `{class}/{name}`.
pub const FEATURES: TableDefinition<&str, &[u8]> = TableDefinition::new("features");

/// Store bookkeeping (the resource version counter).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub const RESOURCE_VERSION_KEY: &str = "resource_version";
