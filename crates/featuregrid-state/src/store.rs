//! StateStore — redb-backed Feature object persistence.
//!
//! Records are JSON-serialized into redb's `&[u8]` value columns. Each
//! write runs in a single redb write transaction that reads the current
//! record, merges the change, bumps the store-wide resource version, and
//! commits; the resulting [`FeatureEvent`] is broadcast after commit.
//! The store supports both on-disk and in-memory backends (the latter
//! for testing and for in-process multi-host setups).

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable};
use tokio::sync::broadcast;
use tracing::debug;

use crate::cache::{FeatureEvent, FeatureStore};
use crate::error::{Access, StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Capacity of the event channel. Slow subscribers see `Lagged` and
/// are expected to relist.
const EVENT_CAPACITY: usize = 1024;

/// Thread-safe Feature store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    events: broadcast::Sender<FeatureEvent>,
    synced: Arc<AtomicBool>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(StateError::at(Access::Open))?;
        let store = Self::with_database(db)?;
        debug!(?path, "feature store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(StateError::at(Access::Open))?;
        let store = Self::with_database(db)?;
        debug!("in-memory feature store opened");
        Ok(store)
    }

    fn with_database(db: Database) -> StateResult<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = Self {
            db: Arc::new(db),
            events,
            synced: Arc::new(AtomicBool::new(false)),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(StateError::at(Access::Begin))?;
        txn.open_table(FEATURES).map_err(StateError::at(Access::Table))?;
        txn.open_table(META).map_err(StateError::at(Access::Table))?;
        txn.commit().map_err(StateError::at(Access::Commit))?;
        Ok(())
    }

    /// Declare the initial load complete. Readers gated on
    /// [`FeatureStore::has_synced`] proceed from here on.
    pub fn mark_synced(&self) {
        if !self.synced.swap(true, Ordering::SeqCst) {
            debug!("feature store synced");
        }
    }

    /// Current value of the store-wide resource version counter.
    pub fn resource_version(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(StateError::at(Access::Begin))?;
        let table = txn.open_table(META).map_err(StateError::at(Access::Table))?;
        let current = table
            .get(RESOURCE_VERSION_KEY)
            .map_err(StateError::at(Access::Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        Ok(current)
    }

    /// Delete a record. Returns true if it existed.
    pub fn delete(&self, class: &str, name: &str) -> StateResult<bool> {
        let key = table_key(class, name);
        let txn = self.db.begin_write().map_err(StateError::at(Access::Begin))?;
        let removed = {
            let mut table = txn.open_table(FEATURES).map_err(StateError::at(Access::Table))?;
            let removed = table.remove(key.as_str()).map_err(StateError::at(Access::Write))?;
            match removed {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            }
        };
        txn.commit().map_err(StateError::at(Access::Commit))?;

        let existed = removed.is_some();
        if let Some(record) = removed {
            self.publish(FeatureEvent::Deleted(record));
        }
        debug!(%key, existed, "feature deleted");
        Ok(existed)
    }

    /// Read-merge-write one record in a single transaction.
    ///
    /// `mutate` returns whether it changed the record. An unchanged
    /// existing record is not written and no event is published.
    fn update(
        &self,
        class: &str,
        name: &str,
        create: bool,
        mutate: impl FnOnce(&mut FeatureRecord) -> bool,
    ) -> StateResult<FeatureRecord> {
        let key = table_key(class, name);
        let txn = self.db.begin_write().map_err(StateError::at(Access::Begin))?;

        let (old, new) = {
            let mut table = txn.open_table(FEATURES).map_err(StateError::at(Access::Table))?;
            let old = match table.get(key.as_str()).map_err(StateError::at(Access::Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };

            let mut new = match &old {
                Some(record) => record.clone(),
                None if create => FeatureRecord::new(class, name),
                None => {
                    return Err(StateError::NotFound {
                        class: class.to_string(),
                        name: name.to_string(),
                    });
                }
            };
            let changed = mutate(&mut new);
            if old.is_some() && !changed {
                return Ok(new);
            }

            let mut meta = txn.open_table(META).map_err(StateError::at(Access::Table))?;
            let resource_version = meta
                .get(RESOURCE_VERSION_KEY)
                .map_err(StateError::at(Access::Read))?
                .map(|guard| guard.value())
                .unwrap_or(0)
                + 1;
            meta.insert(RESOURCE_VERSION_KEY, resource_version)
                .map_err(StateError::at(Access::Write))?;

            new.resource_version = resource_version;
            new.updated_at = now_secs();
            let value = serde_json::to_vec(&new).map_err(|e| StateError::Encode {
                class: class.to_string(),
                name: name.to_string(),
                reason: e.to_string(),
            })?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(StateError::at(Access::Write))?;
            (old, new)
        };
        txn.commit().map_err(StateError::at(Access::Commit))?;

        debug!(%key, resource_version = new.resource_version, "feature stored");
        self.publish(match old {
            Some(old) => FeatureEvent::Updated {
                old,
                new: new.clone(),
            },
            None => FeatureEvent::Added(new.clone()),
        });
        Ok(new)
    }

    fn publish(&self, event: FeatureEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

impl FeatureStore for StateStore {
    fn get(&self, class: &str, name: &str) -> StateResult<Option<FeatureRecord>> {
        let key = table_key(class, name);
        let txn = self.db.begin_read().map_err(StateError::at(Access::Begin))?;
        let table = txn.open_table(FEATURES).map_err(StateError::at(Access::Table))?;
        match table.get(key.as_str()).map_err(StateError::at(Access::Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn list(&self, class: &str) -> StateResult<Vec<FeatureRecord>> {
        let prefix = format!("{class}/");
        let txn = self.db.begin_read().map_err(StateError::at(Access::Begin))?;
        let table = txn.open_table(FEATURES).map_err(StateError::at(Access::Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(StateError::at(Access::Read))? {
            let (key, value) = entry.map_err(StateError::at(Access::Read))?;
            if key.value().starts_with(&prefix) {
                results.push(decode(value.value())?);
            }
        }
        Ok(results)
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<FeatureEvent> {
        self.events.subscribe()
    }

    async fn apply_status(
        &self,
        apply: StatusApply,
        field_manager: &str,
    ) -> StateResult<FeatureRecord> {
        let class = apply.class.clone();
        let name = apply.name.clone();
        self.update(&class, &name, true, |record| {
            let changed = apply.merge_into(&mut record.status);
            if changed {
                record.field_manager = Some(field_manager.to_string());
            }
            changed
        })
    }

    fn set_desired(
        &self,
        class: &str,
        name: &str,
        desired: Option<Enablement>,
    ) -> StateResult<FeatureRecord> {
        self.update(class, name, false, |record| {
            let changed = record.spec.desired != desired;
            record.spec.desired = desired;
            changed
        })
    }
}

fn decode(bytes: &[u8]) -> StateResult<FeatureRecord> {
    serde_json::from_slice(bytes).map_err(|e| StateError::Corrupt(e.to_string()))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
