//! Error ledger: failures remembered across rounds.
//!
//! The diff consults the ledger to keep resources whose last failure was
//! fatal out of the round until the Plan for them changes or the cooldown
//! elapses. The reporter publishes the entries under Current's error fields.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shardwarden_core::ShardId;

use crate::error::{Error, Result};

/// Error number reported for a `distributeShardsLike` cycle.
pub const ERROR_NUM_CYCLE: u64 = 1_470;
/// Error number reported for a malformed Plan fragment.
pub const ERROR_NUM_MALFORMED: u64 = 1_471;
/// Error number reported when retries ran out.
pub const ERROR_NUM_RETRIES_EXHAUSTED: u64 = 1_472;

/// What an error entry is about.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ErrorKey {
    /// A database.
    Database {
        /// Database name.
        database: String,
    },
    /// A collection (cycle or malformed definition).
    Collection {
        /// Database name.
        database: String,
        /// Collection id.
        collection: String,
    },
    /// A shard.
    Shard {
        /// Database name.
        database: String,
        /// Shard name.
        shard: ShardId,
    },
    /// An index on a shard.
    Index {
        /// Database name.
        database: String,
        /// Shard name.
        shard: ShardId,
        /// Index id.
        index_id: String,
    },
}

impl ErrorKey {
    /// Returns the database the entry belongs to.
    #[must_use]
    pub fn database(&self) -> &str {
        match self {
            Self::Database { database }
            | Self::Collection { database, .. }
            | Self::Shard { database, .. }
            | Self::Index { database, .. } => database,
        }
    }
}

/// One remembered failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    /// Error description.
    pub message: String,
    /// Numeric error code.
    pub error_num: u64,
    /// Fatal failures exclude the resource for the cooldown window.
    pub fatal: bool,
    /// Fingerprint of the Plan fragment the failed work was derived from.
    pub plan_fingerprint: Option<String>,
    /// When the failure was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl ErrorEntry {
    /// Returns `true` while the entry should keep its resource out of the diff.
    #[must_use]
    pub fn blocks(&self, plan_fingerprint: &str, now: DateTime<Utc>, cooldown: Duration) -> bool {
        if !self.fatal || self.plan_fingerprint.as_deref() != Some(plan_fingerprint) {
            return false;
        }
        let age = now.signed_duration_since(self.recorded_at);
        match age.to_std() {
            Ok(age) => age < cooldown,
            // Recorded "in the future": clock skew, keep blocking.
            Err(_) => true,
        }
    }
}

/// Read-only copy of the ledger handed to the diff and the reporter.
pub type PriorErrors = BTreeMap<ErrorKey, ErrorEntry>;

/// Thread-safe store of prior errors.
#[derive(Debug, Default)]
pub struct ErrorLedger {
    entries: RwLock<PriorErrors>,
}

fn poison_err<T>(_: T) -> Error {
    Error::storage("lock poisoned")
}

impl ErrorLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records (or replaces) the entry for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn record(&self, key: ErrorKey, entry: ErrorEntry) -> Result<()> {
        tracing::debug!(?key, fatal = entry.fatal, message = %entry.message, "recording error");
        self.entries.write().map_err(poison_err)?.insert(key, entry);
        Ok(())
    }

    /// Removes the entry for `key`. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn clear(&self, key: &ErrorKey) -> Result<bool> {
        Ok(self.entries.write().map_err(poison_err)?.remove(key).is_some())
    }

    /// Removes every entry of `database`.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn clear_database(&self, database: &str) -> Result<()> {
        self.entries
            .write()
            .map_err(poison_err)?
            .retain(|key, _| key.database() != database);
        Ok(())
    }

    /// Returns a copy of all entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn snapshot(&self) -> Result<PriorErrors> {
        Ok(self.entries.read().map_err(poison_err)?.clone())
    }

    /// Returns the entry for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn get(&self, key: &ErrorKey) -> Result<Option<ErrorEntry>> {
        Ok(self.entries.read().map_err(poison_err)?.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fatal: bool, fingerprint: &str, age_secs: i64) -> ErrorEntry {
        ErrorEntry {
            message: "boom".into(),
            error_num: 1,
            fatal,
            plan_fingerprint: Some(fingerprint.into()),
            recorded_at: Utc::now() - chrono::Duration::seconds(age_secs),
        }
    }

    #[test]
    fn fatal_entry_blocks_within_cooldown_for_same_plan() {
        let cooldown = Duration::from_secs(60);
        let now = Utc::now();
        assert!(entry(true, "fp", 10).blocks("fp", now, cooldown));
        assert!(!entry(true, "fp", 120).blocks("fp", now, cooldown));
        assert!(!entry(true, "fp", 10).blocks("other", now, cooldown));
        assert!(!entry(false, "fp", 10).blocks("fp", now, cooldown));
    }

    #[test]
    fn ledger_records_and_clears() {
        let ledger = ErrorLedger::new();
        let shard = ErrorKey::Shard {
            database: "db".into(),
            shard: ShardId::new("s1").unwrap(),
        };
        let cycle = ErrorKey::Collection {
            database: "db".into(),
            collection: "c1".into(),
        };
        ledger.record(shard.clone(), entry(true, "fp", 0)).unwrap();
        ledger.record(cycle.clone(), entry(true, "fp", 0)).unwrap();
        assert_eq!(ledger.snapshot().unwrap().len(), 2);

        assert!(ledger.clear(&cycle).unwrap());
        assert!(ledger.get(&cycle).unwrap().is_none());
        assert!(ledger.clear(&shard).unwrap());
        assert!(!ledger.clear(&shard).unwrap());
    }

    #[test]
    fn clear_database_only_touches_that_database() {
        let ledger = ErrorLedger::new();
        for db in ["a", "b"] {
            ledger
                .record(
                    ErrorKey::Database {
                        database: db.into(),
                    },
                    entry(false, "fp", 0),
                )
                .unwrap();
        }
        ledger.clear_database("a").unwrap();
        let remaining: Vec<_> = ledger
            .snapshot()
            .unwrap()
            .keys()
            .map(|k| k.database().to_string())
            .collect();
        assert_eq!(remaining, vec!["b"]);
    }
}
