//! Typed view of the Current tree entries this server reads and writes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use shardwarden_core::{LogId, ShardId};

/// Reported state of one shard, written by its leader.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShardCurrent {
    /// Leader followed by in-sync followers.
    pub servers: Vec<String>,
    /// Servers that may take over leadership.
    pub failover_candidates: Vec<String>,
    /// Index definitions present on the leader, plus index errors.
    pub indexes: Vec<Value>,
    /// Whether the shard is in an error state.
    pub error: bool,
    /// Error description.
    pub error_message: String,
    /// Numeric error code.
    pub error_num: u64,
}

impl ShardCurrent {
    /// Returns the reported leader, if any.
    #[must_use]
    pub fn leader(&self) -> Option<&str> {
        self.servers.first().map(String::as_str)
    }

    /// Returns `true` if `server` is listed as in sync.
    #[must_use]
    pub fn is_in_sync(&self, server: &str) -> bool {
        self.servers.iter().any(|s| s == server)
    }
}

/// Per-server entry below `Current/<db>/servers`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseServerCurrent {
    /// Whether the database is in an error state on the server.
    pub error: bool,
    /// Error description.
    pub error_message: String,
    /// Numeric error code.
    pub error_num: u64,
}

/// Reported state of one participant of a replicated state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StateParticipantCurrent {
    /// Generation the participant has reached.
    pub generation: u64,
    /// Snapshot status label.
    pub snapshot_status: String,
}

/// Reported state of one replicated state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplicatedStateCurrent {
    /// Server → participant status.
    pub participants: BTreeMap<String, StateParticipantCurrent>,
}

/// Reported contents of one database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseCurrent {
    /// Collection id → shard → state.
    pub collections: BTreeMap<String, BTreeMap<ShardId, ShardCurrent>>,
    /// Server → database status.
    pub servers: BTreeMap<String, DatabaseServerCurrent>,
    /// Replicated states, keyed by log id.
    pub replicated_states: BTreeMap<LogId, ReplicatedStateCurrent>,
}

impl DatabaseCurrent {
    /// Parses one database fragment, treating unreadable data as empty.
    ///
    /// Current is advisory input: an unreadable entry is rewritten by the
    /// next report rather than blocking the round.
    #[must_use]
    pub fn from_value_lossy(value: Option<&Value>) -> Self {
        value
            .and_then(|v| Self::deserialize(v).ok())
            .unwrap_or_default()
    }

    /// Returns the reported state of `shard` in `collection`.
    #[must_use]
    pub fn shard(&self, collection: &str, shard: &ShardId) -> Option<&ShardCurrent> {
        self.collections.get(collection).and_then(|c| c.get(shard))
    }
}
