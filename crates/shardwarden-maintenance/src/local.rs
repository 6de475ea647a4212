//! The local snapshot: what this server actually hosts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use shardwarden_core::{ServerId, ShardId};

use crate::plan::IndexDefinition;

/// The role a local shard currently plays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "camelCase")]
pub enum ShardRole {
    /// This server leads the shard.
    Leader,
    /// This server follows `leader`; `None` until a leader is known.
    Follower {
        /// The leader being followed.
        leader: Option<ServerId>,
    },
}

impl ShardRole {
    /// Returns `true` if this server leads the shard.
    #[must_use]
    pub const fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }

    /// Returns the followed leader, for followers.
    #[must_use]
    pub fn followed_leader(&self) -> Option<&ServerId> {
        match self {
            Self::Leader => None,
            Self::Follower { leader } => leader.as_ref(),
        }
    }
}

/// A shard hosted on this server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalShard {
    /// Collection id the shard belongs to.
    pub collection: String,
    /// Current role.
    pub role: ShardRole,
    /// Secondary indexes present.
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
    /// Followers known to be in sync (meaningful while leading).
    #[serde(default)]
    pub in_sync_followers: Vec<ServerId>,
    /// Followers eligible for failover (meaningful while leading).
    #[serde(default)]
    pub failover_candidates: Vec<ServerId>,
}

impl LocalShard {
    /// Creates a shard with no indexes or followers.
    #[must_use]
    pub fn new(collection: impl Into<String>, role: ShardRole) -> Self {
        Self {
            collection: collection.into(),
            role,
            indexes: Vec::new(),
            in_sync_followers: Vec::new(),
            failover_candidates: Vec::new(),
        }
    }

    /// Returns `true` if an index with `id` exists.
    #[must_use]
    pub fn has_index(&self, id: &str) -> bool {
        self.indexes.iter().any(|index| index.id == id)
    }
}

/// A database hosted on this server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalDatabase {
    /// Shard → local state.
    #[serde(default)]
    pub shards: BTreeMap<ShardId, LocalShard>,
}

/// Everything the storage engine reports as hosted locally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSnapshot {
    /// Database name → contents.
    #[serde(default)]
    pub databases: BTreeMap<String, LocalDatabase>,
}

impl LocalSnapshot {
    /// Returns a local database.
    #[must_use]
    pub fn database(&self, name: &str) -> Option<&LocalDatabase> {
        self.databases.get(name)
    }

    /// Iterates over all local shards as `(database, shard, state)`.
    pub fn shards(&self) -> impl Iterator<Item = (&str, &ShardId, &LocalShard)> {
        self.databases.iter().flat_map(|(db, local)| {
            local
                .shards
                .iter()
                .map(move |(shard, state)| (db.as_str(), shard, state))
        })
    }
}
