//! Typed view of the Plan tree.
//!
//! The Plan is parsed one database at a time so a malformed fragment only
//! affects its own database.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use shardwarden_core::{LogId, ServerId, ShardId};

use crate::replication::{LogPlanSpecification, StatePlanSpecification};

/// Index types every shard has implicitly; never diffed.
pub const IMPLICIT_INDEX_TYPES: [&str; 2] = ["primary", "edge"];

/// Definition of a secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDefinition {
    /// Index identifier, unique within the collection.
    pub id: String,
    /// Index type (`persistent`, `geo`, ...).
    #[serde(rename = "type")]
    pub index_type: String,
    /// Indexed attribute paths.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Whether values must be unique.
    #[serde(default)]
    pub unique: bool,
    /// Whether documents without the attributes are left out.
    #[serde(default)]
    pub sparse: bool,
}

impl IndexDefinition {
    /// Returns `true` for index types every shard carries implicitly.
    #[must_use]
    pub fn is_implicit(&self) -> bool {
        IMPLICIT_INDEX_TYPES.contains(&self.index_type.as_str())
    }
}

/// Planned definition of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionPlan {
    /// Human-readable collection name.
    #[serde(default)]
    pub name: String,
    /// Number of copies of each shard.
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u64,
    /// Collection whose shard distribution this one follows.
    #[serde(default)]
    pub distribute_shards_like: Option<String>,
    /// Secondary indexes.
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
    /// Shard → servers; the first server leads.
    #[serde(default)]
    pub shards: BTreeMap<ShardId, Vec<String>>,
}

fn default_replication_factor() -> u64 {
    1
}

/// How a planned shard involves a particular server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedRole {
    /// The server is the planned leader.
    Leader,
    /// The server is listed first but marked as resigned.
    ResignedLeader,
    /// The server is a planned follower.
    Follower,
    /// The server is not involved.
    NotAssigned,
}

impl PlannedRole {
    /// Returns `true` if the shard belongs on the server.
    #[must_use]
    pub const fn is_assigned(self) -> bool {
        !matches!(self, Self::NotAssigned)
    }
}

impl CollectionPlan {
    /// Returns the role `server` has for `shard`.
    #[must_use]
    pub fn role_of(&self, shard: &ShardId, server: &ServerId) -> PlannedRole {
        let Some(servers) = self.shards.get(shard) else {
            return PlannedRole::NotAssigned;
        };
        match servers.split_first() {
            Some((leader, _)) if server.is(leader) => PlannedRole::Leader,
            Some((leader, _)) if server.is_resigned(leader) => PlannedRole::ResignedLeader,
            Some((_, followers)) if followers.iter().any(|f| server.is(f)) => {
                PlannedRole::Follower
            }
            _ => PlannedRole::NotAssigned,
        }
    }

    /// Returns the planned leader of `shard`, if it is active.
    #[must_use]
    pub fn leader_of(&self, shard: &ShardId) -> Option<&str> {
        self.shards
            .get(shard)
            .and_then(|servers| servers.first())
            .map(String::as_str)
            .filter(|leader| !leader.starts_with(shardwarden_core::id::RESIGNED_LEADER_PREFIX))
    }

    /// Returns the non-implicit indexes.
    pub fn secondary_indexes(&self) -> impl Iterator<Item = &IndexDefinition> {
        self.indexes.iter().filter(|index| !index.is_implicit())
    }
}

/// Planned contents of one database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabasePlan {
    /// Collection id → definition.
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionPlan>,
    /// Replicated logs, keyed by log id.
    #[serde(default)]
    pub replicated_logs: BTreeMap<LogId, LogPlanSpecification>,
    /// Replicated states, keyed by log id.
    #[serde(default)]
    pub replicated_states: BTreeMap<LogId, StatePlanSpecification>,
}

impl DatabasePlan {
    /// Parses one database fragment.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the fragment does not match
    /// the expected shape.
    pub fn from_value(value: &Value) -> std::result::Result<Self, String> {
        if !value.is_object() {
            return Err("database entry is not an object".to_string());
        }
        Self::deserialize(value).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn me() -> ServerId {
        ServerId::new("A").unwrap()
    }

    #[test]
    fn parses_collections_with_defaults() {
        let plan = DatabasePlan::from_value(&json!({
            "collections": {
                "c1": { "name": "users", "shards": { "s1": ["A", "B"] } }
            }
        }))
        .unwrap();
        let c1 = &plan.collections["c1"];
        assert_eq!(c1.replication_factor, 1);
        assert!(c1.indexes.is_empty());
        assert!(plan.replicated_logs.is_empty());
    }

    #[test]
    fn malformed_fragment_reports_message() {
        assert!(DatabasePlan::from_value(&json!([1, 2])).is_err());
        assert!(
            DatabasePlan::from_value(&json!({"collections": {"c1": {"shards": 3}}})).is_err()
        );
    }

    #[test]
    fn roles_are_derived_from_server_lists() {
        let plan = DatabasePlan::from_value(&json!({
            "collections": { "c1": { "shards": {
                "s1": ["A", "B"], "s2": ["B", "A"], "s3": ["_A", "B"], "s4": ["B", "C"]
            } } }
        }))
        .unwrap();
        let c1 = &plan.collections["c1"];
        let s = |n: &str| ShardId::new(n).unwrap();
        assert_eq!(c1.role_of(&s("s1"), &me()), PlannedRole::Leader);
        assert_eq!(c1.role_of(&s("s2"), &me()), PlannedRole::Follower);
        assert_eq!(c1.role_of(&s("s3"), &me()), PlannedRole::ResignedLeader);
        assert_eq!(c1.role_of(&s("s4"), &me()), PlannedRole::NotAssigned);
        assert_eq!(c1.role_of(&s("missing"), &me()), PlannedRole::NotAssigned);
        assert_eq!(c1.leader_of(&s("s3")), None);
        assert_eq!(c1.leader_of(&s("s2")), Some("B"));
    }

    #[test]
    fn implicit_indexes_are_skipped() {
        let plan = DatabasePlan::from_value(&json!({
            "collections": { "c1": { "indexes": [
                { "id": "0", "type": "primary", "fields": ["_key"] },
                { "id": "7", "type": "persistent", "fields": ["email"], "unique": true }
            ] } }
        }))
        .unwrap();
        let ids: Vec<_> = plan.collections["c1"]
            .secondary_indexes()
            .map(|i| i.id.as_str())
            .collect();
        assert_eq!(ids, vec!["7"]);
    }
}
