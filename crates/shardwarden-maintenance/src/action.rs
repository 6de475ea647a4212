//! Maintenance actions: what kind of work, on which resource, how urgent.
//!
//! An [`ActionDescription`] is immutable once created. Two descriptions are
//! the same unit of work when their [`ActionIdentity`] (kind plus resource)
//! matches; the registry uses the [`ResourceKey`] alone to keep at most one
//! action active per resource.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shardwarden_core::{ActionId, LogId, ShardId};

/// Well-known parameter keys.
pub mod params {
    /// Leader a follower shard should follow (empty when this server leads).
    pub const LEADER: &str = "leader";
    /// Identifier of the index an index action targets.
    pub const INDEX_ID: &str = "indexId";
    /// Shard of the `distributeShardsLike` prototype a new shard is placed with.
    pub const PROTOTYPE_SHARD: &str = "prototypeShard";
    /// Fingerprint of the Plan fragment the action was derived from.
    pub const PLAN_FINGERPRINT: &str = "planFingerprint";
    /// Replicated log/state operation: `create`, `update` or `drop`.
    pub const OPERATION: &str = "operation";
}

/// Scheduling priority. Higher runs first within a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    /// Ordinary fast-track work.
    pub const NORMAL: Self = Self(1);
    /// Follower-side fast-track work.
    pub const FOLLOWER: Self = Self(1);
    /// Work on shards this server leads.
    pub const LEADER: Self = Self(2);
    /// Urgent fast-track work (database creation).
    pub const HIGHER: Self = Self(2);
    /// Giving up leadership; always first.
    pub const RESIGN: Self = Self(3);
    /// Index builds (slow track).
    pub const INDEX: Self = Self(2);
    /// Follower synchronization (slow track).
    pub const SYNCHRONIZE: Self = Self(1);
    /// Long-running work that yielded once (slow track).
    pub const SLOW_OP: Self = Self(0);

    /// Returns the numeric value.
    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The queue an action is scheduled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Track {
    /// Cheap, latency-sensitive work.
    Fast,
    /// Index builds, synchronization and yielded work.
    Slow,
}

impl Track {
    /// Returns the label used in logs and metrics.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Slow => "slow",
        }
    }
}

/// Every kind of work the maintenance loop can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    /// Create a local database.
    CreateDatabase,
    /// Drop a local database with everything in it.
    DropDatabase,
    /// Create a local shard of a collection.
    CreateShard,
    /// Drop a local shard.
    DropShard,
    /// Build a missing index on a local shard.
    EnsureIndex,
    /// Remove an index the Plan no longer lists.
    DropIndex,
    /// Catch a follower shard up with its leader.
    SynchronizeShard,
    /// Become leader of a local shard.
    TakeoverShardLeadership,
    /// Stop leading a local shard.
    ResignShardLeadership,
    /// Create, reconfigure or drop a local replicated log.
    UpdateReplicatedLog,
    /// Create, reconfigure or drop a local replicated state.
    UpdateReplicatedState,
}

impl ActionKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 11] = [
        Self::CreateDatabase,
        Self::DropDatabase,
        Self::CreateShard,
        Self::DropShard,
        Self::EnsureIndex,
        Self::DropIndex,
        Self::SynchronizeShard,
        Self::TakeoverShardLeadership,
        Self::ResignShardLeadership,
        Self::UpdateReplicatedLog,
        Self::UpdateReplicatedState,
    ];

    /// Returns the track this kind is scheduled on when first submitted.
    #[must_use]
    pub const fn track(self) -> Track {
        match self {
            Self::EnsureIndex | Self::SynchronizeShard => Track::Slow,
            _ => Track::Fast,
        }
    }

    /// Returns the label used in logs and metrics.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::CreateDatabase => "CreateDatabase",
            Self::DropDatabase => "DropDatabase",
            Self::CreateShard => "CreateShard",
            Self::DropShard => "DropShard",
            Self::EnsureIndex => "EnsureIndex",
            Self::DropIndex => "DropIndex",
            Self::SynchronizeShard => "SynchronizeShard",
            Self::TakeoverShardLeadership => "TakeoverShardLeadership",
            Self::ResignShardLeadership => "ResignShardLeadership",
            Self::UpdateReplicatedLog => "UpdateReplicatedLog",
            Self::UpdateReplicatedState => "UpdateReplicatedState",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// The resource an action operates on. At most one action per key is active.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ResourceKey {
    /// A whole database.
    Database {
        /// Database name.
        database: String,
    },
    /// A shard within a database.
    Shard {
        /// Database name.
        database: String,
        /// Shard name.
        shard: ShardId,
    },
    /// A replicated log (and its state) within a database.
    Log {
        /// Database name.
        database: String,
        /// Log identifier.
        log: LogId,
    },
}

impl ResourceKey {
    /// Key of a database.
    #[must_use]
    pub fn database(database: impl Into<String>) -> Self {
        Self::Database {
            database: database.into(),
        }
    }

    /// Key of a shard.
    #[must_use]
    pub fn shard(database: impl Into<String>, shard: ShardId) -> Self {
        Self::Shard {
            database: database.into(),
            shard,
        }
    }

    /// Key of a replicated log.
    #[must_use]
    pub fn log(database: impl Into<String>, log: LogId) -> Self {
        Self::Log {
            database: database.into(),
            log,
        }
    }

    /// Returns the database the resource lives in.
    #[must_use]
    pub fn database_name(&self) -> &str {
        match self {
            Self::Database { database }
            | Self::Shard { database, .. }
            | Self::Log { database, .. } => database,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database { database } => write!(f, "{database}"),
            Self::Shard { database, shard } => write!(f, "{database}/{shard}"),
            Self::Log { database, log } => write!(f, "{database}/log-{log}"),
        }
    }
}

/// Identity used to decide whether two descriptions describe the same work.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActionIdentity {
    /// The kind of work.
    pub kind: ActionKind,
    /// The resource it targets.
    pub resource: ResourceKey,
}

/// An immutable unit of reconciliation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDescription {
    id: ActionId,
    kind: ActionKind,
    resource: ResourceKey,
    collection: Option<String>,
    parameters: BTreeMap<String, String>,
    properties: Option<Value>,
    priority: Priority,
    track: Track,
    created_at: DateTime<Utc>,
}

impl ActionDescription {
    fn new(kind: ActionKind, resource: ResourceKey, collection: Option<String>) -> Self {
        let priority = match kind.track() {
            Track::Fast => Priority::NORMAL,
            Track::Slow if kind == ActionKind::EnsureIndex => Priority::INDEX,
            Track::Slow => Priority::SYNCHRONIZE,
        };
        Self {
            id: ActionId::generate(),
            kind,
            resource,
            collection,
            parameters: BTreeMap::new(),
            properties: None,
            priority,
            track: kind.track(),
            created_at: Utc::now(),
        }
    }

    /// Describes work on a whole database.
    #[must_use]
    pub fn for_database(kind: ActionKind, database: impl Into<String>) -> Self {
        Self::new(kind, ResourceKey::database(database), None)
    }

    /// Describes work on one shard of a collection.
    #[must_use]
    pub fn for_shard(
        kind: ActionKind,
        database: impl Into<String>,
        collection: impl Into<String>,
        shard: ShardId,
    ) -> Self {
        Self::new(
            kind,
            ResourceKey::shard(database, shard),
            Some(collection.into()),
        )
    }

    /// Describes work on a replicated log or state.
    #[must_use]
    pub fn for_log(kind: ActionKind, database: impl Into<String>, log: LogId) -> Self {
        Self::new(kind, ResourceKey::log(database, log), None)
    }

    /// Returns a copy with the given priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Returns a copy with an additional parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: &str, value: impl Into<String>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// Returns a copy carrying a structured payload (index or log definition).
    #[must_use]
    pub fn with_properties(mut self, properties: Value) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Returns the resubmission of a yielded action: same work, slow track, `SLOW_OP`.
    #[must_use]
    pub fn requeued_as_slow(&self) -> Self {
        Self {
            priority: Priority::SLOW_OP,
            track: Track::Slow,
            ..self.clone()
        }
    }

    /// Returns the action ID.
    #[must_use]
    pub const fn id(&self) -> ActionId {
        self.id
    }

    /// Returns the kind of work.
    #[must_use]
    pub const fn kind(&self) -> ActionKind {
        self.kind
    }

    /// Returns the resource the action targets.
    #[must_use]
    pub fn resource(&self) -> &ResourceKey {
        &self.resource
    }

    /// Returns the database the action operates in.
    #[must_use]
    pub fn database(&self) -> &str {
        self.resource.database_name()
    }

    /// Returns the collection, for shard actions.
    #[must_use]
    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    /// Returns the shard, for shard actions.
    #[must_use]
    pub fn shard(&self) -> Option<&ShardId> {
        match &self.resource {
            ResourceKey::Shard { shard, .. } => Some(shard),
            _ => None,
        }
    }

    /// Returns the log ID, for replicated log and state actions.
    #[must_use]
    pub fn log_id(&self) -> Option<LogId> {
        match &self.resource {
            ResourceKey::Log { log, .. } => Some(*log),
            _ => None,
        }
    }

    /// Returns a parameter value.
    #[must_use]
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// Returns all parameters.
    #[must_use]
    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// Returns the structured payload, if any.
    #[must_use]
    pub fn properties(&self) -> Option<&Value> {
        self.properties.as_ref()
    }

    /// Returns the scheduling priority.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// Returns the scheduling track.
    #[must_use]
    pub const fn track(&self) -> Track {
        self.track
    }

    /// Returns when the description was created.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the dedup identity: kind plus resource.
    #[must_use]
    pub fn identity(&self) -> ActionIdentity {
        ActionIdentity {
            kind: self.kind,
            resource: self.resource.clone(),
        }
    }
}

impl fmt::Display for ActionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}) prio={} track={}",
            self.kind,
            self.resource,
            self.priority,
            self.track.as_label()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(name: &str) -> ShardId {
        ShardId::new(name).unwrap()
    }

    #[test]
    fn slow_kinds_get_slow_track_defaults() {
        let index = ActionDescription::for_shard(ActionKind::EnsureIndex, "db", "c", shard("s1"));
        assert_eq!(index.track(), Track::Slow);
        assert_eq!(index.priority(), Priority::INDEX);

        let sync =
            ActionDescription::for_shard(ActionKind::SynchronizeShard, "db", "c", shard("s1"));
        assert_eq!(sync.track(), Track::Slow);
        assert_eq!(sync.priority(), Priority::SYNCHRONIZE);

        let create = ActionDescription::for_shard(ActionKind::CreateShard, "db", "c", shard("s1"));
        assert_eq!(create.track(), Track::Fast);
        assert_eq!(create.priority(), Priority::NORMAL);
    }

    #[test]
    fn identity_ignores_parameters_and_priority() {
        let a = ActionDescription::for_shard(ActionKind::CreateShard, "db", "c", shard("s1"))
            .with_parameter(params::LEADER, "")
            .with_priority(Priority::LEADER);
        let b = ActionDescription::for_shard(ActionKind::CreateShard, "db", "c", shard("s1"));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.identity(), b.identity());

        let other = ActionDescription::for_shard(ActionKind::DropShard, "db", "c", shard("s1"));
        assert_ne!(a.identity(), other.identity());
        assert_eq!(a.resource(), other.resource());
    }

    #[test]
    fn requeue_as_slow_keeps_identity() {
        let action = ActionDescription::for_shard(ActionKind::EnsureIndex, "db", "c", shard("s1"));
        let requeued = action.requeued_as_slow();
        assert_eq!(requeued.id(), action.id());
        assert_eq!(requeued.identity(), action.identity());
        assert_eq!(requeued.priority(), Priority::SLOW_OP);
        assert_eq!(requeued.track(), Track::Slow);
    }

    #[test]
    fn resign_outranks_everything() {
        assert!(Priority::RESIGN > Priority::LEADER);
        assert!(Priority::LEADER > Priority::NORMAL);
        assert!(Priority::SYNCHRONIZE > Priority::SLOW_OP);
        assert_eq!(Priority::FOLLOWER, Priority::NORMAL);
    }

    #[test]
    fn accessors_expose_resource_parts() {
        let log = ActionDescription::for_log(ActionKind::UpdateReplicatedLog, "db", LogId::new(7));
        assert_eq!(log.log_id(), Some(LogId::new(7)));
        assert_eq!(log.shard(), None);
        assert_eq!(log.database(), "db");
        assert_eq!(log.to_string(), "UpdateReplicatedLog(db/log-7) prio=1 track=fast");
    }
}
