//! Storage engine seam: the local catalog and the operations actions perform.
//!
//! Engine calls report [`EngineError::Retryable`] for conditions expected to
//! clear on their own (missing prototype shard, leader unreachable) and
//! [`EngineError::Fatal`] for failures that need a Plan change.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use shardwarden_core::{ServerId, ShardId};

use crate::error::{Error, Result};
use crate::local::{LocalDatabase, LocalShard, LocalSnapshot, ShardRole};
use crate::plan::IndexDefinition;

/// Failure reported by the storage engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Expected to succeed when tried again.
    #[error("retryable: {message}")]
    Retryable {
        /// Description of the failure.
        message: String,
    },
    /// Will not succeed without a Plan change.
    #[error("fatal ({code}): {message}")]
    Fatal {
        /// Numeric error code, reported to Current.
        code: u64,
        /// Description of the failure.
        message: String,
    },
}

impl EngineError {
    /// Creates a retryable error.
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
        }
    }

    /// Creates a fatal error.
    #[must_use]
    pub fn fatal(code: u64, message: impl Into<String>) -> Self {
        Self::Fatal {
            code,
            message: message.into(),
        }
    }
}

/// Result of an engine call.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Progress of a long operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineProgress {
    /// The operation completed.
    Done,
    /// The budget ran out; call again to continue.
    Yielded,
}

/// Time a long operation may spend before it should yield.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationBudget {
    deadline: Option<Instant>,
}

impl OperationBudget {
    /// A budget that never runs out (work already on `SLOW_OP`).
    #[must_use]
    pub const fn unlimited() -> Self {
        Self { deadline: None }
    }

    /// A budget that runs out `limit` from now.
    #[must_use]
    pub fn with_limit(limit: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + limit),
        }
    }

    /// Returns `true` if no deadline applies.
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.deadline.is_none()
    }

    /// Returns `true` once the deadline has passed.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Parameters of a shard creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSpec {
    /// Database name.
    pub database: String,
    /// Collection id.
    pub collection: String,
    /// Shard name.
    pub shard: ShardId,
    /// Leader to follow; `None` when this server leads.
    pub leader: Option<ServerId>,
    /// Prototype shard that must exist locally first.
    pub prototype: Option<ShardId>,
}

/// The local storage engine.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Returns the live catalog.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be read.
    async fn local_snapshot(&self) -> Result<LocalSnapshot>;

    /// Creates a database; existing databases are left alone.
    async fn create_database(&self, database: &str) -> EngineResult<()>;

    /// Drops a database and every shard in it.
    async fn drop_database(&self, database: &str) -> EngineResult<()>;

    /// Creates a shard.
    async fn create_shard(&self, spec: &ShardSpec) -> EngineResult<()>;

    /// Drops a shard; a missing shard is not an error.
    async fn drop_shard(&self, database: &str, shard: &ShardId) -> EngineResult<()>;

    /// Builds an index, yielding when `budget` runs out.
    async fn create_index(
        &self,
        database: &str,
        shard: &ShardId,
        index: &IndexDefinition,
        budget: &OperationBudget,
    ) -> EngineResult<EngineProgress>;

    /// Drops an index; a missing index is not an error.
    async fn drop_index(&self, database: &str, shard: &ShardId, index_id: &str)
    -> EngineResult<()>;

    /// Catches a follower shard up with `leader`, yielding when `budget` runs out.
    async fn synchronize_shard_from_leader(
        &self,
        database: &str,
        shard: &ShardId,
        leader: &ServerId,
        budget: &OperationBudget,
    ) -> EngineResult<EngineProgress>;

    /// Makes this server the leader of a local shard.
    async fn assume_leadership(&self, database: &str, shard: &ShardId) -> EngineResult<()>;

    /// Gives up leadership of a local shard.
    async fn resign_leadership(&self, database: &str, shard: &ShardId) -> EngineResult<()>;
}

/// Engine operations, for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOperation {
    /// [`StorageEngine::create_database`].
    CreateDatabase,
    /// [`StorageEngine::drop_database`].
    DropDatabase,
    /// [`StorageEngine::create_shard`].
    CreateShard,
    /// [`StorageEngine::drop_shard`].
    DropShard,
    /// [`StorageEngine::create_index`].
    CreateIndex,
    /// [`StorageEngine::drop_index`].
    DropIndex,
    /// [`StorageEngine::synchronize_shard_from_leader`].
    Synchronize,
    /// [`StorageEngine::assume_leadership`].
    AssumeLeadership,
    /// [`StorageEngine::resign_leadership`].
    ResignLeadership,
}

#[derive(Debug, Default)]
struct EngineState {
    snapshot: LocalSnapshot,
    failures: HashMap<EngineOperation, VecDeque<EngineError>>,
    yield_once: HashSet<ShardId>,
    calls: Vec<String>,
}

/// In-memory storage engine for tests and embedders.
///
/// Operations apply instantly. Failures can be injected per operation and
/// long operations on selected shards yield once when given a limited
/// budget.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorageEngine {
    state: Arc<RwLock<EngineState>>,
}

fn poison_err<T>(_: T) -> Error {
    Error::storage("lock poisoned")
}

fn poisoned<T>(_: T) -> EngineError {
    EngineError::retryable("lock poisoned")
}

impl InMemoryStorageEngine {
    /// Creates an engine with an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an engine starting from `snapshot`.
    #[must_use]
    pub fn with_snapshot(snapshot: LocalSnapshot) -> Self {
        Self {
            state: Arc::new(RwLock::new(EngineState {
                snapshot,
                ..EngineState::default()
            })),
        }
    }

    /// Makes the next call of `operation` fail with `error`.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn inject_failure(&self, operation: EngineOperation, error: EngineError) -> Result<()> {
        self.state
            .write()
            .map_err(poison_err)?
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
        Ok(())
    }

    /// Makes the next budget-limited long operation on `shard` yield.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn yield_once(&self, shard: ShardId) -> Result<()> {
        self.state.write().map_err(poison_err)?.yield_once.insert(shard);
        Ok(())
    }

    /// Sets the in-sync followers of a shard this server leads.
    ///
    /// # Errors
    ///
    /// Returns an error if the shard does not exist or the lock is poisoned.
    pub fn set_in_sync_followers(
        &self,
        database: &str,
        shard: &ShardId,
        followers: Vec<ServerId>,
    ) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let local = state
            .snapshot
            .databases
            .get_mut(database)
            .and_then(|db| db.shards.get_mut(shard))
            .ok_or_else(|| Error::storage(format!("shard {database}/{shard} not found")))?;
        local.failover_candidates.clone_from(&followers);
        local.in_sync_followers = followers;
        Ok(())
    }

    /// Returns the calls made so far, as `operation database/resource`.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn calls(&self) -> Result<Vec<String>> {
        Ok(self.state.read().map_err(poison_err)?.calls.clone())
    }

    fn begin(&self, operation: EngineOperation, call: String) -> EngineResult<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        state.calls.push(call);
        if let Some(error) = state
            .failures
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        Ok(())
    }

    fn with_shard<T>(
        &self,
        database: &str,
        shard: &ShardId,
        f: impl FnOnce(&mut LocalShard) -> T,
    ) -> EngineResult<T> {
        let mut state = self.state.write().map_err(poisoned)?;
        let local = state
            .snapshot
            .databases
            .get_mut(database)
            .and_then(|db| db.shards.get_mut(shard))
            .ok_or_else(|| EngineError::retryable(format!("shard {database}/{shard} not found")))?;
        Ok(f(local))
    }

    fn should_yield(&self, shard: &ShardId, budget: &OperationBudget) -> EngineResult<bool> {
        if budget.is_unlimited() {
            return Ok(false);
        }
        let mut state = self.state.write().map_err(poisoned)?;
        Ok(state.yield_once.remove(shard) || budget.is_exhausted())
    }
}

#[async_trait]
impl StorageEngine for InMemoryStorageEngine {
    async fn local_snapshot(&self) -> Result<LocalSnapshot> {
        Ok(self.state.read().map_err(poison_err)?.snapshot.clone())
    }

    async fn create_database(&self, database: &str) -> EngineResult<()> {
        self.begin(
            EngineOperation::CreateDatabase,
            format!("create_database {database}"),
        )?;
        let mut state = self.state.write().map_err(poisoned)?;
        state
            .snapshot
            .databases
            .entry(database.to_string())
            .or_insert_with(LocalDatabase::default);
        Ok(())
    }

    async fn drop_database(&self, database: &str) -> EngineResult<()> {
        self.begin(
            EngineOperation::DropDatabase,
            format!("drop_database {database}"),
        )?;
        self.state
            .write()
            .map_err(poisoned)?
            .snapshot
            .databases
            .remove(database);
        Ok(())
    }

    async fn create_shard(&self, spec: &ShardSpec) -> EngineResult<()> {
        self.begin(
            EngineOperation::CreateShard,
            format!("create_shard {}/{}", spec.database, spec.shard),
        )?;
        let mut state = self.state.write().map_err(poisoned)?;
        let db = state
            .snapshot
            .databases
            .get_mut(&spec.database)
            .ok_or_else(|| EngineError::retryable(format!("database {} not found", spec.database)))?;
        if let Some(prototype) = spec.prototype.as_ref().filter(|p| !db.shards.contains_key(*p)) {
            return Err(EngineError::retryable(format!(
                "prototype shard {}/{prototype} not present yet",
                spec.database
            )));
        }
        let role = match &spec.leader {
            None => ShardRole::Leader,
            Some(leader) => ShardRole::Follower {
                leader: Some(leader.clone()),
            },
        };
        db.shards
            .entry(spec.shard.clone())
            .or_insert_with(|| LocalShard::new(spec.collection.clone(), role));
        Ok(())
    }

    async fn drop_shard(&self, database: &str, shard: &ShardId) -> EngineResult<()> {
        self.begin(
            EngineOperation::DropShard,
            format!("drop_shard {database}/{shard}"),
        )?;
        let mut state = self.state.write().map_err(poisoned)?;
        if let Some(db) = state.snapshot.databases.get_mut(database) {
            db.shards.remove(shard);
        }
        Ok(())
    }

    async fn create_index(
        &self,
        database: &str,
        shard: &ShardId,
        index: &IndexDefinition,
        budget: &OperationBudget,
    ) -> EngineResult<EngineProgress> {
        self.begin(
            EngineOperation::CreateIndex,
            format!("create_index {database}/{shard}/{}", index.id),
        )?;
        if self.should_yield(shard, budget)? {
            return Ok(EngineProgress::Yielded);
        }
        self.with_shard(database, shard, |local| {
            if !local.has_index(&index.id) {
                local.indexes.push(index.clone());
            }
        })?;
        Ok(EngineProgress::Done)
    }

    async fn drop_index(
        &self,
        database: &str,
        shard: &ShardId,
        index_id: &str,
    ) -> EngineResult<()> {
        self.begin(
            EngineOperation::DropIndex,
            format!("drop_index {database}/{shard}/{index_id}"),
        )?;
        self.with_shard(database, shard, |local| {
            local.indexes.retain(|index| index.id != index_id);
        })
    }

    async fn synchronize_shard_from_leader(
        &self,
        database: &str,
        shard: &ShardId,
        leader: &ServerId,
        budget: &OperationBudget,
    ) -> EngineResult<EngineProgress> {
        self.begin(
            EngineOperation::Synchronize,
            format!("synchronize {database}/{shard}"),
        )?;
        if self.should_yield(shard, budget)? {
            return Ok(EngineProgress::Yielded);
        }
        self.with_shard(database, shard, |local| {
            local.role = ShardRole::Follower {
                leader: Some(leader.clone()),
            };
            local.in_sync_followers.clear();
            local.failover_candidates.clear();
        })?;
        Ok(EngineProgress::Done)
    }

    async fn assume_leadership(&self, database: &str, shard: &ShardId) -> EngineResult<()> {
        self.begin(
            EngineOperation::AssumeLeadership,
            format!("assume_leadership {database}/{shard}"),
        )?;
        self.with_shard(database, shard, |local| local.role = ShardRole::Leader)
    }

    async fn resign_leadership(&self, database: &str, shard: &ShardId) -> EngineResult<()> {
        self.begin(
            EngineOperation::ResignLeadership,
            format!("resign_leadership {database}/{shard}"),
        )?;
        self.with_shard(database, shard, |local| {
            local.role = ShardRole::Follower { leader: None };
            local.in_sync_followers.clear();
            local.failover_candidates.clear();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(name: &str) -> ShardId {
        ShardId::new(name).unwrap()
    }

    fn spec(name: &str, leader: Option<&str>) -> ShardSpec {
        ShardSpec {
            database: "db".into(),
            collection: "c1".into(),
            shard: shard(name),
            leader: leader.map(|l| ServerId::new(l).unwrap()),
            prototype: None,
        }
    }

    #[tokio::test]
    async fn shard_needs_database() {
        let engine = InMemoryStorageEngine::new();
        let err = engine.create_shard(&spec("s1", None)).await.unwrap_err();
        assert!(matches!(err, EngineError::Retryable { .. }));

        engine.create_database("db").await.unwrap();
        engine.create_shard(&spec("s1", None)).await.unwrap();
        engine.create_shard(&spec("s2", Some("B"))).await.unwrap();

        let snapshot = engine.local_snapshot().await.unwrap();
        let db = snapshot.database("db").unwrap();
        assert!(db.shards[&shard("s1")].role.is_leader());
        assert_eq!(
            db.shards[&shard("s2")].role.followed_leader().map(ServerId::as_str),
            Some("B")
        );
    }

    #[tokio::test]
    async fn shard_waits_for_its_prototype() {
        let engine = InMemoryStorageEngine::new();
        engine.create_database("db").await.unwrap();
        let dependent = ShardSpec {
            collection: "c2".into(),
            prototype: Some(shard("s1")),
            ..spec("s3", None)
        };

        let err = engine.create_shard(&dependent).await.unwrap_err();
        assert!(matches!(err, EngineError::Retryable { .. }));
        assert!(engine.local_snapshot().await.unwrap().databases["db"].shards.is_empty());

        engine.create_shard(&spec("s1", None)).await.unwrap();
        engine.create_shard(&dependent).await.unwrap();
        let snapshot = engine.local_snapshot().await.unwrap();
        assert_eq!(snapshot.databases["db"].shards[&shard("s3")].collection, "c2");
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let engine = InMemoryStorageEngine::new();
        engine
            .inject_failure(EngineOperation::CreateDatabase, EngineError::fatal(1100, "corrupt"))
            .unwrap();
        assert!(matches!(
            engine.create_database("db").await,
            Err(EngineError::Fatal { code: 1100, .. })
        ));
        engine.create_database("db").await.unwrap();
        assert_eq!(engine.calls().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn limited_budget_yields_once() {
        let engine = InMemoryStorageEngine::new();
        engine.create_database("db").await.unwrap();
        engine.create_shard(&spec("s1", None)).await.unwrap();
        engine.yield_once(shard("s1")).unwrap();

        let index = IndexDefinition {
            id: "9".into(),
            index_type: "persistent".into(),
            fields: vec!["name".into()],
            unique: false,
            sparse: false,
        };
        let budget = OperationBudget::with_limit(Duration::from_secs(60));
        assert_eq!(
            engine.create_index("db", &shard("s1"), &index, &budget).await.unwrap(),
            EngineProgress::Yielded
        );
        assert_eq!(
            engine
                .create_index("db", &shard("s1"), &index, &OperationBudget::unlimited())
                .await
                .unwrap(),
            EngineProgress::Done
        );
        let snapshot = engine.local_snapshot().await.unwrap();
        assert!(snapshot.databases["db"].shards[&shard("s1")].has_index("9"));
    }

    #[tokio::test]
    async fn leadership_changes_role() {
        let engine = InMemoryStorageEngine::new();
        engine.create_database("db").await.unwrap();
        engine.create_shard(&spec("s1", None)).await.unwrap();
        engine
            .set_in_sync_followers("db", &shard("s1"), vec![ServerId::new("B").unwrap()])
            .unwrap();

        engine.resign_leadership("db", &shard("s1")).await.unwrap();
        let snapshot = engine.local_snapshot().await.unwrap();
        let local = &snapshot.databases["db"].shards[&shard("s1")];
        assert_eq!(local.role, ShardRole::Follower { leader: None });
        assert!(local.in_sync_followers.is_empty());

        engine.assume_leadership("db", &shard("s1")).await.unwrap();
        let snapshot = engine.local_snapshot().await.unwrap();
        assert!(snapshot.databases["db"].shards[&shard("s1")].role.is_leader());
    }
}
