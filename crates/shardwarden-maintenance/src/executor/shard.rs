//! Executors for database, shard, index and leadership actions.

use std::sync::Arc;

use async_trait::async_trait;
use shardwarden_core::{ServerId, ShardId};

use super::{ActionExecutor, ExecutionContext, ExecutionOutcome, outcome_of};
use crate::action::{ActionDescription, ActionKind, params};
use crate::plan::IndexDefinition;
use crate::storage::{ShardSpec, StorageEngine};

fn shard_of(action: &ActionDescription) -> Result<&ShardId, ExecutionOutcome> {
    action
        .shard()
        .ok_or_else(|| ExecutionOutcome::bad_action(format!("{action} has no shard")))
}

fn prototype_param(action: &ActionDescription) -> Result<Option<ShardId>, ExecutionOutcome> {
    action
        .parameter(params::PROTOTYPE_SHARD)
        .map(|shard| ShardId::new(shard).map_err(|e| ExecutionOutcome::bad_action(e.to_string())))
        .transpose()
}

fn leader_param(action: &ActionDescription) -> Result<Option<ServerId>, ExecutionOutcome> {
    match action.parameter(params::LEADER) {
        None | Some("") => Ok(None),
        Some(leader) => ServerId::new(leader)
            .map(Some)
            .map_err(|e| ExecutionOutcome::bad_action(e.to_string())),
    }
}

macro_rules! engine_executor {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone)]
        pub struct $name {
            engine: Arc<dyn StorageEngine>,
        }

        impl $name {
            /// Creates the executor.
            #[must_use]
            pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
                Self { engine }
            }
        }
    };
}

engine_executor!(
    /// Creates a local database.
    CreateDatabaseExecutor
);
engine_executor!(
    /// Drops a local database.
    DropDatabaseExecutor
);
engine_executor!(
    /// Creates a local shard as leader or follower.
    CreateShardExecutor
);
engine_executor!(
    /// Drops a local shard.
    DropShardExecutor
);
engine_executor!(
    /// Builds a planned index; yields on long builds.
    EnsureIndexExecutor
);
engine_executor!(
    /// Drops an index the Plan no longer lists.
    DropIndexExecutor
);
engine_executor!(
    /// Catches a follower up with its planned leader; yields on long transfers.
    SynchronizeShardExecutor
);
engine_executor!(
    /// Makes this server leader of a shard.
    TakeoverShardLeadershipExecutor
);
engine_executor!(
    /// Gives up leadership of a shard.
    ResignShardLeadershipExecutor
);

#[async_trait]
impl ActionExecutor for CreateDatabaseExecutor {
    fn kind(&self) -> ActionKind {
        ActionKind::CreateDatabase
    }

    async fn execute(&self, _ctx: &ExecutionContext, action: &ActionDescription) -> ExecutionOutcome {
        outcome_of(self.engine.create_database(action.database()).await)
    }
}

#[async_trait]
impl ActionExecutor for DropDatabaseExecutor {
    fn kind(&self) -> ActionKind {
        ActionKind::DropDatabase
    }

    async fn execute(&self, _ctx: &ExecutionContext, action: &ActionDescription) -> ExecutionOutcome {
        outcome_of(self.engine.drop_database(action.database()).await)
    }
}

#[async_trait]
impl ActionExecutor for CreateShardExecutor {
    fn kind(&self) -> ActionKind {
        ActionKind::CreateShard
    }

    async fn execute(&self, _ctx: &ExecutionContext, action: &ActionDescription) -> ExecutionOutcome {
        let shard = match shard_of(action) {
            Ok(shard) => shard.clone(),
            Err(outcome) => return outcome,
        };
        let leader = match leader_param(action) {
            Ok(leader) => leader,
            Err(outcome) => return outcome,
        };
        let prototype = match prototype_param(action) {
            Ok(prototype) => prototype,
            Err(outcome) => return outcome,
        };
        let Some(collection) = action.collection() else {
            return ExecutionOutcome::bad_action(format!("{action} has no collection"));
        };
        let spec = ShardSpec {
            database: action.database().to_string(),
            collection: collection.to_string(),
            shard,
            leader,
            prototype,
        };
        outcome_of(self.engine.create_shard(&spec).await)
    }
}

#[async_trait]
impl ActionExecutor for DropShardExecutor {
    fn kind(&self) -> ActionKind {
        ActionKind::DropShard
    }

    async fn execute(&self, _ctx: &ExecutionContext, action: &ActionDescription) -> ExecutionOutcome {
        match shard_of(action) {
            Ok(shard) => outcome_of(self.engine.drop_shard(action.database(), shard).await),
            Err(outcome) => outcome,
        }
    }
}

#[async_trait]
impl ActionExecutor for EnsureIndexExecutor {
    fn kind(&self) -> ActionKind {
        ActionKind::EnsureIndex
    }

    async fn execute(&self, ctx: &ExecutionContext, action: &ActionDescription) -> ExecutionOutcome {
        let shard = match shard_of(action) {
            Ok(shard) => shard,
            Err(outcome) => return outcome,
        };
        let index = match action
            .properties()
            .map(|p| serde_json::from_value::<IndexDefinition>(p.clone()))
        {
            Some(Ok(index)) => index,
            Some(Err(e)) => {
                return ExecutionOutcome::bad_action(format!("invalid index definition: {e}"));
            }
            None => return ExecutionOutcome::bad_action(format!("{action} has no index")),
        };
        outcome_of(
            self.engine
                .create_index(action.database(), shard, &index, &ctx.budget)
                .await,
        )
    }
}

#[async_trait]
impl ActionExecutor for DropIndexExecutor {
    fn kind(&self) -> ActionKind {
        ActionKind::DropIndex
    }

    async fn execute(&self, _ctx: &ExecutionContext, action: &ActionDescription) -> ExecutionOutcome {
        let shard = match shard_of(action) {
            Ok(shard) => shard,
            Err(outcome) => return outcome,
        };
        let Some(index_id) = action.parameter(params::INDEX_ID) else {
            return ExecutionOutcome::bad_action(format!("{action} has no index id"));
        };
        outcome_of(
            self.engine
                .drop_index(action.database(), shard, index_id)
                .await,
        )
    }
}

#[async_trait]
impl ActionExecutor for SynchronizeShardExecutor {
    fn kind(&self) -> ActionKind {
        ActionKind::SynchronizeShard
    }

    async fn execute(&self, ctx: &ExecutionContext, action: &ActionDescription) -> ExecutionOutcome {
        let shard = match shard_of(action) {
            Ok(shard) => shard,
            Err(outcome) => return outcome,
        };
        let leader = match leader_param(action) {
            Ok(Some(leader)) => leader,
            Ok(None) => {
                return ExecutionOutcome::bad_action(format!("{action} has no leader"));
            }
            Err(outcome) => return outcome,
        };
        if leader == ctx.server_id {
            return ExecutionOutcome::bad_action(format!("{action} would follow itself"));
        }
        outcome_of(
            self.engine
                .synchronize_shard_from_leader(action.database(), shard, &leader, &ctx.budget)
                .await,
        )
    }
}

#[async_trait]
impl ActionExecutor for TakeoverShardLeadershipExecutor {
    fn kind(&self) -> ActionKind {
        ActionKind::TakeoverShardLeadership
    }

    async fn execute(&self, _ctx: &ExecutionContext, action: &ActionDescription) -> ExecutionOutcome {
        match shard_of(action) {
            Ok(shard) => outcome_of(self.engine.assume_leadership(action.database(), shard).await),
            Err(outcome) => outcome,
        }
    }
}

#[async_trait]
impl ActionExecutor for ResignShardLeadershipExecutor {
    fn kind(&self) -> ActionKind {
        ActionKind::ResignShardLeadership
    }

    async fn execute(&self, _ctx: &ExecutionContext, action: &ActionDescription) -> ExecutionOutcome {
        match shard_of(action) {
            Ok(shard) => outcome_of(self.engine.resign_leadership(action.database(), shard).await),
            Err(outcome) => outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{
        EngineError, EngineOperation, InMemoryStorageEngine, OperationBudget, StorageEngine,
    };
    use serde_json::json;
    use std::time::Duration;

    fn ctx(budget: OperationBudget) -> ExecutionContext {
        ExecutionContext {
            server_id: ServerId::new("A").unwrap(),
            budget,
        }
    }

    fn s1() -> ShardId {
        ShardId::new("s1").unwrap()
    }

    async fn engine_with_shard() -> Arc<InMemoryStorageEngine> {
        let engine = Arc::new(InMemoryStorageEngine::new());
        engine.create_database("db").await.unwrap();
        engine
            .create_shard(&ShardSpec {
                database: "db".into(),
                collection: "c1".into(),
                shard: s1(),
                leader: None,
                prototype: None,
            })
            .await
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn create_shard_follows_leader_parameter() {
        let engine = Arc::new(InMemoryStorageEngine::new());
        engine.create_database("db").await.unwrap();
        let executor = CreateShardExecutor::new(engine.clone());
        let action = ActionDescription::for_shard(ActionKind::CreateShard, "db", "c1", s1())
            .with_parameter(params::LEADER, "B");

        let outcome = executor
            .execute(&ctx(OperationBudget::unlimited()), &action)
            .await;
        assert_eq!(outcome, ExecutionOutcome::Succeeded);
        let snapshot = engine.local_snapshot().await.unwrap();
        assert_eq!(
            snapshot.databases["db"].shards[&s1()]
                .role
                .followed_leader()
                .map(ServerId::as_str),
            Some("B")
        );
    }

    #[tokio::test]
    async fn create_shard_retries_until_prototype_exists() {
        let engine = Arc::new(InMemoryStorageEngine::new());
        engine.create_database("db").await.unwrap();
        let executor = CreateShardExecutor::new(engine.clone());
        let action = ActionDescription::for_shard(
            ActionKind::CreateShard,
            "db",
            "c2",
            ShardId::new("s3").unwrap(),
        )
        .with_parameter(params::PROTOTYPE_SHARD, "s1");
        let ctx = ctx(OperationBudget::unlimited());

        assert!(matches!(
            executor.execute(&ctx, &action).await,
            ExecutionOutcome::Retryable { .. }
        ));
        let prototype = ActionDescription::for_shard(ActionKind::CreateShard, "db", "c1", s1());
        assert_eq!(executor.execute(&ctx, &prototype).await, ExecutionOutcome::Succeeded);
        assert_eq!(executor.execute(&ctx, &action).await, ExecutionOutcome::Succeeded);
    }

    #[tokio::test]
    async fn ensure_index_yields_then_completes() {
        let engine = engine_with_shard().await;
        engine.yield_once(s1()).unwrap();
        let executor = EnsureIndexExecutor::new(engine.clone());
        let action = ActionDescription::for_shard(ActionKind::EnsureIndex, "db", "c1", s1())
            .with_parameter(params::INDEX_ID, "9")
            .with_properties(json!({"id": "9", "type": "persistent", "fields": ["a"]}));

        let limited = ctx(OperationBudget::with_limit(Duration::from_secs(30)));
        assert_eq!(
            executor.execute(&limited, &action).await,
            ExecutionOutcome::RequeueAsSlow
        );
        assert_eq!(
            executor
                .execute(&ctx(OperationBudget::unlimited()), &action)
                .await,
            ExecutionOutcome::Succeeded
        );
    }

    #[tokio::test]
    async fn ensure_index_without_definition_is_fatal() {
        let engine = engine_with_shard().await;
        let executor = EnsureIndexExecutor::new(engine);
        let action = ActionDescription::for_shard(ActionKind::EnsureIndex, "db", "c1", s1());
        assert!(matches!(
            executor
                .execute(&ctx(OperationBudget::unlimited()), &action)
                .await,
            ExecutionOutcome::Fatal { .. }
        ));
    }

    #[tokio::test]
    async fn engine_fatal_is_propagated() {
        let engine = engine_with_shard().await;
        engine
            .inject_failure(EngineOperation::DropShard, EngineError::fatal(1004, "read only"))
            .unwrap();
        let executor = DropShardExecutor::new(engine);
        let action = ActionDescription::for_shard(ActionKind::DropShard, "db", "c1", s1());
        assert_eq!(
            executor
                .execute(&ctx(OperationBudget::unlimited()), &action)
                .await,
            ExecutionOutcome::Fatal {
                code: 1004,
                message: "read only".into()
            }
        );
    }

    #[tokio::test]
    async fn synchronize_refuses_to_follow_itself() {
        let engine = engine_with_shard().await;
        let executor = SynchronizeShardExecutor::new(engine);
        let action = ActionDescription::for_shard(ActionKind::SynchronizeShard, "db", "c1", s1())
            .with_parameter(params::LEADER, "A");
        assert!(matches!(
            executor
                .execute(&ctx(OperationBudget::unlimited()), &action)
                .await,
            ExecutionOutcome::Fatal { .. }
        ));
    }
}
