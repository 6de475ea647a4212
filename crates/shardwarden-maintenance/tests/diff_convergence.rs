//! Convergence and idempotence of the diff against the in-memory engine.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use shardwarden_core::{ServerId, ShardId};
use shardwarden_maintenance::action::ActionKind;
use shardwarden_maintenance::diff::{DiffInput, DiffOutcome, diff_plan_local};
use shardwarden_maintenance::errors::PriorErrors;
use shardwarden_maintenance::executor::{ExecutionContext, ExecutionOutcome, ExecutorRegistry};
use shardwarden_maintenance::local::{LocalDatabase, LocalShard, LocalSnapshot, ShardRole};
use shardwarden_maintenance::registry::{ActionRegistry, ShardActionMap};
use shardwarden_maintenance::replication::{
    InMemoryReplicationCoordinator, ReplicatedLogStatusMap, ReplicatedStateStatusMap,
    ReplicationCoordinator,
};
use shardwarden_maintenance::storage::{InMemoryStorageEngine, OperationBudget, StorageEngine};

fn me() -> ServerId {
    ServerId::new("A").unwrap()
}

fn plan() -> Value {
    json!({
        "db": {
            "collections": {
                "c1": {
                    "name": "users",
                    "indexes": [
                        { "id": "0", "type": "primary" },
                        { "id": "7", "type": "persistent", "fields": ["email"], "unique": true }
                    ],
                    "shards": { "s1": ["A", "B"], "s2": ["B", "A"] }
                },
                "c2": {
                    "name": "orders",
                    "distributeShardsLike": "c1",
                    "shards": { "s3": ["A", "B"] }
                }
            },
            "replicatedLogs": {
                "11": { "id": 11, "currentTerm": { "term": 2, "leader": "A" },
                        "participantsConfig": { "generation": 1, "participants": { "A": {}, "B": {} } } }
            },
            "replicatedStates": {
                "11": { "id": 11, "generation": 1, "participants": { "A": { "generation": 1 } } }
            }
        }
    })
}

fn stale_local() -> LocalSnapshot {
    let mut local = LocalSnapshot::default();
    local
        .databases
        .insert("gone".to_string(), LocalDatabase::default());
    local
}

struct Sources {
    local: LocalSnapshot,
    logs: ReplicatedLogStatusMap,
    states: ReplicatedStateStatusMap,
}

async fn sources(
    engine: &InMemoryStorageEngine,
    replication: &InMemoryReplicationCoordinator,
) -> Sources {
    Sources {
        local: engine.local_snapshot().await.unwrap(),
        logs: replication.local_log_status().await.unwrap(),
        states: replication.local_state_status().await.unwrap(),
    }
}

fn diff(plan: &Value, sources: &Sources, shard_actions: &ShardActionMap) -> DiffOutcome {
    let dirty: BTreeSet<String> = plan
        .as_object()
        .unwrap()
        .keys()
        .cloned()
        .chain(sources.local.databases.keys().cloned())
        .collect();
    let server_id = me();
    let prior_errors = PriorErrors::new();
    let current = json!({});
    diff_plan_local(&DiffInput {
        plan,
        plan_index: 1,
        current: &current,
        current_index: 1,
        dirty: &dirty,
        local: &sources.local,
        server_id: &server_id,
        prior_errors: &prior_errors,
        shard_actions,
        log_status: &sources.logs,
        state_status: &sources.states,
        error_cooldown: Duration::from_secs(60),
        now: Utc::now(),
    })
    .unwrap()
}

#[tokio::test]
async fn rounds_converge_to_the_plan() {
    let engine = InMemoryStorageEngine::with_snapshot(stale_local());
    let replication = InMemoryReplicationCoordinator::new(me());
    let executors = ExecutorRegistry::standard(
        Arc::new(engine.clone()),
        Arc::new(replication.clone()),
    );
    let ctx = ExecutionContext {
        server_id: me(),
        budget: OperationBudget::unlimited(),
    };
    let plan = plan();

    let mut converged = false;
    for _ in 0..10 {
        let sources = sources(&engine, &replication).await;
        let outcome = diff(&plan, &sources, &ShardActionMap::default());
        if outcome.actions.is_empty() && outcome.make_dirty.is_empty() {
            converged = true;
            break;
        }
        for action in &outcome.actions {
            assert_eq!(
                executors.execute(&ctx, action).await,
                ExecutionOutcome::Succeeded,
                "{action}"
            );
        }
    }
    assert!(converged, "diff did not converge");

    let local = engine.local_snapshot().await.unwrap();
    assert!(local.database("gone").is_none());
    let db = local.database("db").unwrap();
    let s1 = &db.shards[&ShardId::new("s1").unwrap()];
    assert!(s1.role.is_leader());
    assert!(s1.has_index("7"));
    let s2 = &db.shards[&ShardId::new("s2").unwrap()];
    assert_eq!(s2.role.followed_leader(), Some(&ServerId::new("B").unwrap()));
    assert!(s2.has_index("7"));
    assert!(db.shards[&ShardId::new("s3").unwrap()].role.is_leader());

    let states = replication.local_state_status().await.unwrap();
    assert!(states["db"].contains_key(&"11".parse().unwrap()));
}

#[tokio::test]
async fn second_diff_with_registered_actions_is_empty() {
    let engine = InMemoryStorageEngine::with_snapshot(stale_local());
    engine.create_database("db").await.unwrap();
    let replication = InMemoryReplicationCoordinator::new(me());
    let plan = plan();
    let sources = sources(&engine, &replication).await;

    let registry = ActionRegistry::new();
    let first = diff(&plan, &sources, &registry.snapshot().unwrap());
    assert!(!first.actions.is_empty());
    for action in &first.actions {
        registry.try_activate(action).unwrap();
    }

    let second = diff(&plan, &sources, &registry.snapshot().unwrap());
    assert!(second.actions.is_empty(), "{:?}", second.actions);
    assert_eq!(second.suppressed, first.actions.len());
}

#[tokio::test]
async fn converged_state_emits_nothing() {
    let mut local = LocalSnapshot::default();
    let db = local.databases.entry("db".to_string()).or_default();
    let mut leader = LocalShard::new("c1", ShardRole::Leader);
    leader.indexes.push(
        serde_json::from_value(json!({ "id": "7", "type": "persistent", "fields": ["email"] }))
            .unwrap(),
    );
    db.shards.insert(ShardId::new("s1").unwrap(), leader);

    let plan = json!({ "db": { "collections": { "c1": {
        "indexes": [ { "id": "7", "type": "persistent", "fields": ["email"] } ],
        "shards": { "s1": ["A"] }
    } } } });
    let sources = Sources {
        local,
        logs: ReplicatedLogStatusMap::new(),
        states: ReplicatedStateStatusMap::new(),
    };
    let outcome = diff(&plan, &sources, &ShardActionMap::default());
    assert!(outcome.actions.is_empty());
    assert!(outcome.make_dirty.is_empty());
    assert!(!outcome.call_notify);
}

#[tokio::test]
async fn cycle_members_get_no_actions() {
    let engine = InMemoryStorageEngine::new();
    engine.create_database("db").await.unwrap();
    let replication = InMemoryReplicationCoordinator::new(me());
    let plan = json!({ "db": { "collections": {
        "a": { "distributeShardsLike": "c", "shards": { "sa": ["A"] } },
        "b": { "distributeShardsLike": "a", "shards": { "sb": ["A"] } },
        "c": { "distributeShardsLike": "b", "shards": { "sc": ["A"] } },
        "free": { "shards": { "sf": ["A"] } }
    } } });
    let outcome = diff(&plan, &sources(&engine, &replication).await, &ShardActionMap::default());

    let shards: Vec<_> = outcome
        .actions
        .iter()
        .filter(|a| a.kind() == ActionKind::CreateShard)
        .filter_map(|a| a.shard().map(ShardId::as_str))
        .collect();
    assert_eq!(shards, vec!["sf"]);
    let mut cyclic: Vec<_> = outcome
        .collection_errors
        .iter()
        .filter(|e| e.cycle)
        .map(|e| e.collection.clone())
        .collect();
    cyclic.sort();
    assert_eq!(cyclic, vec!["a", "b", "c"]);
}
