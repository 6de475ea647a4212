//! Collection and shard diff.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use shardwarden_core::{ServerId, ShardId};
use shardwarden_core::fingerprint::fingerprint;

use super::{CollectionError, Emitter};
use crate::action::{ActionDescription, ActionKind, Priority, ResourceKey, params};
use crate::current::DatabaseCurrent;
use crate::dag::Dag;
use crate::error::Result;
use crate::errors::ErrorKey;
use crate::local::{LocalDatabase, LocalShard};
use crate::plan::{CollectionPlan, DatabasePlan, PlannedRole};

/// Orders collections so prototypes come before the collections that follow
/// them. Collections on or behind a cycle, and collections naming a missing
/// prototype, are reported and left out.
fn order_collections(
    emitter: &mut Emitter<'_>,
    database: &str,
    db_plan: &DatabasePlan,
) -> Result<(Vec<String>, BTreeSet<String>)> {
    let mut dag = Dag::new();
    for cid in db_plan.collections.keys() {
        dag.add_node(cid.clone());
    }

    let mut rejected = BTreeSet::new();
    for (cid, collection) in &db_plan.collections {
        let Some(prototype) = collection.distribute_shards_like.as_deref() else {
            continue;
        };
        match (dag.index_of(&prototype.to_string()), dag.index_of(cid)) {
            (Some(from), Some(to)) => dag.add_edge(from, to)?,
            _ => {
                emitter.collection_error(CollectionError {
                    database: database.to_string(),
                    collection: cid.clone(),
                    message: format!("distributeShardsLike names unknown collection '{prototype}'"),
                    cycle: false,
                });
                rejected.insert(cid.clone());
            }
        }
    }

    let order = dag.partial_toposort();
    for cid in &order.blocked {
        tracing::warn!(%database, collection = %cid, "distributeShardsLike cycle");
        emitter.collection_error(CollectionError {
            database: database.to_string(),
            collection: cid.clone(),
            message: "collection is part of or depends on a distributeShardsLike cycle".to_string(),
            cycle: true,
        });
        rejected.insert(cid.clone());
    }

    let sorted = order
        .sorted
        .into_iter()
        .filter(|cid| !rejected.contains(cid))
        .collect();
    Ok((sorted, rejected))
}

pub(crate) fn diff_collections(
    emitter: &mut Emitter<'_>,
    database: &str,
    plan_value: &Value,
    db_plan: &DatabasePlan,
    local_db: &LocalDatabase,
    current_db: &DatabaseCurrent,
) -> Result<()> {
    let (sorted, rejected) = order_collections(emitter, database, db_plan)?;

    let collection_fingerprint = |cid: &str| {
        fingerprint(
            plan_value
                .get("collections")
                .and_then(|collections| collections.get(cid)),
        )
    };

    for cid in &sorted {
        let Some(collection) = db_plan.collections.get(cid) else {
            continue;
        };
        emitter.resolve(ErrorKey::Collection {
            database: database.to_string(),
            collection: cid.clone(),
        });
        let plan_fingerprint = collection_fingerprint(cid);
        for shard in collection.shards.keys() {
            let role = collection.role_of(shard, emitter.input().server_id);
            if !role.is_assigned() {
                continue;
            }
            let shard_key = ErrorKey::Shard {
                database: database.to_string(),
                shard: shard.clone(),
            };
            if emitter.excluded_by_error(&shard_key, &plan_fingerprint) {
                continue;
            }
            let planned = PlannedShard {
                database,
                cid,
                collection,
                shard,
                role,
                prototype: prototype_shard(db_plan, collection, shard, emitter.input().server_id),
                plan_fingerprint: &plan_fingerprint,
            };
            match local_db.shards.get(shard) {
                None => create_shard(emitter, &planned),
                Some(local) => {
                    let steps = shard_steps(emitter, &planned, local, current_db);
                    if steps.is_empty() {
                        emitter.resolve(shard_key);
                        emitter.in_sync(ResourceKey::shard(database, shard.clone()));
                    } else {
                        emitter.emit_first(steps);
                    }
                }
            }
        }
    }

    drop_unplanned_shards(
        emitter,
        database,
        db_plan,
        &rejected,
        local_db,
        &collection_fingerprint,
    );
    forget_stale_errors(emitter, database, db_plan, local_db);
    Ok(())
}

/// Resolves entries whose collection, shard or index is neither planned on
/// this server nor present locally.
fn forget_stale_errors(
    emitter: &mut Emitter<'_>,
    database: &str,
    db_plan: &DatabasePlan,
    local_db: &LocalDatabase,
) {
    let me = emitter.input().server_id;
    let assigned: BTreeMap<&ShardId, &CollectionPlan> = db_plan
        .collections
        .values()
        .flat_map(|collection| {
            collection
                .shards
                .keys()
                .filter(move |shard| collection.role_of(shard, me).is_assigned())
                .map(move |shard| (shard, collection))
        })
        .collect();

    let stale: Vec<ErrorKey> = emitter
        .input()
        .prior_errors
        .keys()
        .filter(|key| key.database() == database)
        .filter(|key| match key {
            ErrorKey::Database { .. } => false,
            ErrorKey::Collection { collection, .. } => {
                !db_plan.collections.contains_key(collection)
            }
            ErrorKey::Shard { shard, .. } => {
                !assigned.contains_key(shard) && !local_db.shards.contains_key(shard)
            }
            ErrorKey::Index {
                shard, index_id, ..
            } => {
                let planned = assigned.get(shard).is_some_and(|collection| {
                    collection
                        .secondary_indexes()
                        .any(|index| &index.id == index_id)
                });
                let local = local_db
                    .shards
                    .get(shard)
                    .is_some_and(|local| local.has_index(index_id));
                !planned && !local
            }
        })
        .cloned()
        .collect();
    for key in stale {
        tracing::debug!(?key, "forgetting error of unplanned resource");
        emitter.resolve(key);
    }
}

struct PlannedShard<'p> {
    database: &'p str,
    cid: &'p str,
    collection: &'p CollectionPlan,
    shard: &'p ShardId,
    role: PlannedRole,
    prototype: Option<&'p ShardId>,
    plan_fingerprint: &'p str,
}

/// The prototype's shard at the same position, if this server holds it too.
fn prototype_shard<'p>(
    db_plan: &'p DatabasePlan,
    collection: &CollectionPlan,
    shard: &ShardId,
    server: &ServerId,
) -> Option<&'p ShardId> {
    let prototype = db_plan
        .collections
        .get(collection.distribute_shards_like.as_deref()?)?;
    let position = collection.shards.keys().position(|s| s == shard)?;
    let candidate = prototype.shards.keys().nth(position)?;
    prototype
        .role_of(candidate, server)
        .is_assigned()
        .then_some(candidate)
}

impl PlannedShard<'_> {
    fn action(&self, kind: ActionKind) -> ActionDescription {
        ActionDescription::for_shard(kind, self.database, self.cid, self.shard.clone())
            .with_parameter(params::PLAN_FINGERPRINT, self.plan_fingerprint)
    }
}

fn create_shard(emitter: &mut Emitter<'_>, planned: &PlannedShard<'_>) {
    let Some(leader) = planned.collection.leader_of(planned.shard) else {
        // The leader resigned; the new one is not planned yet.
        tracing::debug!(shard = %planned.shard, "planned leader resigned, waiting");
        emitter.mark_dirty(planned.database);
        return;
    };
    let mut action = planned.action(ActionKind::CreateShard);
    if let Some(prototype) = planned.prototype {
        action = action.with_parameter(params::PROTOTYPE_SHARD, prototype.as_str());
    }
    let action = if planned.role == PlannedRole::Leader {
        action
            .with_priority(Priority::LEADER)
            .with_parameter(params::LEADER, "")
    } else {
        action
            .with_priority(Priority::FOLLOWER)
            .with_parameter(params::LEADER, leader)
    };
    emitter.emit(action);
}

/// Everything the local shard needs, in the order it should happen.
fn shard_steps(
    emitter: &mut Emitter<'_>,
    planned: &PlannedShard<'_>,
    local: &LocalShard,
    current_db: &DatabaseCurrent,
) -> Vec<ActionDescription> {
    let me = emitter.input().server_id;
    let leading = local.role.is_leader();
    let mut steps = Vec::new();

    match planned.role {
        PlannedRole::Leader if !leading => steps.push(
            planned
                .action(ActionKind::TakeoverShardLeadership)
                .with_priority(Priority::LEADER),
        ),
        PlannedRole::Follower | PlannedRole::ResignedLeader if leading => steps.push(
            planned
                .action(ActionKind::ResignShardLeadership)
                .with_priority(Priority::RESIGN),
        ),
        _ => {}
    }

    let planned_ids: BTreeSet<&str> = planned
        .collection
        .secondary_indexes()
        .map(|index| index.id.as_str())
        .collect();
    for index in local.indexes.iter().filter(|index| !index.is_implicit()) {
        if !planned_ids.contains(index.id.as_str()) {
            steps.push(
                planned
                    .action(ActionKind::DropIndex)
                    .with_parameter(params::INDEX_ID, index.id.clone()),
            );
        }
    }

    for index in planned.collection.secondary_indexes() {
        let index_key = ErrorKey::Index {
            database: planned.database.to_string(),
            shard: planned.shard.clone(),
            index_id: index.id.clone(),
        };
        if local.has_index(&index.id) {
            emitter.resolve(index_key);
            continue;
        }
        if emitter.excluded_by_error(&index_key, planned.plan_fingerprint) {
            continue;
        }
        let Ok(definition) = serde_json::to_value(index) else {
            continue;
        };
        steps.push(
            planned
                .action(ActionKind::EnsureIndex)
                .with_parameter(params::INDEX_ID, index.id.clone())
                .with_properties(definition),
        );
    }

    if planned.role == PlannedRole::Follower && !leading {
        if let Some(leader) = planned.collection.leader_of(planned.shard) {
            let follows_other = local.role.followed_leader().map(|l| l.as_str()) != Some(leader);
            let reported_behind = current_db
                .shard(planned.cid, planned.shard)
                .is_some_and(|current| {
                    current.leader() == Some(leader) && !current.is_in_sync(me.as_str())
                });
            if follows_other || reported_behind {
                steps.push(
                    planned
                        .action(ActionKind::SynchronizeShard)
                        .with_parameter(params::LEADER, leader),
                );
            }
        }
    }

    steps
}

fn drop_unplanned_shards(
    emitter: &mut Emitter<'_>,
    database: &str,
    db_plan: &DatabasePlan,
    rejected: &BTreeSet<String>,
    local_db: &LocalDatabase,
    collection_fingerprint: &dyn Fn(&str) -> String,
) {
    let planned_in: BTreeMap<&ShardId, (&str, &CollectionPlan)> = db_plan
        .collections
        .iter()
        .flat_map(|(cid, collection)| {
            collection
                .shards
                .keys()
                .map(move |shard| (shard, (cid.as_str(), collection)))
        })
        .collect();
    let me = emitter.input().server_id;

    for (shard, local) in &local_db.shards {
        let cid = match planned_in.get(shard) {
            Some((cid, _)) if rejected.contains(*cid) => continue,
            Some((_, collection)) if collection.role_of(shard, me).is_assigned() => continue,
            Some((cid, _)) => *cid,
            None => local.collection.as_str(),
        };
        let plan_fingerprint = collection_fingerprint(cid);
        let shard_key = ErrorKey::Shard {
            database: database.to_string(),
            shard: shard.clone(),
        };
        if emitter.excluded_by_error(&shard_key, &plan_fingerprint) {
            continue;
        }
        emitter.emit(
            ActionDescription::for_shard(
                ActionKind::DropShard,
                database,
                local.collection.clone(),
                shard.clone(),
            )
            .with_parameter(params::PLAN_FINGERPRINT, plan_fingerprint),
        );
    }
}
