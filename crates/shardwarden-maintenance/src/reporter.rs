//! Phase two: publishing local truth into Current.
//!
//! [`report_in_current`] compares what this server hosts with what Current
//! says about it and builds a single transaction holding only the
//! differences, guarded by the Current index the comparison was made
//! against. [`Reporter`] retries from a fresh Current read when another
//! writer got in between.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use shardwarden_core::agency::{
    AgencyBackend, AgencyPath, AgencyTransaction, Precondition, WriteResult, lookup,
};
use shardwarden_core::observability::maintenance_span;
use shardwarden_core::{ServerId, ShardId};
use tracing::Instrument;

use crate::error::{Error, Result};
use crate::errors::{ErrorEntry, ErrorKey, PriorErrors};
use crate::local::{LocalShard, LocalSnapshot};
use crate::metrics::MaintenanceMetrics;
use crate::plan::{CollectionPlan, DatabasePlan, PlannedRole};
use crate::replication::ReplicatedStateStatusMap;

/// Counts over every local shard, published with each report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardStatistics {
    /// Local shards.
    pub num_shards: usize,
    /// Local shards this server leads.
    pub num_leader_shards: usize,
    /// Led shards with fewer in-sync followers than planned.
    pub num_out_of_sync_shards: usize,
    /// Led shards that should have followers but have none in sync.
    pub num_not_replicated: usize,
}

/// Everything one report looks at.
#[derive(Debug, Clone, Copy)]
pub struct ReportInput<'a> {
    /// The Plan tree.
    pub plan: &'a Value,
    /// The Current tree.
    pub current: &'a Value,
    /// Index of the Current read; becomes the transaction's precondition.
    pub current_index: u64,
    /// Databases whose entries are rewritten.
    pub dirty: &'a BTreeSet<String>,
    /// What this server hosts.
    pub local: &'a LocalSnapshot,
    /// Errors to publish.
    pub prior_errors: &'a PriorErrors,
    /// Local replicated state status.
    pub state_status: &'a ReplicatedStateStatusMap,
    /// This server.
    pub server_id: &'a ServerId,
}

/// What [`report_in_current`] produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportOutcome {
    /// Deltas to write; empty when Current is up to date.
    pub transaction: AgencyTransaction,
    /// Counts over all local shards.
    pub statistics: ShardStatistics,
}

fn error_fields(entry: Option<&ErrorEntry>) -> (bool, String, u64) {
    match entry {
        Some(entry) => (true, entry.message.clone(), entry.error_num),
        None => (false, String::new(), 0),
    }
}

struct DatabaseReport<'a> {
    input: &'a ReportInput<'a>,
    database: &'a str,
    current: Option<&'a Value>,
    transaction: &'a mut AgencyTransaction,
}

impl DatabaseReport<'_> {
    fn current_at(&self, segments: &[&str]) -> Option<&Value> {
        let segments: Vec<String> = segments.iter().map(|s| (*s).to_string()).collect();
        self.current.and_then(|db| lookup(db, &segments))
    }

    fn path(&self, segments: &[&str]) -> AgencyPath {
        AgencyPath::current(
            std::iter::once(self.database).chain(segments.iter().copied()),
        )
    }

    /// Writes `desired` at `segments` unless Current already holds it.
    fn put(&mut self, segments: &[&str], desired: Value) {
        if self.current_at(segments) != Some(&desired) {
            tracing::debug!(database = %self.database, path = ?segments, "reporting");
            let path = self.path(segments);
            self.transaction.set(path, desired);
        }
    }

    fn remove(&mut self, segments: &[&str]) {
        if self.current_at(segments).is_some() {
            let path = self.path(segments);
            self.transaction.delete(path);
        }
    }

    fn shard_error(&self, cid: &str, shard: &ShardId) -> Option<&'_ ErrorEntry> {
        let errors = self.input.prior_errors;
        errors
            .get(&ErrorKey::Shard {
                database: self.database.to_string(),
                shard: shard.clone(),
            })
            .or_else(|| {
                errors.get(&ErrorKey::Collection {
                    database: self.database.to_string(),
                    collection: cid.to_string(),
                })
            })
    }

    fn leader_entry(&self, cid: &str, shard: &ShardId, local: &LocalShard) -> Value {
        let me = self.input.server_id.as_str();
        let servers: Vec<&str> = std::iter::once(me)
            .chain(local.in_sync_followers.iter().map(ServerId::as_str))
            .collect();
        let candidates: Vec<&str> = std::iter::once(me)
            .chain(local.failover_candidates.iter().map(ServerId::as_str))
            .collect();

        let mut indexes: Vec<Value> = local
            .indexes
            .iter()
            .filter_map(|index| serde_json::to_value(index).ok())
            .collect();
        for (key, entry) in self.input.prior_errors {
            if let ErrorKey::Index {
                database,
                shard: errored,
                index_id,
            } = key
            {
                if database == self.database && errored == shard {
                    indexes.push(json!({
                        "id": index_id,
                        "error": true,
                        "errorMessage": entry.message,
                        "errorNum": entry.error_num,
                    }));
                }
            }
        }

        let (error, message, num) = error_fields(self.shard_error(cid, shard));
        json!({
            "servers": servers,
            "failoverCandidates": candidates,
            "indexes": indexes,
            "error": error,
            "errorMessage": message,
            "errorNum": num,
        })
    }

    fn report_shards(&mut self, db_plan: Option<&DatabasePlan>) {
        let me = self.input.server_id;
        let local_db = self.input.local.database(self.database);
        let mut reported: BTreeSet<(String, ShardId)> = BTreeSet::new();

        if let Some(db_plan) = db_plan {
            for (cid, collection) in &db_plan.collections {
                for shard in collection.shards.keys() {
                    let local = local_db.and_then(|db| db.shards.get(shard));
                    let entry = match local {
                        Some(local) if local.role.is_leader() => {
                            self.leader_entry(cid, shard, local)
                        }
                        // A planned leader whose shard failed to appear.
                        None if collection.role_of(shard, me) == PlannedRole::Leader => {
                            let Some(error) = self.shard_error(cid, shard) else {
                                continue;
                            };
                            json!({
                                "servers": [],
                                "failoverCandidates": [],
                                "indexes": [],
                                "error": true,
                                "errorMessage": error.message,
                                "errorNum": error.error_num,
                            })
                        }
                        _ => continue,
                    };
                    self.put(&["collections", cid, shard.as_str()], entry);
                    reported.insert((cid.clone(), shard.clone()));
                }
            }
        }

        // Entries naming this server as leader of shards it no longer leads.
        let stale: Vec<(String, String)> = self
            .current_at(&["collections"])
            .and_then(Value::as_object)
            .into_iter()
            .flat_map(Map::iter)
            .flat_map(|(cid, shards)| {
                shards
                    .as_object()
                    .into_iter()
                    .flat_map(Map::iter)
                    .map(move |(shard, entry)| (cid, shard, entry))
            })
            .filter(|(_, _, entry)| {
                entry
                    .get("servers")
                    .and_then(|servers| servers.get(0))
                    .and_then(Value::as_str)
                    == Some(me.as_str())
            })
            .filter(|(cid, shard, _)| {
                !ShardId::new(shard.as_str())
                    .is_ok_and(|id| reported.contains(&((*cid).clone(), id)))
            })
            .map(|(cid, shard, _)| (cid.clone(), shard.clone()))
            .collect();
        for (cid, shard) in stale {
            self.remove(&["collections", &cid, &shard]);
        }
    }

    fn report_server_entry(&mut self) {
        let me = self.input.server_id.as_str();
        let error = self.input.prior_errors.get(&ErrorKey::Database {
            database: self.database.to_string(),
        });
        if self.input.local.database(self.database).is_none() && error.is_none() {
            self.remove(&["servers", me]);
            return;
        }
        let (error, message, num) = error_fields(error);
        self.put(
            &["servers", me],
            json!({ "error": error, "errorMessage": message, "errorNum": num }),
        );
    }

    fn report_states(&mut self) {
        let me = self.input.server_id.as_str();
        let local = self.input.state_status.get(self.database);
        for (id, status) in local.into_iter().flatten() {
            let id = id.to_string();
            self.put(
                &["replicatedStates", &id, "participants", me],
                json!({
                    "generation": status.generation,
                    "snapshotStatus": status.snapshot_status.as_label(),
                }),
            );
        }

        let reported_ids: Vec<String> = self
            .current_at(&["replicatedStates"])
            .and_then(Value::as_object)
            .into_iter()
            .flat_map(Map::iter)
            .filter(|(_, state)| {
                state
                    .get("participants")
                    .and_then(|p| p.get(me))
                    .is_some()
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in reported_ids {
            let still_local = id
                .parse()
                .ok()
                .is_some_and(|log_id| local.is_some_and(|states| states.contains_key(&log_id)));
            if !still_local {
                self.remove(&["replicatedStates", &id, "participants", me]);
            }
        }
    }
}

fn planned_followers(collection: Option<&CollectionPlan>, shard: &ShardId) -> usize {
    collection
        .and_then(|c| c.shards.get(shard))
        .map_or(0, |servers| servers.len().saturating_sub(1))
}

fn statistics(input: &ReportInput<'_>) -> ShardStatistics {
    let mut stats = ShardStatistics::default();
    for (database, shard, local) in input.local.shards() {
        stats.num_shards += 1;
        if !local.role.is_leader() {
            continue;
        }
        stats.num_leader_shards += 1;
        let collection = input
            .plan
            .get(database)
            .and_then(|db| db.get("collections"))
            .and_then(|c| c.get(&local.collection))
            .and_then(|c| serde_json::from_value::<CollectionPlan>(c.clone()).ok());
        let planned = planned_followers(collection.as_ref(), shard);
        if local.in_sync_followers.len() < planned {
            stats.num_out_of_sync_shards += 1;
        }
        if planned > 0 && local.in_sync_followers.is_empty() {
            stats.num_not_replicated += 1;
        }
    }
    stats
}

/// Builds the Current delta for the dirty databases.
///
/// Shards this server leads get their full entry; shards it was planned to
/// lead but failed to create get an error entry; entries still naming this
/// server as leader of shards it no longer leads are deleted. The
/// per-database server entry carries database errors, and replicated state
/// participant status is reported. Statistics cover all local shards.
#[must_use]
pub fn report_in_current(input: &ReportInput<'_>) -> ReportOutcome {
    let mut transaction =
        AgencyTransaction::new().with_precondition(Precondition::CurrentIndex(input.current_index));

    for database in input.dirty {
        let db_plan = input
            .plan
            .get(database)
            .and_then(|value| DatabasePlan::from_value(value).ok());
        let mut report = DatabaseReport {
            input,
            database,
            current: input.current.get(database),
            transaction: &mut transaction,
        };
        report.report_shards(db_plan.as_ref());
        report.report_server_entry();
        report.report_states();
    }

    ReportOutcome {
        transaction,
        statistics: statistics(input),
    }
}

/// Local facts a report is built from; gathered once per phase two.
#[derive(Debug, Clone, Copy)]
pub struct LocalFacts<'a> {
    /// The Plan tree.
    pub plan: &'a Value,
    /// Databases whose entries are rewritten.
    pub dirty: &'a BTreeSet<String>,
    /// What this server hosts.
    pub local: &'a LocalSnapshot,
    /// Errors to publish.
    pub prior_errors: &'a PriorErrors,
    /// Local replicated state status.
    pub state_status: &'a ReplicatedStateStatusMap,
}

/// Writes reports, retrying on Current index conflicts.
#[derive(Clone)]
pub struct Reporter {
    agency: Arc<dyn AgencyBackend>,
    server_id: ServerId,
    retry_limit: u32,
    metrics: MaintenanceMetrics,
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("server_id", &self.server_id)
            .field("retry_limit", &self.retry_limit)
            .finish_non_exhaustive()
    }
}

impl Reporter {
    /// Creates a reporter writing through `agency`.
    #[must_use]
    pub fn new(
        agency: Arc<dyn AgencyBackend>,
        server_id: ServerId,
        retry_limit: u32,
        metrics: MaintenanceMetrics,
    ) -> Self {
        Self {
            agency,
            server_id,
            retry_limit: retry_limit.max(1),
            metrics,
        }
    }

    /// Reports `facts` into Current.
    ///
    /// Each attempt reads Current afresh and writes one transaction guarded
    /// by the index it read; nothing is ever merged partially.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReportConflict`] once the retry limit is used up, or
    /// the agency error if reading or writing fails.
    pub async fn phase_two(&self, facts: LocalFacts<'_>) -> Result<ShardStatistics> {
        let span = maintenance_span("phase_two", self.server_id.as_str());
        async {
            for attempt in 1..=self.retry_limit {
                let current = self.agency.read_current().await?;
                let outcome = report_in_current(&ReportInput {
                    plan: facts.plan,
                    current: &current.tree,
                    current_index: current.index,
                    dirty: facts.dirty,
                    local: facts.local,
                    prior_errors: facts.prior_errors,
                    state_status: facts.state_status,
                    server_id: &self.server_id,
                });
                self.metrics.set_shard_statistics(&outcome.statistics);
                if outcome.transaction.is_empty() {
                    tracing::debug!("current is up to date");
                    return Ok(outcome.statistics);
                }

                let operations = outcome.transaction.operations.len();
                match self.agency.write(outcome.transaction).await? {
                    WriteResult::Success { current_index } => {
                        tracing::info!(operations, current_index, "reported to current");
                        return Ok(outcome.statistics);
                    }
                    WriteResult::PreconditionFailed {
                        current_index,
                        failed,
                    } => {
                        self.metrics.record_report_conflict();
                        tracing::debug!(
                            attempt,
                            current_index,
                            %failed,
                            "current moved, rebuilding report"
                        );
                    }
                }
            }
            tracing::warn!(attempts = self.retry_limit, "giving up on report this round");
            Err(Error::ReportConflict {
                attempts: self.retry_limit,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shardwarden_core::LogId;
    use shardwarden_core::agency::AgencyOperation;

    use crate::local::ShardRole;
    use crate::plan::IndexDefinition;
    use crate::replication::{SnapshotStatus, StateStatus};

    fn me() -> ServerId {
        ServerId::new("A").unwrap()
    }

    fn plan() -> Value {
        json!({ "db": { "collections": { "c1": {
            "shards": { "s1": ["A", "B", "C"], "s2": ["A"] }
        } } } })
    }

    fn dirty() -> BTreeSet<String> {
        BTreeSet::from(["db".to_string()])
    }

    fn leading(followers: &[&str]) -> LocalShard {
        let mut shard = LocalShard::new("c1", ShardRole::Leader);
        shard.in_sync_followers = followers.iter().map(|f| ServerId::new(*f).unwrap()).collect();
        shard.failover_candidates = shard.in_sync_followers.clone();
        shard
    }

    fn local(shards: Vec<(&str, LocalShard)>) -> LocalSnapshot {
        let mut snapshot = LocalSnapshot::default();
        let db = snapshot.databases.entry("db".to_string()).or_default();
        for (name, shard) in shards {
            db.shards.insert(ShardId::new(name).unwrap(), shard);
        }
        snapshot
    }

    fn run(current: &Value, local: &LocalSnapshot, errors: &PriorErrors) -> ReportOutcome {
        let plan = plan();
        let dirty = dirty();
        let states = ReplicatedStateStatusMap::new();
        let me = me();
        report_in_current(&ReportInput {
            plan: &plan,
            current,
            current_index: 7,
            dirty: &dirty,
            local,
            prior_errors: errors,
            state_status: &states,
            server_id: &me,
        })
    }

    fn set_paths(transaction: &AgencyTransaction) -> Vec<String> {
        transaction
            .operations
            .iter()
            .filter(|op| matches!(op, AgencyOperation::Set { .. }))
            .map(|op| op.path().to_string())
            .collect()
    }

    #[test]
    fn leader_entry_lists_in_sync_followers() {
        let local = local(vec![("s1", leading(&["B"]))]);
        let outcome = run(&json!({}), &local, &PriorErrors::new());
        assert_eq!(
            outcome.transaction.preconditions,
            vec![Precondition::CurrentIndex(7)]
        );
        let set = outcome
            .transaction
            .operations
            .iter()
            .find_map(|op| match op {
                AgencyOperation::Set { path, value } if path.to_string().ends_with("s1") => {
                    Some(value.clone())
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(set["servers"], json!(["A", "B"]));
        assert_eq!(set["error"], json!(false));
    }

    #[test]
    fn unchanged_entries_are_not_rewritten() {
        let local = local(vec![("s2", leading(&[]))]);
        let first = run(&json!({}), &local, &PriorErrors::new());

        let mut current = json!({});
        for op in &first.transaction.operations {
            if let AgencyOperation::Set { path, value } = op {
                let mut node = &mut current;
                for segment in path.segments() {
                    node = &mut node[segment.as_str()];
                }
                *node = value.clone();
            }
        }
        let second = run(&current, &local, &PriorErrors::new());
        assert!(second.transaction.is_empty());
    }

    #[test]
    fn stale_leader_entries_are_deleted() {
        let current = json!({ "db": { "collections": {
            "c1": { "gone": { "servers": ["A"] }, "other": { "servers": ["B", "A"] } }
        } } });
        let outcome = run(&current, &local(vec![]), &PriorErrors::new());
        let deletes: Vec<String> = outcome
            .transaction
            .operations
            .iter()
            .filter(|op| matches!(op, AgencyOperation::Delete { .. }))
            .map(|op| op.path().to_string())
            .collect();
        assert_eq!(deletes, vec!["Current/db/collections/c1/gone".to_string()]);
    }

    #[test]
    fn failed_creation_is_reported_for_planned_leader() {
        let mut errors = PriorErrors::new();
        errors.insert(
            ErrorKey::Shard {
                database: "db".to_string(),
                shard: ShardId::new("s2").unwrap(),
            },
            ErrorEntry {
                message: "no space".to_string(),
                error_num: 28,
                fatal: true,
                plan_fingerprint: None,
                recorded_at: Utc::now(),
            },
        );
        let outcome = run(&json!({}), &local(vec![]), &errors);
        assert!(set_paths(&outcome.transaction).contains(&"Current/db/collections/c1/s2".to_string()));
    }

    #[test]
    fn index_errors_ride_along_with_the_shard() {
        let mut shard = leading(&[]);
        shard.indexes.push(IndexDefinition {
            id: "1".to_string(),
            index_type: "persistent".to_string(),
            fields: vec!["x".to_string()],
            unique: false,
            sparse: false,
        });
        let mut errors = PriorErrors::new();
        errors.insert(
            ErrorKey::Index {
                database: "db".to_string(),
                shard: ShardId::new("s2").unwrap(),
                index_id: "2".to_string(),
            },
            ErrorEntry {
                message: "duplicate".to_string(),
                error_num: 1210,
                fatal: true,
                plan_fingerprint: None,
                recorded_at: Utc::now(),
            },
        );
        let outcome = run(&json!({}), &local(vec![("s2", shard)]), &errors);
        let AgencyOperation::Set { value, .. } = &outcome.transaction.operations[0] else {
            panic!("expected a set");
        };
        let indexes = value["indexes"].as_array().unwrap();
        assert_eq!(indexes.len(), 2);
        assert_eq!(indexes[1]["errorNum"], json!(1210));
    }

    #[test]
    fn statistics_cover_all_local_shards() {
        let follower = LocalShard::new("c1", ShardRole::Follower { leader: None });
        let local = local(vec![
            ("s1", leading(&[])),
            ("s2", leading(&[])),
            ("s3", follower),
        ]);
        let stats = run(&json!({}), &local, &PriorErrors::new()).statistics;
        assert_eq!(
            stats,
            ShardStatistics {
                num_shards: 3,
                num_leader_shards: 2,
                num_out_of_sync_shards: 1,
                num_not_replicated: 1,
            }
        );
    }

    #[test]
    fn replicated_state_participant_is_reported() {
        let plan = plan();
        let dirty = dirty();
        let mut states = ReplicatedStateStatusMap::new();
        states.entry("db".to_string()).or_default().insert(
            LogId::new(4),
            StateStatus {
                generation: 2,
                snapshot_status: SnapshotStatus::Completed,
            },
        );
        let me = me();
        let local = local(vec![]);
        let errors = PriorErrors::new();
        let outcome = report_in_current(&ReportInput {
            plan: &plan,
            current: &json!({}),
            current_index: 1,
            dirty: &dirty,
            local: &local,
            prior_errors: &errors,
            state_status: &states,
            server_id: &me,
        });
        assert!(
            set_paths(&outcome.transaction)
                .contains(&"Current/db/replicatedStates/4/participants/A".to_string())
        );
    }
}
