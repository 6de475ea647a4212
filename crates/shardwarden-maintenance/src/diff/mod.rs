//! The diff engine: Plan × Current × Local → actions.
//!
//! [`diff_plan_local`] is a pure function of its [`DiffInput`]. It looks at
//! the dirty databases only, emits at most one action per resource, and
//! never emits work for a resource the registry shows as busy. Problems with
//! individual databases or collections are returned in the [`DiffOutcome`]
//! instead of failing the round.

mod replicated;
mod shards;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use shardwarden_core::ServerId;
use shardwarden_core::fingerprint::fingerprint;

use crate::action::{ActionDescription, ActionKind, Priority, ResourceKey, params};
use crate::current::DatabaseCurrent;
use crate::error::{Error, Result};
use crate::errors::{ErrorKey, PriorErrors};
use crate::local::LocalSnapshot;
use crate::plan::DatabasePlan;
use crate::registry::ShardActionMap;
use crate::replication::{ReplicatedLogStatusMap, ReplicatedStateStatusMap};

pub use replicated::{StateDiff, diff_replicated_logs, diff_replicated_states};

/// The database every server keeps regardless of the Plan.
pub const SYSTEM_DATABASE: &str = "_system";

/// Everything one diff round looks at.
#[derive(Debug, Clone, Copy)]
pub struct DiffInput<'a> {
    /// The Plan tree (database → fragment).
    pub plan: &'a Value,
    /// Index of the Plan read.
    pub plan_index: u64,
    /// The Current tree (database → fragment).
    pub current: &'a Value,
    /// Index of the Current read.
    pub current_index: u64,
    /// Databases to look at this round.
    pub dirty: &'a BTreeSet<String>,
    /// What this server hosts.
    pub local: &'a LocalSnapshot,
    /// This server.
    pub server_id: &'a ServerId,
    /// Failures remembered from earlier rounds.
    pub prior_errors: &'a PriorErrors,
    /// Actions in flight or failed, per resource.
    pub shard_actions: &'a ShardActionMap,
    /// Local replicated log status.
    pub log_status: &'a ReplicatedLogStatusMap,
    /// Local replicated state status.
    pub state_status: &'a ReplicatedStateStatusMap,
    /// Window during which a fatal error excludes its resource.
    pub error_cooldown: Duration,
    /// Reference time for the cooldown.
    pub now: DateTime<Utc>,
}

/// A standing error for one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionError {
    /// Database name.
    pub database: String,
    /// Collection id.
    pub collection: String,
    /// Error description.
    pub message: String,
    /// Whether the error is a `distributeShardsLike` cycle.
    pub cycle: bool,
}

/// What a diff round produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffOutcome {
    /// Actions to submit, in emission order.
    pub actions: Vec<ActionDescription>,
    /// Databases to look at again next round.
    pub make_dirty: BTreeSet<String>,
    /// Set when an error excluded work and should be reported promptly.
    pub call_notify: bool,
    /// Databases whose Plan fragment could not be parsed.
    pub database_errors: BTreeMap<String, String>,
    /// Collections with cycles or dangling prototypes.
    pub collection_errors: Vec<CollectionError>,
    /// Error entries whose resource is now in the planned state.
    pub resolved: Vec<ErrorKey>,
    /// Resources found in sync; failed registry entries on them can go.
    pub in_sync: Vec<ResourceKey>,
    /// Databases gone from both Plan and this server; their errors can go.
    pub forgotten_databases: BTreeSet<String>,
    /// Candidates dropped because the same work is already active.
    pub suppressed: usize,
    /// Candidates postponed because other work holds the resource.
    pub deferred: usize,
    /// Candidates held back by a prior fatal error.
    pub excluded: usize,
}

/// Collects actions while enforcing per-resource exclusivity.
pub(crate) struct Emitter<'a> {
    input: &'a DiffInput<'a>,
    outcome: DiffOutcome,
    claimed: BTreeSet<ResourceKey>,
}

impl<'a> Emitter<'a> {
    fn new(input: &'a DiffInput<'a>) -> Self {
        Self {
            input,
            outcome: DiffOutcome::default(),
            claimed: BTreeSet::new(),
        }
    }

    pub(crate) fn input(&self) -> &'a DiffInput<'a> {
        self.input
    }

    /// Offers `action`; returns `true` if it was emitted.
    pub(crate) fn emit(&mut self, action: ActionDescription) -> bool {
        let key = action.resource().clone();
        let database = key.database_name().to_string();

        if self.claimed.contains(&key) {
            self.outcome.deferred += 1;
            self.outcome.make_dirty.insert(database);
            return false;
        }
        match self.input.shard_actions.active_kind(&key) {
            Some(kind) if kind == action.kind() => {
                tracing::trace!(%action, "same action already active");
                self.outcome.suppressed += 1;
                false
            }
            Some(kind) => {
                tracing::debug!(%action, active = %kind, "resource busy, deferring");
                self.outcome.deferred += 1;
                self.outcome.make_dirty.insert(database);
                false
            }
            None => {
                tracing::debug!(%action, "emitting action");
                self.claimed.insert(key);
                self.outcome.actions.push(action);
                true
            }
        }
    }

    /// Emits the first of `steps` and defers the rest to a later round.
    pub(crate) fn emit_first(&mut self, steps: Vec<ActionDescription>) {
        let mut steps = steps.into_iter();
        let Some(first) = steps.next() else {
            return;
        };
        let database = first.database().to_string();
        self.emit(first);
        if steps.next().is_some() {
            self.outcome.make_dirty.insert(database);
        }
    }

    /// Returns `true` (and records the exclusion) if a prior fatal error on
    /// `key` still applies to the Plan with `plan_fingerprint`.
    pub(crate) fn excluded_by_error(&mut self, key: &ErrorKey, plan_fingerprint: &str) -> bool {
        let blocked = self.input.prior_errors.get(key).is_some_and(|entry| {
            entry.blocks(plan_fingerprint, self.input.now, self.input.error_cooldown)
        });
        if blocked {
            tracing::debug!(?key, "excluded by prior error");
            self.outcome.excluded += 1;
            self.outcome.call_notify = true;
        }
        blocked
    }

    /// Counts a postponed candidate and looks at `database` again next round.
    pub(crate) fn defer(&mut self, database: &str) {
        self.outcome.deferred += 1;
        self.mark_dirty(database);
    }

    pub(crate) fn forget_database(&mut self, database: &str) {
        self.outcome.forgotten_databases.insert(database.to_string());
    }

    pub(crate) fn mark_dirty(&mut self, database: &str) {
        self.outcome.make_dirty.insert(database.to_string());
    }

    pub(crate) fn resolve(&mut self, key: ErrorKey) {
        self.outcome.resolved.push(key);
    }

    pub(crate) fn in_sync(&mut self, key: ResourceKey) {
        self.outcome.in_sync.push(key);
    }

    pub(crate) fn collection_error(&mut self, error: CollectionError) {
        self.outcome.collection_errors.push(error);
    }

    fn database_error(&mut self, database: &str, message: String) {
        self.outcome
            .database_errors
            .insert(database.to_string(), message);
    }

    fn finish(self) -> DiffOutcome {
        self.outcome
    }
}

/// Compares Plan and Current with the local state of the dirty databases.
///
/// # Errors
///
/// Returns [`Error::MalformedPlan`] if the Plan root is not an object. Any
/// other problem is scoped to its database or collection and reported in
/// the outcome.
#[tracing::instrument(
    skip(input),
    fields(
        server = %input.server_id,
        plan_index = input.plan_index,
        current_index = input.current_index,
        dirty = input.dirty.len(),
    )
)]
pub fn diff_plan_local(input: &DiffInput<'_>) -> Result<DiffOutcome> {
    let Some(plan) = input.plan.as_object() else {
        return Err(Error::malformed_plan("plan root is not an object"));
    };

    let mut emitter = Emitter::new(input);
    for database in input.dirty {
        let local_db = input.local.database(database);

        let Some(plan_value) = plan.get(database) else {
            if database == SYSTEM_DATABASE {
                continue;
            }
            if local_db.is_none() {
                emitter.forget_database(database);
                continue;
            }
            if let Some((key, kind)) = input.shard_actions.active_within(database) {
                tracing::debug!(%database, resource = %key, active = %kind, "drop waits for work inside the database");
                emitter.defer(database);
                continue;
            }
            emitter.emit(ActionDescription::for_database(
                ActionKind::DropDatabase,
                database.clone(),
            ));
            continue;
        };

        let db_plan = match DatabasePlan::from_value(plan_value) {
            Ok(db_plan) => db_plan,
            Err(message) => {
                tracing::warn!(%database, %message, "skipping malformed plan entry");
                emitter.database_error(database, message);
                continue;
            }
        };

        let database_key = ErrorKey::Database {
            database: database.clone(),
        };
        let Some(local_db) = local_db else {
            let plan_fingerprint = fingerprint(Some(plan_value));
            if !emitter.excluded_by_error(&database_key, &plan_fingerprint) {
                emitter.emit(
                    ActionDescription::for_database(ActionKind::CreateDatabase, database.clone())
                        .with_priority(Priority::HIGHER)
                        .with_parameter(params::PLAN_FINGERPRINT, plan_fingerprint),
                );
            }
            // Collections follow once the database exists.
            emitter.mark_dirty(database);
            continue;
        };
        emitter.resolve(database_key);
        emitter.in_sync(ResourceKey::database(database.clone()));

        if input
            .shard_actions
            .is_active(&ResourceKey::database(database.clone()))
        {
            emitter.mark_dirty(database);
            continue;
        }

        let current_db = DatabaseCurrent::from_value_lossy(
            input.current.as_object().and_then(|c| c.get(database)),
        );
        shards::diff_collections(
            &mut emitter,
            database,
            plan_value,
            &db_plan,
            local_db,
            &current_db,
        )?;
        let local_logs = input.log_status.get(database);
        for action in diff_replicated_logs(input.server_id, database, &db_plan, local_logs) {
            emitter.emit(action);
        }
        let states = diff_replicated_states(
            input.server_id,
            database,
            &db_plan,
            local_logs,
            input.state_status.get(database),
        );
        if states.waiting_for_log {
            emitter.mark_dirty(database);
        }
        for action in states.actions {
            emitter.emit(action);
        }
    }

    let outcome = emitter.finish();
    tracing::debug!(
        actions = outcome.actions.len(),
        suppressed = outcome.suppressed,
        deferred = outcome.deferred,
        excluded = outcome.excluded,
        "diff complete"
    );
    Ok(outcome)
}
