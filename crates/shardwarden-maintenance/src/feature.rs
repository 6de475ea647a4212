//! The maintenance control loop.
//!
//! [`MaintenanceFeature`] owns the registry, ledger, scheduler and reporter
//! of one DBServer. Each round reads Plan and Current, works out which
//! databases changed, diffs them against the local snapshot and hands the
//! resulting actions to the scheduler (phase one), then reports local truth
//! back into Current (phase two).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde_json::{Value, json};
use shardwarden_core::ServerId;
use shardwarden_core::agency::AgencyBackend;
use shardwarden_core::fingerprint::fingerprint;
use shardwarden_core::observability::maintenance_span;
use tokio::sync::{Notify, watch};
use tracing::Instrument;

use crate::config::MaintenanceConfig;
use crate::diff::{DiffInput, DiffOutcome, diff_plan_local};
use crate::error::{Error, Result};
use crate::errors::{ERROR_NUM_CYCLE, ERROR_NUM_MALFORMED, ErrorEntry, ErrorKey, ErrorLedger};
use crate::executor::ExecutorRegistry;
use crate::local::LocalSnapshot;
use crate::metrics::{MaintenanceMetrics, time_phase};
use crate::registry::ActionRegistry;
use crate::replication::ReplicationCoordinator;
use crate::reporter::{LocalFacts, Reporter, ShardStatistics};
use crate::scheduler::{DirtyTracker, Scheduler, SchedulerParts, ShutdownReport, SubmitReport};
use crate::storage::StorageEngine;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("maintenance state lock poisoned")
}

/// External collaborators of the maintenance feature.
#[derive(Clone)]
pub struct FeatureParts {
    /// This server.
    pub server_id: ServerId,
    /// Plan and Current.
    pub agency: Arc<dyn AgencyBackend>,
    /// Local storage.
    pub engine: Arc<dyn StorageEngine>,
    /// Replicated logs and states.
    pub replication: Arc<dyn ReplicationCoordinator>,
}

impl std::fmt::Debug for FeatureParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureParts")
            .field("server_id", &self.server_id)
            .finish_non_exhaustive()
    }
}

/// What phase one did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseOneReport {
    /// Plan index the round worked from.
    pub plan_index: u64,
    /// Current index the round worked from.
    pub current_index: u64,
    /// Databases diffed this round.
    pub dirty: BTreeSet<String>,
    /// Actions handed to the scheduler.
    pub submitted: SubmitReport,
    /// An error held back work and should be surfaced promptly.
    pub call_notify: bool,
}

/// What a whole round did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    /// Phase one summary.
    pub phase_one: PhaseOneReport,
    /// Statistics from phase two; `None` if the report lost every race.
    pub statistics: Option<ShardStatistics>,
}

#[derive(Debug, Default)]
struct RoundState {
    fingerprints: BTreeMap<String, String>,
    rounds: u64,
}

/// One DBServer's maintenance loop.
pub struct MaintenanceFeature {
    config: MaintenanceConfig,
    parts: FeatureParts,
    registry: Arc<ActionRegistry>,
    ledger: Arc<ErrorLedger>,
    dirty: Arc<DirtyTracker>,
    scheduler: Scheduler,
    reporter: Reporter,
    metrics: MaintenanceMetrics,
    wake: Notify,
    state: Mutex<RoundState>,
}

impl std::fmt::Debug for MaintenanceFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceFeature")
            .field("server_id", &self.parts.server_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MaintenanceFeature {
    /// Starts the feature with an executor for every action kind.
    ///
    /// Must be called inside a Tokio runtime; the scheduler's workers are
    /// spawned immediately.
    #[must_use]
    pub fn start(config: MaintenanceConfig, parts: FeatureParts) -> Self {
        let executors =
            ExecutorRegistry::standard(Arc::clone(&parts.engine), Arc::clone(&parts.replication));
        Self::start_with_executors(config, parts, executors)
    }

    /// Starts the feature with the given executors.
    #[must_use]
    pub fn start_with_executors(
        config: MaintenanceConfig,
        parts: FeatureParts,
        executors: ExecutorRegistry,
    ) -> Self {
        let metrics = MaintenanceMetrics::new();
        let registry = Arc::new(ActionRegistry::new());
        let ledger = Arc::new(ErrorLedger::new());
        let dirty = Arc::new(DirtyTracker::new());
        let scheduler = Scheduler::start(
            config.clone(),
            SchedulerParts {
                server_id: parts.server_id.clone(),
                executors,
                registry: Arc::clone(&registry),
                ledger: Arc::clone(&ledger),
                dirty: Arc::clone(&dirty),
                metrics: metrics.clone(),
            },
        );
        let reporter = Reporter::new(
            Arc::clone(&parts.agency),
            parts.server_id.clone(),
            config.report_retry_limit,
            metrics.clone(),
        );
        tracing::info!(server = %parts.server_id, "maintenance feature started");
        Self {
            config,
            parts,
            registry,
            ledger,
            dirty,
            scheduler,
            reporter,
            metrics,
            wake: Notify::new(),
            state: Mutex::new(RoundState::default()),
        }
    }

    /// Returns the action registry.
    #[must_use]
    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Returns the error ledger.
    #[must_use]
    pub fn ledger(&self) -> &ErrorLedger {
        &self.ledger
    }

    /// Returns the scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Asks the loop to start the next round now.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Marks `database` for the next round regardless of fingerprints.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn mark_dirty(&self, database: impl Into<String>) -> Result<()> {
        self.dirty.mark(database)
    }

    /// Databases whose Plan, Current or local state changed since the last
    /// round, plus databases flagged dirty, or every database on a full round.
    fn compute_dirty(
        &self,
        plan: &Value,
        current: &Value,
        local: &LocalSnapshot,
    ) -> Result<(BTreeSet<String>, BTreeMap<String, String>)> {
        let names: BTreeSet<&str> = [plan, current]
            .into_iter()
            .filter_map(Value::as_object)
            .flat_map(|tree| tree.keys().map(String::as_str))
            .chain(local.databases.keys().map(String::as_str))
            .collect();

        let fingerprints: BTreeMap<String, String> = names
            .into_iter()
            .map(|name| {
                let local_db = local
                    .database(name)
                    .and_then(|db| serde_json::to_value(db).ok());
                let observed = json!({
                    "plan": plan.get(name),
                    "current": current.get(name),
                    "local": local_db,
                });
                (name.to_string(), fingerprint(Some(&observed)))
            })
            .collect();

        let mut dirty = self.dirty.take()?;
        let state = self.state.lock().map_err(poison_err)?;
        let full_round = state.rounds % self.config.full_round_every.max(1) == 0;
        if full_round {
            tracing::debug!(round = state.rounds, "full round");
            dirty.extend(fingerprints.keys().cloned());
        } else {
            dirty.extend(
                fingerprints
                    .iter()
                    .filter(|(name, fp)| state.fingerprints.get(*name) != Some(*fp))
                    .map(|(name, _)| name.clone()),
            );
            // Databases that vanished from every source.
            dirty.extend(
                state
                    .fingerprints
                    .keys()
                    .filter(|name| !fingerprints.contains_key(*name))
                    .cloned(),
            );
        }
        Ok((dirty, fingerprints))
    }

    fn apply_outcome(&self, outcome: &DiffOutcome) -> Result<()> {
        let now = Utc::now();
        for (database, message) in &outcome.database_errors {
            self.ledger.record(
                ErrorKey::Database {
                    database: database.clone(),
                },
                ErrorEntry {
                    message: message.clone(),
                    error_num: ERROR_NUM_MALFORMED,
                    fatal: false,
                    plan_fingerprint: None,
                    recorded_at: now,
                },
            )?;
        }
        for error in &outcome.collection_errors {
            self.ledger.record(
                ErrorKey::Collection {
                    database: error.database.clone(),
                    collection: error.collection.clone(),
                },
                ErrorEntry {
                    message: error.message.clone(),
                    error_num: if error.cycle {
                        ERROR_NUM_CYCLE
                    } else {
                        ERROR_NUM_MALFORMED
                    },
                    fatal: false,
                    plan_fingerprint: None,
                    recorded_at: now,
                },
            )?;
        }
        for key in &outcome.resolved {
            self.ledger.clear(key)?;
        }
        for database in &outcome.forgotten_databases {
            self.ledger.clear_database(database)?;
        }
        for key in &outcome.in_sync {
            self.registry.clear_failed(key)?;
        }
        self.dirty.mark_all(outcome.make_dirty.iter().cloned())?;

        self.metrics.record_skipped("suppressed", outcome.suppressed);
        self.metrics.record_skipped("deferred", outcome.deferred);
        self.metrics.record_skipped("excluded", outcome.excluded);
        Ok(())
    }

    async fn phase_one_inner(&self) -> Result<(PhaseOneReport, Value)> {
        let _timer = time_phase(&self.metrics, "phase_one");
        let plan = self.parts.agency.read_plan().await?;
        let current = self.parts.agency.read_current().await?;
        let local = self.parts.engine.local_snapshot().await?;
        let log_status = self.parts.replication.local_log_status().await?;
        let state_status = self.parts.replication.local_state_status().await?;

        let (dirty, fingerprints) = self.compute_dirty(&plan.tree, &current.tree, &local)?;
        let prior_errors = self.ledger.snapshot()?;
        let shard_actions = self.registry.snapshot()?;

        let input = DiffInput {
            plan: &plan.tree,
            plan_index: plan.index,
            current: &current.tree,
            current_index: current.index,
            dirty: &dirty,
            local: &local,
            server_id: &self.parts.server_id,
            prior_errors: &prior_errors,
            shard_actions: &shard_actions,
            log_status: &log_status,
            state_status: &state_status,
            error_cooldown: self.config.error_cooldown,
            now: Utc::now(),
        };
        let outcome = match diff_plan_local(&input) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.dirty.mark_all(dirty)?;
                return Err(err);
            }
        };
        self.apply_outcome(&outcome)?;
        let submitted = self.scheduler.submit(outcome.actions)?;

        {
            let mut state = self.state.lock().map_err(poison_err)?;
            state.fingerprints = fingerprints;
            state.rounds += 1;
        }
        if outcome.call_notify {
            tracing::info!("prior errors held back work");
        }
        tracing::debug!(
            dirty = dirty.len(),
            accepted = submitted.accepted,
            rejected = submitted.rejected,
            "phase one complete"
        );

        Ok((
            PhaseOneReport {
                plan_index: plan.index,
                current_index: current.index,
                dirty,
                submitted,
                call_notify: outcome.call_notify,
            },
            plan.tree,
        ))
    }

    /// Diffs the changed databases and submits the resulting actions.
    ///
    /// When a prior error held work back, the loop is woken so the next
    /// round reports it without waiting for the poll interval.
    ///
    /// # Errors
    ///
    /// Returns an error if the agency or a local source cannot be read, if
    /// the Plan root is malformed, or if the scheduler refuses work.
    pub async fn phase_one(&self) -> Result<PhaseOneReport> {
        let span = maintenance_span("phase_one", self.parts.server_id.as_str());
        let (report, _) = self.phase_one_inner().instrument(span).await?;
        if report.call_notify {
            self.wake();
        }
        Ok(report)
    }

    /// Reports local truth for `dirty` into Current.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReportConflict`] if every attempt lost against a
    /// concurrent writer, or the error of a failed read or write.
    pub async fn phase_two(&self, plan: &Value, dirty: &BTreeSet<String>) -> Result<ShardStatistics> {
        let _timer = time_phase(&self.metrics, "phase_two");
        let local = self.parts.engine.local_snapshot().await?;
        let state_status = self.parts.replication.local_state_status().await?;
        let prior_errors = self.ledger.snapshot()?;
        self.reporter
            .phase_two(LocalFacts {
                plan,
                dirty,
                local: &local,
                prior_errors: &prior_errors,
                state_status: &state_status,
            })
            .await
    }

    /// Runs phase one and phase two once.
    ///
    /// Phase two always runs, so errors that held work back are reported in
    /// the same round.
    ///
    /// A report that keeps conflicting is logged and its databases are
    /// looked at again next round; it does not fail the round.
    ///
    /// # Errors
    ///
    /// Returns the phase one error, or a phase two read/write error.
    pub async fn run_round(&self) -> Result<RoundReport> {
        let span = maintenance_span("phase_one", self.parts.server_id.as_str());
        let (phase_one, plan) = self.phase_one_inner().instrument(span).await?;
        let statistics = match self.phase_two(&plan, &phase_one.dirty).await {
            Ok(statistics) => Some(statistics),
            Err(Error::ReportConflict { attempts }) => {
                tracing::warn!(attempts, "current report deferred to next round");
                self.dirty.mark_all(phase_one.dirty.iter().cloned())?;
                None
            }
            Err(err) => return Err(err),
        };
        Ok(RoundReport {
            phase_one,
            statistics,
        })
    }

    /// Runs rounds until `shutdown` turns `true`, then stops the scheduler.
    ///
    /// A round starts after the poll interval, on [`MaintenanceFeature::wake`],
    /// or when an action finishes. A failed round is logged and the loop
    /// carries on.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler cannot be shut down cleanly.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<ShutdownReport> {
        let completions = self.scheduler.completions();
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(err) = self.run_round().await {
                tracing::error!(error = %err, "maintenance round failed");
            }
            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval) => {}
                () = self.wake.notified() => {}
                () = completions.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        self.shutdown().await
    }

    /// Stops the scheduler; see [`Scheduler::shutdown`].
    ///
    /// # Errors
    ///
    /// Returns an error if an internal lock is poisoned.
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        tracing::info!(server = %self.parts.server_id, "maintenance feature stopping");
        self.scheduler.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use shardwarden_core::agency::MemoryAgency;

    use super::*;
    use crate::replication::InMemoryReplicationCoordinator;
    use crate::storage::{EngineError, EngineOperation, InMemoryStorageEngine};

    #[tokio::test]
    async fn held_back_work_wakes_the_loop() {
        let server_id = ServerId::new("A").unwrap();
        let engine = InMemoryStorageEngine::new();
        engine.create_database("db").await.unwrap();
        engine
            .inject_failure(
                EngineOperation::CreateShard,
                EngineError::fatal(1_200, "disk full"),
            )
            .unwrap();
        let plan = json!({ "db": { "collections": { "c1": { "shards": { "s1": ["A"] } } } } });
        let feature = MaintenanceFeature::start(
            MaintenanceConfig::default(),
            FeatureParts {
                server_id: server_id.clone(),
                agency: Arc::new(MemoryAgency::new(plan, json!({}))),
                engine: Arc::new(engine),
                replication: Arc::new(InMemoryReplicationCoordinator::new(server_id)),
            },
        );

        let first = feature.phase_one().await.unwrap();
        assert!(!first.call_notify);
        feature.scheduler().wait_idle().await.unwrap();

        let second = feature.phase_one().await.unwrap();
        assert!(second.call_notify);
        tokio::time::timeout(Duration::from_secs(1), feature.wake.notified())
            .await
            .expect("phase one did not wake the loop");
    }
}
