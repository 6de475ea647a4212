//! Two-track action scheduler.
//!
//! Actions wait in one of two priority queues. Fast-track work (database
//! and shard lifecycle, leadership changes, replicated logs) is never stuck
//! behind slow-track work (index builds, follower synchronization): worker 0
//! only takes slow-track work whose priority is above `SLOW_OP`, so a long
//! resumed operation can never occupy every worker.
//!
//! Within a track, higher priority runs first and equal priorities run in
//! submission order.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::Utc;
use shardwarden_core::{ActionId, ServerId};
use shardwarden_core::observability::action_span;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::action::{ActionDescription, ActionKind, Priority, ResourceKey, Track, params};
use crate::config::MaintenanceConfig;
use crate::error::{Error, Result};
use crate::errors::{ERROR_NUM_RETRIES_EXHAUSTED, ErrorEntry, ErrorKey, ErrorLedger};
use crate::executor::{ExecutionContext, ExecutionOutcome, ExecutorRegistry};
use crate::metrics::MaintenanceMetrics;
use crate::registry::{ActionRegistry, Activation, Completion};
use crate::storage::OperationBudget;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("scheduler lock poisoned")
}

/// Databases that need another look, shared between the scheduler and the
/// maintenance loop.
#[derive(Debug, Default)]
pub struct DirtyTracker {
    databases: Mutex<BTreeSet<String>>,
}

impl DirtyTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `database` dirty.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn mark(&self, database: impl Into<String>) -> Result<()> {
        self.databases
            .lock()
            .map_err(poison_err)?
            .insert(database.into());
        Ok(())
    }

    /// Marks every database in `databases` dirty.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn mark_all<I>(&self, databases: I) -> Result<()>
    where
        I: IntoIterator<Item = String>,
    {
        self.databases.lock().map_err(poison_err)?.extend(databases);
        Ok(())
    }

    /// Returns and clears the dirty set.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn take(&self) -> Result<BTreeSet<String>> {
        Ok(std::mem::take(
            &mut *self.databases.lock().map_err(poison_err)?,
        ))
    }
}

/// What a worker may take from the queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerRole {
    /// Any work.
    General,
    /// Anything except `SLOW_OP` work.
    NonSlow,
}

#[derive(Debug)]
struct Queued {
    priority: Priority,
    seq: u64,
    action: ActionDescription,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: higher priority first, then lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct Queues {
    fast: BinaryHeap<Queued>,
    slow: BinaryHeap<Queued>,
    seq: u64,
    running: BTreeMap<ActionId, ResourceKey>,
    closed: bool,
}

impl Queues {
    fn push(&mut self, action: ActionDescription) {
        self.seq += 1;
        let queued = Queued {
            priority: action.priority(),
            seq: self.seq,
            action,
        };
        match queued.action.track() {
            Track::Fast => self.fast.push(queued),
            Track::Slow => self.slow.push(queued),
        }
    }

    fn pop(&mut self, role: WorkerRole) -> Option<ActionDescription> {
        if self.closed {
            return None;
        }
        let fast = self.fast.peek().map(|q| q.priority);
        let slow = self.slow.peek().map(|q| q.priority);
        let take_slow = match role {
            WorkerRole::General => match (fast, slow) {
                (Some(f), Some(s)) => s > f,
                (None, Some(_)) => true,
                _ => false,
            },
            WorkerRole::NonSlow => fast.is_none() && slow.is_some_and(|s| s > Priority::SLOW_OP),
        };
        let queued = if take_slow {
            self.slow.pop()
        } else {
            self.fast.pop()
        }?;
        self.running
            .insert(queued.action.id(), queued.action.resource().clone());
        Some(queued.action)
    }

    fn is_idle(&self) -> bool {
        self.fast.is_empty() && self.slow.is_empty() && self.running.is_empty()
    }
}

/// Result of [`Scheduler::submit`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitReport {
    /// Actions queued.
    pub accepted: usize,
    /// Actions refused because their resource is busy.
    pub rejected: usize,
}

/// Result of [`Scheduler::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Queued actions dropped without running.
    pub abandoned: usize,
    /// Running actions cut off when the grace period ran out.
    pub aborted: usize,
    /// Whether running actions outlived the grace period.
    pub timed_out: bool,
}

struct Inner {
    config: MaintenanceConfig,
    server_id: ServerId,
    executors: ExecutorRegistry,
    registry: Arc<ActionRegistry>,
    ledger: Arc<ErrorLedger>,
    dirty: Arc<DirtyTracker>,
    metrics: MaintenanceMetrics,
    queues: Mutex<Queues>,
    work: Notify,
    idle: Notify,
    completions: Arc<Notify>,
    shutdown: watch::Sender<bool>,
}

/// Runs actions on a fixed pool of worker tasks.
pub struct Scheduler {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("server_id", &self.inner.server_id)
            .field("worker_threads", &self.inner.config.worker_threads)
            .finish_non_exhaustive()
    }
}

/// Shared handles the scheduler works with.
#[derive(Debug, Clone)]
pub struct SchedulerParts {
    /// This server.
    pub server_id: ServerId,
    /// Executors by kind.
    pub executors: ExecutorRegistry,
    /// Registry of active actions.
    pub registry: Arc<ActionRegistry>,
    /// Ledger that records failures.
    pub ledger: Arc<ErrorLedger>,
    /// Databases to revisit after an action finishes.
    pub dirty: Arc<DirtyTracker>,
    /// Metrics recorder.
    pub metrics: MaintenanceMetrics,
}

impl Scheduler {
    /// Spawns `config.worker_threads` workers on the current runtime.
    ///
    /// Worker 0 never runs `SLOW_OP` work.
    #[must_use]
    pub fn start(config: MaintenanceConfig, parts: SchedulerParts) -> Self {
        let (shutdown, _) = watch::channel(false);
        let worker_count = config
            .worker_threads
            .max(crate::config::MIN_WORKER_THREADS);
        let inner = Arc::new(Inner {
            config,
            server_id: parts.server_id,
            executors: parts.executors,
            registry: parts.registry,
            ledger: parts.ledger,
            dirty: parts.dirty,
            metrics: parts.metrics,
            queues: Mutex::new(Queues::default()),
            work: Notify::new(),
            idle: Notify::new(),
            completions: Arc::new(Notify::new()),
            shutdown,
        });

        let workers = (0..worker_count)
            .map(|index| {
                let role = if index == 0 {
                    WorkerRole::NonSlow
                } else {
                    WorkerRole::General
                };
                let inner = Arc::clone(&inner);
                let shutdown = inner.shutdown.subscribe();
                tokio::spawn(worker_loop(inner, role, shutdown))
            })
            .collect();
        tracing::info!(workers = worker_count, "scheduler started");

        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Registers and queues `actions`.
    ///
    /// Actions whose resource already has an active action are refused.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShuttingDown`] after [`Scheduler::shutdown`] began, or
    /// an error if an internal lock is poisoned.
    pub fn submit(&self, actions: Vec<ActionDescription>) -> Result<SubmitReport> {
        let mut report = SubmitReport::default();
        {
            let mut queues = self.inner.lock_queues()?;
            if queues.closed {
                return Err(Error::ShuttingDown);
            }
            for action in actions {
                match self.inner.registry.try_activate(&action)? {
                    Activation::Accepted => {
                        self.inner.metrics.record_emitted(action.kind().as_label());
                        queues.push(action);
                        report.accepted += 1;
                    }
                    Activation::RejectedBecauseActive {
                        active_id,
                        active_kind,
                    } => {
                        tracing::debug!(%action, %active_id, %active_kind, "resource busy");
                        report.rejected += 1;
                    }
                }
            }
        }
        if report.rejected > 0 {
            self.inner.metrics.record_skipped("busy", report.rejected);
        }
        self.inner.publish_depth()?;
        self.inner.work.notify_waiters();
        Ok(report)
    }

    /// Returns `true` if nothing is queued or running.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn is_idle(&self) -> Result<bool> {
        Ok(self.inner.lock_queues()?.is_idle())
    }

    /// Waits until nothing is queued or running.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub async fn wait_idle(&self) -> Result<()> {
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.is_idle()? {
                return Ok(());
            }
            idle.await;
        }
    }

    /// Returns the notifier signalled whenever an action finishes.
    #[must_use]
    pub fn completions(&self) -> Arc<Notify> {
        Arc::clone(&self.inner.completions)
    }

    /// Stops accepting work, waits up to the grace period for running
    /// actions, and drops whatever is still queued.
    ///
    /// # Errors
    ///
    /// Returns an error if an internal lock is poisoned.
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        let queued = {
            let mut queues = self.inner.lock_queues()?;
            queues.closed = true;
            let mut queued: Vec<ActionDescription> =
                queues.fast.drain().map(|q| q.action).collect();
            queued.extend(queues.slow.drain().map(|q| q.action));
            queued
        };
        // Receivers may all be gone already; nothing to tell then.
        let _ = self.inner.shutdown.send(true);
        self.inner.work.notify_waiters();

        let mut report = ShutdownReport::default();
        for action in &queued {
            if self.inner.registry.abandon(action.resource(), action.id())? {
                report.abandoned += 1;
            }
        }

        let handles = std::mem::take(&mut *self.workers.lock().map_err(poison_err)?);
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let grace = self.inner.config.shutdown_grace;
        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!(?grace, "running actions outlived the shutdown grace period");
            for abort in aborts {
                abort.abort();
            }
            report.timed_out = true;
            let aborted = std::mem::take(&mut self.inner.lock_queues()?.running);
            for (id, key) in &aborted {
                if self.inner.registry.abandon(key, *id)? {
                    report.aborted += 1;
                }
            }
        }
        self.inner.publish_depth()?;
        tracing::info!(abandoned = report.abandoned, "scheduler stopped");
        Ok(report)
    }
}

async fn worker_loop(inner: Arc<Inner>, role: WorkerRole, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let work = inner.work.notified();
        tokio::pin!(work);
        work.as_mut().enable();

        let next = match inner.lock_queues() {
            Ok(mut queues) => queues.pop(role),
            Err(err) => {
                tracing::error!(error = %err, "worker stopping");
                break;
            }
        };
        match next {
            Some(action) => {
                if let Err(err) = inner.publish_depth() {
                    tracing::warn!(error = %err, "queue depth not published");
                }
                let id = action.id();
                inner.run(action).await;
                inner.finish_one(id);
            }
            None => {
                tokio::select! {
                    () = &mut work => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

/// The ledger entry an action's failure is recorded under.
fn error_key(action: &ActionDescription) -> Option<ErrorKey> {
    match action.resource() {
        ResourceKey::Database { database } => Some(ErrorKey::Database {
            database: database.clone(),
        }),
        ResourceKey::Shard { database, shard } => {
            let index_id = matches!(action.kind(), ActionKind::EnsureIndex | ActionKind::DropIndex)
                .then(|| action.parameter(params::INDEX_ID))
                .flatten();
            Some(match index_id {
                Some(index_id) => ErrorKey::Index {
                    database: database.clone(),
                    shard: shard.clone(),
                    index_id: index_id.to_string(),
                },
                None => ErrorKey::Shard {
                    database: database.clone(),
                    shard: shard.clone(),
                },
            })
        }
        ResourceKey::Log { .. } => None,
    }
}

impl Inner {
    fn lock_queues(&self) -> Result<MutexGuard<'_, Queues>> {
        self.queues.lock().map_err(poison_err)
    }

    fn publish_depth(&self) -> Result<()> {
        let queues = self.lock_queues()?;
        self.metrics
            .set_queue_depth(Track::Fast.as_label(), queues.fast.len());
        self.metrics
            .set_queue_depth(Track::Slow.as_label(), queues.slow.len());
        Ok(())
    }

    fn requeue(&self, action: ActionDescription) -> Result<()> {
        let mut queues = self.lock_queues()?;
        if queues.closed {
            tracing::info!(%action, "scheduler stopped, dropping resubmission");
            self.registry.abandon(action.resource(), action.id())?;
            return Ok(());
        }
        queues.push(action);
        drop(queues);
        self.work.notify_waiters();
        Ok(())
    }

    fn finish_one(&self, id: ActionId) {
        let idle = match self.lock_queues() {
            Ok(mut queues) => {
                queues.running.remove(&id);
                queues.is_idle()
            }
            Err(_) => false,
        };
        self.completions.notify_one();
        if idle {
            self.idle.notify_waiters();
        }
    }

    async fn run(&self, action: ActionDescription) {
        let span = action_span(
            action.kind().as_label(),
            action.database(),
            &action.resource().to_string(),
            &action.id().to_string(),
        );
        if let Err(err) = self.run_inner(&action).instrument(span).await {
            tracing::error!(error = %err, %action, "action bookkeeping failed");
        }
    }

    async fn run_inner(&self, action: &ActionDescription) -> Result<()> {
        let key = action.resource();
        let id = action.id();
        let entry = self.registry.mark_running(key, id)?;

        let budget = if action.priority() == Priority::SLOW_OP {
            OperationBudget::unlimited()
        } else {
            OperationBudget::with_limit(self.config.slow_op_threshold)
        };
        let ctx = ExecutionContext {
            server_id: self.server_id.clone(),
            budget,
        };

        tracing::debug!(attempt = entry.attempts, "executing");
        let started = Instant::now();
        let outcome = self.executors.execute(&ctx, action).await;
        self.metrics.record_finished(
            action.kind().as_label(),
            outcome.as_label(),
            started.elapsed(),
        );

        match outcome {
            ExecutionOutcome::Succeeded => {
                self.registry.complete(key, id, Completion::Succeeded)?;
                if let Some(error_key) = error_key(action) {
                    self.ledger.clear(&error_key)?;
                }
                tracing::info!("action succeeded");
            }
            ExecutionOutcome::RequeueAsSlow => {
                let resubmission = self.registry.requeue_as_slow(key, id)?;
                tracing::info!("action yielded, continuing at SLOW_OP");
                self.requeue(resubmission)?;
                return Ok(());
            }
            ExecutionOutcome::Retryable { message } if entry.attempts <= self.config.retry_budget => {
                tracing::warn!(%message, attempt = entry.attempts, "retrying action");
                self.registry.record_retry(key, id, &message)?;
                self.requeue(entry.action)?;
                return Ok(());
            }
            ExecutionOutcome::Retryable { message } => {
                tracing::error!(%message, attempts = entry.attempts, "retries exhausted");
                self.fail(action, ERROR_NUM_RETRIES_EXHAUSTED, message, false)?;
            }
            ExecutionOutcome::Fatal { code, message } => {
                tracing::error!(%message, code, "action failed");
                self.fail(action, code, message, true)?;
            }
        }
        self.dirty.mark(action.database())?;
        Ok(())
    }

    fn fail(
        &self,
        action: &ActionDescription,
        code: u64,
        message: String,
        fatal: bool,
    ) -> Result<()> {
        self.registry.complete(
            action.resource(),
            action.id(),
            Completion::Failed {
                message: message.clone(),
            },
        )?;
        if let Some(key) = error_key(action) {
            self.ledger.record(
                key,
                ErrorEntry {
                    message,
                    error_num: code,
                    fatal,
                    plan_fingerprint: action
                        .parameter(params::PLAN_FINGERPRINT)
                        .map(str::to_string),
                    recorded_at: Utc::now(),
                },
            )?;
        }
        Ok(())
    }
}
