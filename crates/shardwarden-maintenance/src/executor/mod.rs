//! Action executors: one handler per [`ActionKind`], behind a uniform trait.
//!
//! Executors never panic and never return `Err`; every failure is an
//! [`ExecutionOutcome`] the scheduler knows how to handle.

mod replicated;
mod shard;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use shardwarden_core::ServerId;

use crate::action::{ActionDescription, ActionKind};
use crate::replication::ReplicationCoordinator;
use crate::storage::{EngineError, EngineProgress, OperationBudget, StorageEngine};

pub use replicated::{UpdateReplicatedLogExecutor, UpdateReplicatedStateExecutor, operations};
pub use shard::{
    CreateDatabaseExecutor, CreateShardExecutor, DropDatabaseExecutor, DropIndexExecutor,
    DropShardExecutor, EnsureIndexExecutor, ResignShardLeadershipExecutor,
    SynchronizeShardExecutor, TakeoverShardLeadershipExecutor,
};

/// Error number for an action that cannot be interpreted.
pub const ERROR_NUM_BAD_ACTION: u64 = 1_473;

/// Result of executing an action once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The work is done.
    Succeeded,
    /// The work yielded; resubmit on the slow track at `SLOW_OP`.
    RequeueAsSlow,
    /// The work failed but may succeed when retried.
    Retryable {
        /// Description of the failure.
        message: String,
    },
    /// The work failed and will keep failing for this Plan.
    Fatal {
        /// Numeric error code.
        code: u64,
        /// Description of the failure.
        message: String,
    },
}

impl ExecutionOutcome {
    /// Returns the label used in logs and metrics.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::RequeueAsSlow => "requeued_as_slow",
            Self::Retryable { .. } => "retryable",
            Self::Fatal { .. } => "fatal",
        }
    }

    fn bad_action(message: impl Into<String>) -> Self {
        Self::Fatal {
            code: ERROR_NUM_BAD_ACTION,
            message: message.into(),
        }
    }
}

impl From<EngineError> for ExecutionOutcome {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Retryable { message } => Self::Retryable { message },
            EngineError::Fatal { code, message } => Self::Fatal { code, message },
        }
    }
}

impl From<EngineProgress> for ExecutionOutcome {
    fn from(progress: EngineProgress) -> Self {
        match progress {
            EngineProgress::Done => Self::Succeeded,
            EngineProgress::Yielded => Self::RequeueAsSlow,
        }
    }
}

fn outcome_of<T: Into<ExecutionOutcome>>(result: Result<T, EngineError>) -> ExecutionOutcome {
    match result {
        Ok(value) => value.into(),
        Err(err) => err.into(),
    }
}

impl From<()> for ExecutionOutcome {
    fn from((): ()) -> Self {
        Self::Succeeded
    }
}

/// Per-execution context handed to executors.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// This server.
    pub server_id: ServerId,
    /// Time long operations may take before yielding.
    pub budget: OperationBudget,
}

/// Executes one kind of action.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// The kind this executor handles.
    fn kind(&self) -> ActionKind;

    /// Executes `action` once.
    async fn execute(&self, ctx: &ExecutionContext, action: &ActionDescription)
    -> ExecutionOutcome;
}

/// Table of executors keyed by kind.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<ActionKind, Arc<dyn ActionExecutor>>,
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.executors.keys().collect();
        kinds.sort();
        f.debug_struct("ExecutorRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

impl ExecutorRegistry {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the table with an executor for every kind.
    #[must_use]
    pub fn standard(
        engine: Arc<dyn StorageEngine>,
        replication: Arc<dyn ReplicationCoordinator>,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CreateDatabaseExecutor::new(engine.clone())));
        registry.register(Arc::new(DropDatabaseExecutor::new(engine.clone())));
        registry.register(Arc::new(CreateShardExecutor::new(engine.clone())));
        registry.register(Arc::new(DropShardExecutor::new(engine.clone())));
        registry.register(Arc::new(EnsureIndexExecutor::new(engine.clone())));
        registry.register(Arc::new(DropIndexExecutor::new(engine.clone())));
        registry.register(Arc::new(SynchronizeShardExecutor::new(engine.clone())));
        registry.register(Arc::new(TakeoverShardLeadershipExecutor::new(engine.clone())));
        registry.register(Arc::new(ResignShardLeadershipExecutor::new(engine)));
        registry.register(Arc::new(UpdateReplicatedLogExecutor::new(replication.clone())));
        registry.register(Arc::new(UpdateReplicatedStateExecutor::new(replication)));
        registry
    }

    /// Registers `executor` for its kind, replacing any previous one.
    pub fn register(&mut self, executor: Arc<dyn ActionExecutor>) {
        self.executors.insert(executor.kind(), executor);
    }

    /// Returns the executor for `kind`.
    #[must_use]
    pub fn get(&self, kind: ActionKind) -> Option<Arc<dyn ActionExecutor>> {
        self.executors.get(&kind).cloned()
    }

    /// Executes `action` with the matching executor.
    ///
    /// A missing executor is a fatal outcome.
    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        action: &ActionDescription,
    ) -> ExecutionOutcome {
        match self.get(action.kind()) {
            Some(executor) => executor.execute(ctx, action).await,
            None => ExecutionOutcome::bad_action(format!("no executor for {}", action.kind())),
        }
    }
}
