//! Executors for replicated log and replicated state actions.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::{ActionExecutor, ExecutionContext, ExecutionOutcome};
use crate::action::{ActionDescription, ActionKind, params};
use crate::replication::{ReplicationCoordinator, SupervisionAction};

/// Operation values carried in [`params::OPERATION`].
pub mod operations {
    /// Create the log or state.
    pub const CREATE: &str = "create";
    /// Reconfigure the log or state.
    pub const UPDATE: &str = "update";
    /// Remove the log or state.
    pub const DROP: &str = "drop";
}

fn spec_of<T: DeserializeOwned>(action: &ActionDescription) -> Result<T, ExecutionOutcome> {
    let properties = action
        .properties()
        .ok_or_else(|| ExecutionOutcome::bad_action(format!("{action} has no specification")))?;
    serde_json::from_value(properties.clone())
        .map_err(|e| ExecutionOutcome::bad_action(format!("invalid specification: {e}")))
}

async fn apply(
    replication: &dyn ReplicationCoordinator,
    action: &ActionDescription,
    supervision: SupervisionAction,
) -> ExecutionOutcome {
    match replication
        .apply_supervision_action(action.database(), supervision)
        .await
    {
        Ok(()) => ExecutionOutcome::Succeeded,
        Err(e) => ExecutionOutcome::Retryable {
            message: e.to_string(),
        },
    }
}

/// Creates, reconfigures or drops a local replicated log.
#[derive(Clone)]
pub struct UpdateReplicatedLogExecutor {
    replication: Arc<dyn ReplicationCoordinator>,
}

impl UpdateReplicatedLogExecutor {
    /// Creates the executor.
    #[must_use]
    pub fn new(replication: Arc<dyn ReplicationCoordinator>) -> Self {
        Self { replication }
    }

    fn supervision_action(action: &ActionDescription) -> Result<SupervisionAction, ExecutionOutcome> {
        let Some(id) = action.log_id() else {
            return Err(ExecutionOutcome::bad_action(format!("{action} has no log id")));
        };
        match action.parameter(params::OPERATION) {
            Some(operations::CREATE) => Ok(SupervisionAction::CreateLog {
                spec: spec_of(action)?,
            }),
            Some(operations::UPDATE) => Ok(SupervisionAction::UpdateLog {
                spec: spec_of(action)?,
            }),
            Some(operations::DROP) => Ok(SupervisionAction::DropLog { id }),
            other => Err(ExecutionOutcome::bad_action(format!(
                "unknown log operation {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl ActionExecutor for UpdateReplicatedLogExecutor {
    fn kind(&self) -> ActionKind {
        ActionKind::UpdateReplicatedLog
    }

    async fn execute(&self, _ctx: &ExecutionContext, action: &ActionDescription) -> ExecutionOutcome {
        match Self::supervision_action(action) {
            Ok(supervision) => apply(self.replication.as_ref(), action, supervision).await,
            Err(outcome) => outcome,
        }
    }
}

/// Creates, reconfigures or drops a local replicated state.
#[derive(Clone)]
pub struct UpdateReplicatedStateExecutor {
    replication: Arc<dyn ReplicationCoordinator>,
}

impl UpdateReplicatedStateExecutor {
    /// Creates the executor.
    #[must_use]
    pub fn new(replication: Arc<dyn ReplicationCoordinator>) -> Self {
        Self { replication }
    }

    fn supervision_action(action: &ActionDescription) -> Result<SupervisionAction, ExecutionOutcome> {
        let Some(id) = action.log_id() else {
            return Err(ExecutionOutcome::bad_action(format!("{action} has no log id")));
        };
        match action.parameter(params::OPERATION) {
            Some(operations::CREATE) => Ok(SupervisionAction::CreateState {
                spec: spec_of(action)?,
            }),
            Some(operations::UPDATE) => Ok(SupervisionAction::UpdateState {
                spec: spec_of(action)?,
            }),
            Some(operations::DROP) => Ok(SupervisionAction::DropState { id }),
            other => Err(ExecutionOutcome::bad_action(format!(
                "unknown state operation {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl ActionExecutor for UpdateReplicatedStateExecutor {
    fn kind(&self) -> ActionKind {
        ActionKind::UpdateReplicatedState
    }

    async fn execute(&self, _ctx: &ExecutionContext, action: &ActionDescription) -> ExecutionOutcome {
        match Self::supervision_action(action) {
            Ok(supervision) => apply(self.replication.as_ref(), action, supervision).await,
            Err(outcome) => outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::InMemoryReplicationCoordinator;
    use crate::storage::OperationBudget;
    use serde_json::json;
    use shardwarden_core::{LogId, ServerId};

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            server_id: ServerId::new("A").unwrap(),
            budget: OperationBudget::unlimited(),
        }
    }

    #[tokio::test]
    async fn log_then_state_are_created() {
        let coordinator = Arc::new(InMemoryReplicationCoordinator::new(ServerId::new("A").unwrap()));
        let logs = UpdateReplicatedLogExecutor::new(coordinator.clone());
        let states = UpdateReplicatedStateExecutor::new(coordinator.clone());

        let create_log = ActionDescription::for_log(ActionKind::UpdateReplicatedLog, "db", LogId::new(3))
            .with_parameter(params::OPERATION, operations::CREATE)
            .with_properties(json!({
                "id": 3,
                "currentTerm": { "term": 1, "leader": "A" },
                "participantsConfig": { "generation": 1, "participants": { "A": {} } }
            }));
        assert_eq!(logs.execute(&ctx(), &create_log).await, ExecutionOutcome::Succeeded);

        let create_state =
            ActionDescription::for_log(ActionKind::UpdateReplicatedState, "db", LogId::new(3))
                .with_parameter(params::OPERATION, operations::CREATE)
                .with_properties(json!({ "id": 3, "generation": 1, "participants": { "A": { "generation": 1 } } }));
        assert_eq!(states.execute(&ctx(), &create_state).await, ExecutionOutcome::Succeeded);
        assert_eq!(coordinator.applied().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn state_without_log_is_retryable() {
        let coordinator = Arc::new(InMemoryReplicationCoordinator::new(ServerId::new("A").unwrap()));
        let states = UpdateReplicatedStateExecutor::new(coordinator);
        let action = ActionDescription::for_log(ActionKind::UpdateReplicatedState, "db", LogId::new(3))
            .with_parameter(params::OPERATION, operations::CREATE)
            .with_properties(json!({ "id": 3, "generation": 1 }));
        assert!(matches!(
            states.execute(&ctx(), &action).await,
            ExecutionOutcome::Retryable { .. }
        ));
    }

    #[tokio::test]
    async fn unknown_operation_is_fatal() {
        let coordinator = Arc::new(InMemoryReplicationCoordinator::new(ServerId::new("A").unwrap()));
        let logs = UpdateReplicatedLogExecutor::new(coordinator);
        let action = ActionDescription::for_log(ActionKind::UpdateReplicatedLog, "db", LogId::new(3))
            .with_parameter(params::OPERATION, "explode");
        assert!(matches!(
            logs.execute(&ctx(), &action).await,
            ExecutionOutcome::Fatal { .. }
        ));
    }
}
