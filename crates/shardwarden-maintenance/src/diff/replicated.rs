//! Replicated log and replicated state diffs.
//!
//! Both compare the planned specification with the cheap local status the
//! replication coordinator reports and emit `UpdateReplicatedLog` /
//! `UpdateReplicatedState` actions carrying the planned specification.

use std::collections::BTreeMap;

use shardwarden_core::{LogId, ServerId};

use crate::action::{ActionDescription, ActionKind, params};
use crate::executor::operations;
use crate::plan::DatabasePlan;
use crate::replication::{QuickLogStatus, StateStatus};

fn log_action(
    kind: ActionKind,
    database: &str,
    id: LogId,
    operation: &str,
    spec: Option<serde_json::Value>,
) -> ActionDescription {
    let action = ActionDescription::for_log(kind, database, id)
        .with_parameter(params::OPERATION, operation);
    match spec {
        Some(spec) => action.with_properties(spec),
        None => action,
    }
}

/// Diffs the planned replicated logs of `database` against the local ones.
///
/// A planned log this server participates in is created when missing and
/// updated when the local term or participants generation lags behind. A
/// local log that is no longer planned here is dropped.
#[must_use]
pub fn diff_replicated_logs(
    server_id: &ServerId,
    database: &str,
    plan: &DatabasePlan,
    local: Option<&BTreeMap<LogId, QuickLogStatus>>,
) -> Vec<ActionDescription> {
    let mut actions = Vec::new();

    for (id, spec) in &plan.replicated_logs {
        if !spec.has_participant(server_id) {
            continue;
        }
        let operation = match local.and_then(|logs| logs.get(id)) {
            None => operations::CREATE,
            Some(status)
                if status.term < spec.term()
                    || status.participants_generation < spec.participants_config.generation =>
            {
                operations::UPDATE
            }
            Some(_) => continue,
        };
        let Ok(payload) = serde_json::to_value(spec) else {
            continue;
        };
        actions.push(log_action(
            ActionKind::UpdateReplicatedLog,
            database,
            *id,
            operation,
            Some(payload),
        ));
    }

    for id in local.into_iter().flat_map(BTreeMap::keys) {
        let planned_here = plan
            .replicated_logs
            .get(id)
            .is_some_and(|spec| spec.has_participant(server_id));
        if !planned_here {
            actions.push(log_action(
                ActionKind::UpdateReplicatedLog,
                database,
                *id,
                operations::DROP,
                None,
            ));
        }
    }

    actions
}

/// Result of [`diff_replicated_states`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDiff {
    /// Actions to emit.
    pub actions: Vec<ActionDescription>,
    /// Some planned state is waiting for its log to exist locally.
    pub waiting_for_log: bool,
}

/// Diffs the planned replicated states of `database` against the local ones.
///
/// A state is only created once its log exists locally; until then the
/// database is reported as waiting so it is looked at again.
#[must_use]
pub fn diff_replicated_states(
    server_id: &ServerId,
    database: &str,
    plan: &DatabasePlan,
    local_logs: Option<&BTreeMap<LogId, QuickLogStatus>>,
    local_states: Option<&BTreeMap<LogId, StateStatus>>,
) -> StateDiff {
    let mut diff = StateDiff::default();

    for (id, spec) in &plan.replicated_states {
        let Some(planned_generation) = spec.generation_for(server_id) else {
            continue;
        };
        let operation = match local_states.and_then(|states| states.get(id)) {
            None => {
                if !local_logs.is_some_and(|logs| logs.contains_key(id)) {
                    diff.waiting_for_log = true;
                    continue;
                }
                operations::CREATE
            }
            Some(status) if status.generation < planned_generation => operations::UPDATE,
            Some(_) => continue,
        };
        let Ok(payload) = serde_json::to_value(spec) else {
            continue;
        };
        diff.actions.push(log_action(
            ActionKind::UpdateReplicatedState,
            database,
            *id,
            operation,
            Some(payload),
        ));
    }

    for id in local_states.into_iter().flat_map(BTreeMap::keys) {
        let planned_here = plan
            .replicated_states
            .get(id)
            .is_some_and(|spec| spec.generation_for(server_id).is_some());
        if !planned_here {
            diff.actions.push(log_action(
                ActionKind::UpdateReplicatedState,
                database,
                *id,
                operations::DROP,
                None,
            ));
        }
    }

    diff
}
