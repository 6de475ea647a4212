//! Replicated log and replicated state coordination.
//!
//! The maintenance loop does not run the replication protocol itself. It
//! compares the planned log/state specifications with the local status the
//! coordinator reports, and asks the coordinator to apply supervision
//! actions (create, reconfigure, drop) where they differ.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shardwarden_core::{LogId, ServerId};

use crate::error::{Error, Result};

/// Flags of one planned log participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParticipantFlags {
    /// Must be part of every quorum.
    pub forced: bool,
    /// Counts towards write quorums.
    pub allowed_in_quorum: bool,
    /// May become leader.
    pub allowed_as_leader: bool,
}

impl Default for ParticipantFlags {
    fn default() -> Self {
        Self {
            forced: false,
            allowed_in_quorum: true,
            allowed_as_leader: true,
        }
    }
}

/// Planned participant set of a log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParticipantsConfig {
    /// Incremented on every membership change.
    pub generation: u64,
    /// Server → flags.
    pub participants: BTreeMap<String, ParticipantFlags>,
}

/// Planned term of a log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPlanTermSpecification {
    /// Term number.
    pub term: u64,
    /// Leader of the term, once elected.
    #[serde(default)]
    pub leader: Option<String>,
}

/// Planned specification of a replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPlanSpecification {
    /// Log identifier.
    pub id: LogId,
    /// Current term, absent until supervision assigned one.
    #[serde(default)]
    pub current_term: Option<LogPlanTermSpecification>,
    /// Participant set.
    #[serde(default)]
    pub participants_config: ParticipantsConfig,
}

impl LogPlanSpecification {
    /// Returns `true` if `server` participates in the log.
    #[must_use]
    pub fn has_participant(&self, server: &ServerId) -> bool {
        self.participants_config
            .participants
            .contains_key(server.as_str())
    }

    /// Returns the planned term number, zero when unassigned.
    #[must_use]
    pub fn term(&self) -> u64 {
        self.current_term.as_ref().map_or(0, |t| t.term)
    }
}

/// Planned generation of one state participant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StateParticipantPlan {
    /// Generation the participant should reach.
    pub generation: u64,
}

/// Planned specification of a replicated state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatePlanSpecification {
    /// Identifier of the underlying log.
    pub id: LogId,
    /// State generation.
    #[serde(default)]
    pub generation: u64,
    /// Server → participant plan.
    #[serde(default)]
    pub participants: BTreeMap<String, StateParticipantPlan>,
}

impl StatePlanSpecification {
    /// Returns the generation planned for `server`, if it participates.
    #[must_use]
    pub fn generation_for(&self, server: &ServerId) -> Option<u64> {
        self.participants
            .get(server.as_str())
            .map(|p| p.generation)
    }
}

/// Role of this server in a local log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogRole {
    /// Leads the current term.
    Leader,
    /// Follows the current term's leader.
    Follower,
    /// Exists but has no term configuration yet.
    Unconfigured,
}

/// Cheap status summary of a local replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickLogStatus {
    /// Term the local log is in.
    pub term: u64,
    /// Local role.
    pub role: LogRole,
    /// Highest committed index known locally.
    pub commit_index: u64,
    /// Participants generation the log is configured with.
    pub participants_generation: u64,
}

/// Snapshot transfer status of a local replicated state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SnapshotStatus {
    /// No snapshot yet.
    Uninitialized,
    /// Snapshot transfer running.
    InProgress,
    /// Snapshot complete.
    Completed,
    /// Snapshot transfer failed.
    Failed,
    /// Snapshot discarded after a configuration change.
    Invalidated,
}

impl SnapshotStatus {
    /// Returns the label reported to Current.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Invalidated => "Invalidated",
        }
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Status of a local replicated state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateStatus {
    /// Generation the state has reached.
    pub generation: u64,
    /// Snapshot status.
    pub snapshot_status: SnapshotStatus,
}

/// Database → log → local log status.
pub type ReplicatedLogStatusMap = BTreeMap<String, BTreeMap<LogId, QuickLogStatus>>;
/// Database → log → local state status.
pub type ReplicatedStateStatusMap = BTreeMap<String, BTreeMap<LogId, StateStatus>>;

/// Change to apply to a local replicated log or state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SupervisionAction {
    /// Create the log locally.
    CreateLog {
        /// Planned specification.
        spec: LogPlanSpecification,
    },
    /// Move the local log to the planned term or participants.
    UpdateLog {
        /// Planned specification.
        spec: LogPlanSpecification,
    },
    /// Remove the local log.
    DropLog {
        /// Log to remove.
        id: LogId,
    },
    /// Create the state on top of an existing local log.
    CreateState {
        /// Planned specification.
        spec: StatePlanSpecification,
    },
    /// Move the local state to the planned generation.
    UpdateState {
        /// Planned specification.
        spec: StatePlanSpecification,
    },
    /// Remove the local state.
    DropState {
        /// State to remove.
        id: LogId,
    },
}

impl SupervisionAction {
    /// Returns the log the action concerns.
    #[must_use]
    pub fn log_id(&self) -> LogId {
        match self {
            Self::CreateLog { spec } | Self::UpdateLog { spec } => spec.id,
            Self::CreateState { spec } | Self::UpdateState { spec } => spec.id,
            Self::DropLog { id } | Self::DropState { id } => *id,
        }
    }
}

/// Reports local replication status and applies supervision actions.
#[async_trait]
pub trait ReplicationCoordinator: Send + Sync {
    /// Returns the status of every local replicated log.
    ///
    /// # Errors
    ///
    /// Returns an error if the status cannot be collected.
    async fn local_log_status(&self) -> Result<ReplicatedLogStatusMap>;

    /// Returns the status of every local replicated state.
    ///
    /// # Errors
    ///
    /// Returns an error if the status cannot be collected.
    async fn local_state_status(&self) -> Result<ReplicatedStateStatusMap>;

    /// Applies a supervision action to a log or state of `database`.
    ///
    /// # Errors
    ///
    /// Returns an error if the action cannot be applied; the action is
    /// retried by the scheduler.
    async fn apply_supervision_action(
        &self,
        database: &str,
        action: SupervisionAction,
    ) -> Result<()>;
}

#[derive(Debug, Default)]
struct ReplicationState {
    logs: ReplicatedLogStatusMap,
    states: ReplicatedStateStatusMap,
    applied: Vec<(String, SupervisionAction)>,
}

/// In-memory coordinator that applies actions instantly.
#[derive(Debug, Clone)]
pub struct InMemoryReplicationCoordinator {
    server_id: ServerId,
    state: Arc<RwLock<ReplicationState>>,
}

fn poison_err<T>(_: T) -> Error {
    Error::storage("lock poisoned")
}

impl InMemoryReplicationCoordinator {
    /// Creates a coordinator for `server_id` with no logs.
    #[must_use]
    pub fn new(server_id: ServerId) -> Self {
        Self {
            server_id,
            state: Arc::new(RwLock::new(ReplicationState::default())),
        }
    }

    /// Returns every action applied so far, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn applied(&self) -> Result<Vec<(String, SupervisionAction)>> {
        Ok(self.state.read().map_err(poison_err)?.applied.clone())
    }

    fn role_for(&self, spec: &LogPlanSpecification) -> LogRole {
        match spec.current_term.as_ref().and_then(|t| t.leader.as_deref()) {
            Some(leader) if self.server_id.is(leader) => LogRole::Leader,
            Some(_) => LogRole::Follower,
            None => LogRole::Unconfigured,
        }
    }
}

#[async_trait]
impl ReplicationCoordinator for InMemoryReplicationCoordinator {
    async fn local_log_status(&self) -> Result<ReplicatedLogStatusMap> {
        Ok(self.state.read().map_err(poison_err)?.logs.clone())
    }

    async fn local_state_status(&self) -> Result<ReplicatedStateStatusMap> {
        Ok(self.state.read().map_err(poison_err)?.states.clone())
    }

    async fn apply_supervision_action(
        &self,
        database: &str,
        action: SupervisionAction,
    ) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        match &action {
            SupervisionAction::CreateLog { spec } | SupervisionAction::UpdateLog { spec } => {
                let status = QuickLogStatus {
                    term: spec.term(),
                    role: self.role_for(spec),
                    commit_index: 0,
                    participants_generation: spec.participants_config.generation,
                };
                let logs = state.logs.entry(database.to_string()).or_default();
                let commit_index = logs.get(&spec.id).map_or(0, |s| s.commit_index);
                logs.insert(
                    spec.id,
                    QuickLogStatus {
                        commit_index,
                        ..status
                    },
                );
            }
            SupervisionAction::DropLog { id } => {
                if let Some(logs) = state.logs.get_mut(database) {
                    logs.remove(id);
                }
                if let Some(states) = state.states.get_mut(database) {
                    states.remove(id);
                }
            }
            SupervisionAction::CreateState { spec } | SupervisionAction::UpdateState { spec } => {
                let has_log = state
                    .logs
                    .get(database)
                    .is_some_and(|logs| logs.contains_key(&spec.id));
                if !has_log {
                    return Err(Error::storage(format!(
                        "replicated log {} missing in {database}",
                        spec.id
                    )));
                }
                let generation = spec.generation_for(&self.server_id).unwrap_or(spec.generation);
                state.states.entry(database.to_string()).or_default().insert(
                    spec.id,
                    StateStatus {
                        generation,
                        snapshot_status: SnapshotStatus::Completed,
                    },
                );
            }
            SupervisionAction::DropState { id } => {
                if let Some(states) = state.states.get_mut(database) {
                    states.remove(id);
                }
            }
        }
        state.applied.push((database.to_string(), action));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log_spec(term: u64, leader: &str) -> LogPlanSpecification {
        serde_json::from_value(json!({
            "id": 5,
            "currentTerm": { "term": term, "leader": leader },
            "participantsConfig": { "generation": 2, "participants": { "A": {}, "B": {} } }
        }))
        .unwrap()
    }

    #[test]
    fn specs_parse_from_plan_json() {
        let spec = log_spec(3, "A");
        assert_eq!(spec.term(), 3);
        assert!(spec.has_participant(&ServerId::new("B").unwrap()));
        assert!(!spec.has_participant(&ServerId::new("C").unwrap()));
        assert!(spec.participants_config.participants["A"].allowed_as_leader);
    }

    #[tokio::test]
    async fn state_requires_log() {
        let coordinator = InMemoryReplicationCoordinator::new(ServerId::new("A").unwrap());
        let state_spec = StatePlanSpecification {
            id: LogId::new(5),
            generation: 1,
            participants: BTreeMap::new(),
        };
        let err = coordinator
            .apply_supervision_action(
                "db",
                SupervisionAction::CreateState {
                    spec: state_spec.clone(),
                },
            )
            .await;
        assert!(err.is_err());

        coordinator
            .apply_supervision_action("db", SupervisionAction::CreateLog { spec: log_spec(1, "A") })
            .await
            .unwrap();
        coordinator
            .apply_supervision_action("db", SupervisionAction::CreateState { spec: state_spec })
            .await
            .unwrap();

        let logs = coordinator.local_log_status().await.unwrap();
        assert_eq!(logs["db"][&LogId::new(5)].role, LogRole::Leader);
        let states = coordinator.local_state_status().await.unwrap();
        assert_eq!(states["db"][&LogId::new(5)].generation, 1);
        assert_eq!(coordinator.applied().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn dropping_log_drops_state() {
        let coordinator = InMemoryReplicationCoordinator::new(ServerId::new("A").unwrap());
        coordinator
            .apply_supervision_action("db", SupervisionAction::CreateLog { spec: log_spec(1, "B") })
            .await
            .unwrap();
        coordinator
            .apply_supervision_action(
                "db",
                SupervisionAction::CreateState {
                    spec: StatePlanSpecification {
                        id: LogId::new(5),
                        generation: 1,
                        participants: BTreeMap::new(),
                    },
                },
            )
            .await
            .unwrap();
        coordinator
            .apply_supervision_action("db", SupervisionAction::DropLog { id: LogId::new(5) })
            .await
            .unwrap();

        assert!(coordinator.local_log_status().await.unwrap()["db"].is_empty());
        assert!(coordinator.local_state_status().await.unwrap()["db"].is_empty());
    }
}
