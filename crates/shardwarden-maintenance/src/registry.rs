//! Registry of in-flight and failed actions, keyed by resource.
//!
//! The registry is the only mutual exclusion between the diff and the
//! workers: at most one action per [`ResourceKey`] is active at any time.
//! A successful action is removed; a failed one stays (with its error) until
//! a later diff finds the resource in sync or a new action replaces it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shardwarden_core::ActionId;

use crate::action::{ActionDescription, ActionKind, ResourceKey};
use crate::error::{Error, Result};

/// Lifecycle of a registered action.
///
/// ```text
/// Queued ──► Running ──► Succeeded
///   ▲          │  │
///   └─retry────┘  ├──► Failed
///                 └──► SelfRequeuedAsSlow ──► Running
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    /// Waiting in a scheduler queue.
    Queued,
    /// Being executed by a worker.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Yielded and waiting on the slow track at `SLOW_OP`.
    SelfRequeuedAsSlow,
}

impl ActionState {
    /// Returns `true` if the action occupies its resource.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::SelfRequeuedAsSlow)
    }

    /// Returns `true` for states that end the lifecycle.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Returns `true` if moving to `target` is allowed.
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        self.valid_transitions().contains(&target)
    }

    /// Returns the states reachable in one step.
    #[must_use]
    pub const fn valid_transitions(self) -> &'static [Self] {
        match self {
            Self::Queued | Self::SelfRequeuedAsSlow => &[Self::Running],
            Self::Running => &[
                Self::Succeeded,
                Self::Failed,
                Self::SelfRequeuedAsSlow,
                Self::Queued,
            ],
            Self::Succeeded | Self::Failed => &[],
        }
    }

    /// Returns the label used in logs and metrics.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::SelfRequeuedAsSlow => "self_requeued_as_slow",
        }
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Answer to an activation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    /// The action now owns its resource.
    Accepted,
    /// Another action is active on the resource.
    RejectedBecauseActive {
        /// The active action.
        active_id: ActionId,
        /// Its kind.
        active_kind: ActionKind,
    },
}

/// How an action finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Work done.
    Succeeded,
    /// Work failed with `message`.
    Failed {
        /// Error description.
        message: String,
    },
}

/// Registry record of one action.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    /// The registered action (as last resubmitted).
    pub action: ActionDescription,
    /// Lifecycle state.
    pub state: ActionState,
    /// Execution attempts so far.
    pub attempts: u32,
    /// Last error, for failed or retried actions.
    pub last_error: Option<String>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

/// Read-only view of one resource's registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardActionEntry {
    /// Registered action.
    pub action_id: ActionId,
    /// Its kind.
    pub kind: ActionKind,
    /// Its state.
    pub state: ActionState,
    /// Last error, if any.
    pub last_error: Option<String>,
}

/// Read-only snapshot of the registry handed to the diff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardActionMap {
    entries: BTreeMap<ResourceKey, ShardActionEntry>,
}

impl ShardActionMap {
    /// Returns the entry for `key`.
    #[must_use]
    pub fn get(&self, key: &ResourceKey) -> Option<&ShardActionEntry> {
        self.entries.get(key)
    }

    /// Returns `true` if an action is active on `key`.
    #[must_use]
    pub fn is_active(&self, key: &ResourceKey) -> bool {
        self.entries.get(key).is_some_and(|e| e.state.is_active())
    }

    /// Returns the kind of the active action on `key`.
    #[must_use]
    pub fn active_kind(&self, key: &ResourceKey) -> Option<ActionKind> {
        self.entries
            .get(key)
            .filter(|e| e.state.is_active())
            .map(|e| e.kind)
    }

    /// Returns the first active action on a shard or log of `database`.
    #[must_use]
    pub fn active_within(&self, database: &str) -> Option<(&ResourceKey, ActionKind)> {
        self.entries
            .iter()
            .filter(|(key, entry)| {
                entry.state.is_active()
                    && key.database_name() == database
                    && !matches!(key, ResourceKey::Database { .. })
            })
            .map(|(key, entry)| (key, entry.kind))
            .next()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no resource has an entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&ResourceKey, &ShardActionEntry)> {
        self.entries.iter()
    }
}

/// Thread-safe action registry.
#[derive(Debug, Default)]
pub struct ActionRegistry {
    entries: RwLock<HashMap<ResourceKey, RegistryEntry>>,
}

fn poison_err<T>(_: T) -> Error {
    Error::storage("lock poisoned")
}

impl ActionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `action` as active on its resource unless another action is.
    ///
    /// A failed entry on the resource is replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn try_activate(&self, action: &ActionDescription) -> Result<Activation> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        let key = action.resource().clone();
        if let Some(existing) = entries.get(&key) {
            if existing.state.is_active() {
                return Ok(Activation::RejectedBecauseActive {
                    active_id: existing.action.id(),
                    active_kind: existing.action.kind(),
                });
            }
        }
        entries.insert(
            key,
            RegistryEntry {
                action: action.clone(),
                state: ActionState::Queued,
                attempts: 0,
                last_error: None,
                updated_at: Utc::now(),
            },
        );
        Ok(Activation::Accepted)
    }

    fn transition<F>(
        &self,
        key: &ResourceKey,
        id: ActionId,
        target: ActionState,
        f: F,
    ) -> Result<RegistryEntry>
    where
        F: FnOnce(&mut RegistryEntry),
    {
        let mut entries = self.entries.write().map_err(poison_err)?;
        let entry = entries
            .get_mut(key)
            .filter(|e| e.action.id() == id)
            .ok_or(Error::ActionNotRegistered { action_id: id })?;
        if !entry.state.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: entry.state.to_string(),
                to: target.to_string(),
                reason: format!("action {id} on {key}"),
            });
        }
        entry.state = target;
        entry.updated_at = Utc::now();
        f(entry);
        Ok(entry.clone())
    }

    /// Marks a queued action as running and counts the attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the action is not registered or not runnable.
    pub fn mark_running(&self, key: &ResourceKey, id: ActionId) -> Result<RegistryEntry> {
        self.transition(key, id, ActionState::Running, |entry| entry.attempts += 1)
    }

    /// Puts a running action back into the queue after a retryable error.
    ///
    /// # Errors
    ///
    /// Returns an error if the action is not registered or not running.
    pub fn record_retry(
        &self,
        key: &ResourceKey,
        id: ActionId,
        message: &str,
    ) -> Result<RegistryEntry> {
        self.transition(key, id, ActionState::Queued, |entry| {
            entry.last_error = Some(message.to_string());
        })
    }

    /// Records that a running action yielded; returns its slow-track resubmission.
    ///
    /// # Errors
    ///
    /// Returns an error if the action is not registered or not running.
    pub fn requeue_as_slow(&self, key: &ResourceKey, id: ActionId) -> Result<ActionDescription> {
        let entry = self.transition(key, id, ActionState::SelfRequeuedAsSlow, |entry| {
            entry.action = entry.action.requeued_as_slow();
        })?;
        Ok(entry.action)
    }

    /// Finishes a running action.
    ///
    /// Success frees the resource; failure keeps the entry with its error.
    ///
    /// # Errors
    ///
    /// Returns an error if the action is not registered or not running.
    pub fn complete(&self, key: &ResourceKey, id: ActionId, completion: Completion) -> Result<()> {
        match completion {
            Completion::Succeeded => {
                let mut entries = self.entries.write().map_err(poison_err)?;
                let entry = entries
                    .get(key)
                    .filter(|e| e.action.id() == id)
                    .ok_or(Error::ActionNotRegistered { action_id: id })?;
                if !entry.state.can_transition_to(ActionState::Succeeded) {
                    return Err(Error::InvalidStateTransition {
                        from: entry.state.to_string(),
                        to: ActionState::Succeeded.to_string(),
                        reason: format!("action {id} on {key}"),
                    });
                }
                entries.remove(key);
            }
            Completion::Failed { message } => {
                self.transition(key, id, ActionState::Failed, |entry| {
                    entry.last_error = Some(message);
                })?;
            }
        }
        Ok(())
    }

    /// Drops the entry of an action that will never run (shutdown).
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn abandon(&self, key: &ResourceKey, id: ActionId) -> Result<bool> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        if entries.get(key).is_some_and(|e| e.action.id() == id) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    /// Drops a failed entry once the resource is found in sync.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn clear_failed(&self, key: &ResourceKey) -> Result<bool> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        if entries
            .get(key)
            .is_some_and(|e| e.state == ActionState::Failed)
        {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    /// Returns `true` if an action is active on `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn is_active(&self, key: &ResourceKey) -> Result<bool> {
        Ok(self
            .entries
            .read()
            .map_err(poison_err)?
            .get(key)
            .is_some_and(|e| e.state.is_active()))
    }

    /// Returns the entry for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn entry(&self, key: &ResourceKey) -> Result<Option<RegistryEntry>> {
        Ok(self.entries.read().map_err(poison_err)?.get(key).cloned())
    }

    /// Returns the number of active actions.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn active_count(&self) -> Result<usize> {
        Ok(self
            .entries
            .read()
            .map_err(poison_err)?
            .values()
            .filter(|e| e.state.is_active())
            .count())
    }

    /// Returns a read-only snapshot for the diff.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn snapshot(&self) -> Result<ShardActionMap> {
        let entries = self.entries.read().map_err(poison_err)?;
        Ok(ShardActionMap {
            entries: entries
                .iter()
                .map(|(key, entry)| {
                    (
                        key.clone(),
                        ShardActionEntry {
                            action_id: entry.action.id(),
                            kind: entry.action.kind(),
                            state: entry.state,
                            last_error: entry.last_error.clone(),
                        },
                    )
                })
                .collect(),
        })
    }
}
