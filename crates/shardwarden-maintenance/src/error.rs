//! Error types for the maintenance domain.

use shardwarden_core::ActionId;

/// The result type used throughout shardwarden-maintenance.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in maintenance operations.
///
/// Per-database and per-collection problems found while diffing are not
/// errors of this type; they are reported in the diff outcome and recorded
/// in the error ledger. This type covers failures that abort a round or an
/// API call.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A DAG node was not found (internal graph operation error).
    #[error("DAG node not found: {node}")]
    DagNodeNotFound {
        /// The node identifier (index or value).
        node: String,
    },

    /// The Plan tree as a whole could not be interpreted.
    #[error("malformed plan: {message}")]
    MalformedPlan {
        /// Description of the problem.
        message: String,
    },

    /// An invalid action state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// The registry holds no entry for the given action.
    #[error("action not registered: {action_id}")]
    ActionNotRegistered {
        /// The action that was looked up.
        action_id: ActionId,
    },

    /// The Current report kept losing the race against concurrent writers.
    #[error("current report conflicted {attempts} times in a row")]
    ReportConflict {
        /// Number of attempts made.
        attempts: u32,
    },

    /// The scheduler no longer accepts work.
    #[error("scheduler is shutting down")]
    ShuttingDown,

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// An error from shardwarden-core.
    #[error("core error: {0}")]
    Core(#[from] shardwarden_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new malformed plan error.
    #[must_use]
    pub fn malformed_plan(message: impl Into<String>) -> Self {
        Self::MalformedPlan {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn core_errors_convert_and_keep_source() {
        let core = shardwarden_core::Error::agency("unreachable");
        let err: Error = core.into();
        assert!(err.to_string().contains("unreachable"));
        assert!(err.source().is_some());
    }

    #[test]
    fn report_conflict_counts_attempts() {
        let err = Error::ReportConflict { attempts: 3 };
        assert!(err.to_string().contains('3'));
    }
}
