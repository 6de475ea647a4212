//! Error types and result aliases shared by every shardwarden component.
//!
//! Errors are structured for programmatic handling and carry enough context
//! to be logged without further decoration.

/// The result type used throughout shardwarden.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in shardwarden operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// The agency could not serve or apply a request.
    #[error("agency error: {message}")]
    Agency {
        /// Description of the agency failure.
        message: String,
    },
}

impl Error {
    /// Creates a new agency error with the given message.
    #[must_use]
    pub fn agency(message: impl Into<String>) -> Self {
        Self::Agency {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agency_error_names_the_failure() {
        let err = Error::agency("agency node is not an object");
        assert_eq!(
            err.to_string(),
            "agency error: agency node is not an object"
        );
    }
}
