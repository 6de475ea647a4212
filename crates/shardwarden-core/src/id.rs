//! Strongly-typed identifiers for cluster entities.
//!
//! Server and shard names come from the agency and are validated on entry;
//! action identifiers are ULIDs generated locally.
//!
//! # Example
//!
//! ```rust
//! use shardwarden_core::id::{ActionId, ServerId, ShardId};
//!
//! let server = ServerId::new("PRMR-1234").unwrap();
//! let shard = ShardId::new("s100042").unwrap();
//! let action = ActionId::generate();
//!
//! assert_eq!(server.as_str(), "PRMR-1234");
//! assert_eq!(shard.as_str(), "s100042");
//! assert!(action.to_string().len() == 26);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// Prefix the agency puts in front of a leader that has resigned.
pub const RESIGNED_LEADER_PREFIX: char = '_';

fn validate_name(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidId {
            message: format!("{kind} cannot be empty"),
        });
    }
    if value.contains('/') {
        return Err(Error::InvalidId {
            message: format!("{kind} '{value}' cannot contain '/'"),
        });
    }
    if value.chars().any(char::is_whitespace) {
        return Err(Error::InvalidId {
            message: format!("{kind} '{value}' cannot contain whitespace"),
        });
    }
    Ok(())
}

/// Identifier of a server (DBServer) in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    /// Creates a server ID after validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty, contains `/` or whitespace.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_name("server ID", &id)?;
        Ok(Self(id))
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if `entry` names this server as an active (not resigned) participant.
    #[must_use]
    pub fn is(&self, entry: &str) -> bool {
        entry == self.0
    }

    /// Returns `true` if `entry` names this server as a resigned leader.
    #[must_use]
    pub fn is_resigned(&self, entry: &str) -> bool {
        entry
            .strip_prefix(RESIGNED_LEADER_PREFIX)
            .is_some_and(|rest| rest == self.0)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ServerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Identifier of a shard, unique cluster-wide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    /// Creates a shard ID after validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty, contains `/` or whitespace.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_name("shard ID", &id)?;
        Ok(Self(id))
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ShardId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Identifier of a replicated log (and the replicated state built on it).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LogId(u64);

impl LogId {
    /// Creates a log ID from its numeric value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the numeric value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LogId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<u64>().map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid log ID '{s}': {e}"),
        })
    }
}

/// A unique identifier for a maintenance action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(Ulid);

impl ActionId {
    /// Generates a new unique action ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the creation timestamp encoded in the ID.
    #[must_use]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        let ms = i64::try_from(self.0.timestamp_ms()).unwrap_or(i64::MAX);
        chrono::DateTime::from_timestamp_millis(ms).unwrap_or_else(chrono::Utc::now)
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ActionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid action ID '{s}': {e}"),
            })
    }
}
