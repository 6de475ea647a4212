//! # shardwarden-core
//!
//! Shared primitives for the shardwarden DBServer maintenance components.
//!
//! - **Identifiers**: strongly-typed server, shard, log and action IDs
//! - **Agency**: the Plan/Current store abstraction with transactional,
//!   precondition-checked writes and an in-memory implementation
//! - **Fingerprints**: content hashes of agency fragments
//! - **Observability**: logging initialization and span helpers
//! - **Error Types**: shared error definitions and result types
//!
//! ## Example
//!
//! ```rust
//! use shardwarden_core::prelude::*;
//!
//! let server = ServerId::new("PRMR-1").unwrap();
//! let path = AgencyPath::current(["_system", "servers", server.as_str()]);
//! assert_eq!(path.to_string(), "Current/_system/servers/PRMR-1");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod agency;
pub mod error;
pub mod fingerprint;
pub mod id;
pub mod observability;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::agency::{
        AgencyBackend, AgencyOperation, AgencyPath, AgencyRoot, AgencySnapshot,
        AgencyTransaction, MemoryAgency, Precondition, WriteResult,
    };
    pub use crate::error::{Error, Result};
    pub use crate::fingerprint::fingerprint;
    pub use crate::id::{ActionId, LogId, ServerId, ShardId};
}

pub use error::{Error, Result};
pub use id::{ActionId, LogId, ServerId, ShardId};
