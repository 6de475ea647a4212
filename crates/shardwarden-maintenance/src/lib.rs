//! # shardwarden-maintenance
//!
//! The DBServer maintenance loop: reconciles the cluster's desired state
//! (Plan) with what this server hosts, and reports what it hosts back into
//! the observed state (Current).
//!
//! ## Core Concepts
//!
//! - **Diff**: a pure comparison of Plan, Current and the local snapshot
//!   producing at most one action per shard or replicated log per round
//! - **Action**: an immutable description of one piece of work, carrying a
//!   priority and a track (fast or slow)
//! - **Registry**: at most one active action per resource, with failures
//!   kept until the resource is found in sync
//! - **Scheduler**: a worker pool over two priority queues in which one
//!   worker never runs `SLOW_OP` work
//! - **Reporter**: a single index-guarded Current transaction per round
//!   holding only the differences
//!
//! ## Guarantees
//!
//! - **Exclusive**: two actions never work on the same resource at once
//! - **Idempotent**: diffing an unchanged state with its actions registered
//!   emits nothing
//! - **Convergent**: once actions complete, the next round finds nothing to do
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use shardwarden_core::agency::MemoryAgency;
//! use shardwarden_core::ServerId;
//! use shardwarden_maintenance::config::MaintenanceConfig;
//! use shardwarden_maintenance::feature::{FeatureParts, MaintenanceFeature};
//! use shardwarden_maintenance::replication::InMemoryReplicationCoordinator;
//! use shardwarden_maintenance::storage::InMemoryStorageEngine;
//!
//! # async fn demo() -> shardwarden_maintenance::error::Result<()> {
//! let server_id = ServerId::new("PRMR-1")?;
//! let agency = MemoryAgency::new(json!({ "_system": {} }), json!({}));
//! let feature = MaintenanceFeature::start(
//!     MaintenanceConfig::from_env()?,
//!     FeatureParts {
//!         server_id: server_id.clone(),
//!         agency: Arc::new(agency),
//!         engine: Arc::new(InMemoryStorageEngine::new()),
//!         replication: Arc::new(InMemoryReplicationCoordinator::new(server_id)),
//!     },
//! );
//! let round = feature.run_round().await?;
//! println!("submitted {} actions", round.phase_one.submitted.accepted);
//! feature.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod action;
pub mod config;
pub mod current;
pub mod dag;
pub mod diff;
pub mod error;
pub mod errors;
pub mod executor;
pub mod feature;
pub mod local;
pub mod metrics;
pub mod plan;
pub mod registry;
pub mod replication;
pub mod reporter;
pub mod scheduler;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::action::{ActionDescription, ActionKind, Priority, ResourceKey, Track};
    pub use crate::config::MaintenanceConfig;
    pub use crate::diff::{DiffInput, DiffOutcome, diff_plan_local};
    pub use crate::error::{Error, Result};
    pub use crate::errors::{ErrorEntry, ErrorKey, ErrorLedger, PriorErrors};
    pub use crate::executor::{ActionExecutor, ExecutionContext, ExecutionOutcome, ExecutorRegistry};
    pub use crate::feature::{FeatureParts, MaintenanceFeature, RoundReport};
    pub use crate::local::{LocalShard, LocalSnapshot, ShardRole};
    pub use crate::registry::{ActionRegistry, ActionState, Activation, ShardActionMap};
    pub use crate::replication::{InMemoryReplicationCoordinator, ReplicationCoordinator};
    pub use crate::reporter::{Reporter, ShardStatistics, report_in_current};
    pub use crate::scheduler::{Scheduler, SubmitReport};
    pub use crate::storage::{InMemoryStorageEngine, StorageEngine};
}
