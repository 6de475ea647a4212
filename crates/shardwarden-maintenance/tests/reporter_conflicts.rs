//! Reporting into Current while other writers move it.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use shardwarden_core::agency::{
    AgencyBackend, AgencyPath, AgencySnapshot, AgencyTransaction, MemoryAgency, WriteResult,
};
use shardwarden_core::{ServerId, ShardId};
use shardwarden_maintenance::error::Error;
use shardwarden_maintenance::errors::PriorErrors;
use shardwarden_maintenance::local::{LocalShard, LocalSnapshot, ShardRole};
use shardwarden_maintenance::metrics::MaintenanceMetrics;
use shardwarden_maintenance::replication::ReplicatedStateStatusMap;
use shardwarden_maintenance::reporter::{LocalFacts, Reporter};

/// Lets another writer touch Current right before each of the first
/// `interferences` writes.
struct Meddling {
    inner: MemoryAgency,
    interferences: AtomicU32,
}

#[async_trait]
impl AgencyBackend for Meddling {
    async fn read_plan(&self) -> shardwarden_core::Result<AgencySnapshot> {
        self.inner.read_plan().await
    }

    async fn read_current(&self) -> shardwarden_core::Result<AgencySnapshot> {
        self.inner.read_current().await
    }

    async fn write(&self, transaction: AgencyTransaction) -> shardwarden_core::Result<WriteResult> {
        let left = self.interferences.load(Ordering::SeqCst);
        if left > 0 {
            self.interferences.store(left - 1, Ordering::SeqCst);
            let shard = format!("s9-{left}");
            let mut other = AgencyTransaction::new();
            other.set(
                AgencyPath::current(["db", "collections", "c9", shard.as_str()]),
                json!({ "servers": ["Z"] }),
            );
            self.inner.write(other).await?;
        }
        self.inner.write(transaction).await
    }
}

fn plan() -> Value {
    json!({ "db": { "collections": { "c1": { "shards": { "s1": ["A", "B"] } } } } })
}

fn local() -> LocalSnapshot {
    let mut local = LocalSnapshot::default();
    let mut leader = LocalShard::new("c1", ShardRole::Leader);
    leader.in_sync_followers = vec![ServerId::new("B").unwrap()];
    local
        .databases
        .entry("db".to_string())
        .or_default()
        .shards
        .insert(ShardId::new("s1").unwrap(), leader);
    local
}

fn agency(interferences: u32) -> Arc<Meddling> {
    Arc::new(Meddling {
        inner: MemoryAgency::new(plan(), json!({})),
        interferences: AtomicU32::new(interferences),
    })
}

async fn report(
    agency: &Arc<Meddling>,
    retry_limit: u32,
) -> shardwarden_maintenance::error::Result<()> {
    let reporter = Reporter::new(
        Arc::clone(agency) as Arc<dyn AgencyBackend>,
        ServerId::new("A").unwrap(),
        retry_limit,
        MaintenanceMetrics::new(),
    );
    let plan = plan();
    let dirty = BTreeSet::from(["db".to_string()]);
    let local = local();
    let errors = PriorErrors::new();
    let states = ReplicatedStateStatusMap::new();
    reporter
        .phase_two(LocalFacts {
            plan: &plan,
            dirty: &dirty,
            local: &local,
            prior_errors: &errors,
            state_status: &states,
        })
        .await
        .map(|_| ())
}

#[tokio::test]
async fn conflicting_writer_causes_rebuild_not_overwrite() {
    let agency = agency(2);
    report(&agency, 5).await.unwrap();

    let entry = agency
        .inner
        .get(&AgencyPath::current(["db", "collections", "c1", "s1"]))
        .unwrap()
        .unwrap();
    assert_eq!(entry["servers"], json!(["A", "B"]));

    // Both foreign writes survive: the report never clobbered them.
    for shard in ["s9-1", "s9-2"] {
        let foreign = agency
            .inner
            .get(&AgencyPath::current(["db", "collections", "c9", shard]))
            .unwrap();
        assert_eq!(foreign, Some(json!({ "servers": ["Z"] })));
    }
    // Two foreign writes plus exactly one successful report.
    assert_eq!(agency.inner.applied_writes().unwrap(), 3);
}

#[tokio::test]
async fn persistent_conflicts_give_up_without_partial_writes() {
    let agency = agency(10);
    let err = report(&agency, 3).await.unwrap_err();
    assert!(matches!(err, Error::ReportConflict { attempts: 3 }));

    let ours = agency
        .inner
        .get(&AgencyPath::current(["db", "collections", "c1"]))
        .unwrap();
    assert_eq!(ours, None);
    assert_eq!(agency.inner.applied_writes().unwrap(), 3);
}

#[tokio::test]
async fn second_report_without_changes_writes_nothing() {
    let agency = agency(0);
    report(&agency, 3).await.unwrap();
    let writes = agency.inner.applied_writes().unwrap();

    report(&agency, 3).await.unwrap();
    assert_eq!(agency.inner.applied_writes().unwrap(), writes);
}
