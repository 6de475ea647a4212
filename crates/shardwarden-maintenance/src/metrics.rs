//! Metrics for the maintenance loop.
//!
//! Recorded through the `metrics` facade; installing an exporter is up to
//! the embedding process.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `shardwarden_maintenance_actions_emitted_total` | Counter | `kind` |
//! | `shardwarden_maintenance_actions_skipped_total` | Counter | `reason` |
//! | `shardwarden_maintenance_actions_finished_total` | Counter | `kind`, `outcome` |
//! | `shardwarden_maintenance_action_duration_seconds` | Histogram | `kind`, `outcome` |
//! | `shardwarden_maintenance_queue_depth` | Gauge | `track` |
//! | `shardwarden_maintenance_round_duration_seconds` | Histogram | `phase` |
//! | `shardwarden_maintenance_report_conflicts_total` | Counter | - |
//! | `shardwarden_maintenance_shards` | Gauge | `category` |

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

use crate::reporter::ShardStatistics;

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: actions emitted by the diff.
    pub const ACTIONS_EMITTED_TOTAL: &str = "shardwarden_maintenance_actions_emitted_total";
    /// Counter: candidate actions not submitted.
    pub const ACTIONS_SKIPPED_TOTAL: &str = "shardwarden_maintenance_actions_skipped_total";
    /// Counter: actions that left the scheduler.
    pub const ACTIONS_FINISHED_TOTAL: &str = "shardwarden_maintenance_actions_finished_total";
    /// Histogram: action execution time in seconds.
    pub const ACTION_DURATION_SECONDS: &str = "shardwarden_maintenance_action_duration_seconds";
    /// Gauge: queued actions per track.
    pub const QUEUE_DEPTH: &str = "shardwarden_maintenance_queue_depth";
    /// Histogram: phase duration in seconds.
    pub const ROUND_DURATION_SECONDS: &str = "shardwarden_maintenance_round_duration_seconds";
    /// Counter: Current reports rejected by the index precondition.
    pub const REPORT_CONFLICTS_TOTAL: &str = "shardwarden_maintenance_report_conflicts_total";
    /// Gauge: local shard counts.
    pub const SHARDS: &str = "shardwarden_maintenance_shards";
}

/// Label keys used across metrics.
pub mod labels {
    /// Action kind.
    pub const KIND: &str = "kind";
    /// Execution outcome.
    pub const OUTCOME: &str = "outcome";
    /// Why a candidate was skipped.
    pub const REASON: &str = "reason";
    /// Scheduler track.
    pub const TRACK: &str = "track";
    /// Maintenance phase.
    pub const PHASE: &str = "phase";
    /// Shard statistic category.
    pub const CATEGORY: &str = "category";
}

/// Records maintenance metrics. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceMetrics;

impl MaintenanceMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records an action emitted by the diff.
    pub fn record_emitted(&self, kind: &str) {
        counter!(names::ACTIONS_EMITTED_TOTAL, labels::KIND => kind.to_string()).increment(1);
    }

    /// Records candidate actions skipped for `reason`.
    pub fn record_skipped(&self, reason: &'static str, count: usize) {
        counter!(names::ACTIONS_SKIPPED_TOTAL, labels::REASON => reason)
            .increment(u64::try_from(count).unwrap_or(u64::MAX));
    }

    /// Records a finished execution attempt and its duration.
    pub fn record_finished(&self, kind: &str, outcome: &'static str, duration: Duration) {
        counter!(
            names::ACTIONS_FINISHED_TOTAL,
            labels::KIND => kind.to_string(),
            labels::OUTCOME => outcome,
        )
        .increment(1);
        histogram!(
            names::ACTION_DURATION_SECONDS,
            labels::KIND => kind.to_string(),
            labels::OUTCOME => outcome,
        )
        .record(duration.as_secs_f64());
    }

    /// Sets the queue depth of a track.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_queue_depth(&self, track: &'static str, depth: usize) {
        gauge!(names::QUEUE_DEPTH, labels::TRACK => track).set(depth as f64);
    }

    /// Records how long a phase took.
    pub fn observe_phase_duration(&self, phase: &'static str, duration: Duration) {
        histogram!(names::ROUND_DURATION_SECONDS, labels::PHASE => phase)
            .record(duration.as_secs_f64());
    }

    /// Records a Current report rejected by its precondition.
    pub fn record_report_conflict(&self) {
        counter!(names::REPORT_CONFLICTS_TOTAL).increment(1);
    }

    /// Publishes the shard statistics of the last report.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_shard_statistics(&self, stats: &ShardStatistics) {
        gauge!(names::SHARDS, labels::CATEGORY => "total").set(stats.num_shards as f64);
        gauge!(names::SHARDS, labels::CATEGORY => "leader").set(stats.num_leader_shards as f64);
        gauge!(names::SHARDS, labels::CATEGORY => "out_of_sync")
            .set(stats.num_out_of_sync_shards as f64);
        gauge!(names::SHARDS, labels::CATEGORY => "not_replicated")
            .set(stats.num_not_replicated as f64);
    }
}

/// RAII guard for timing operations.
///
/// Calls `on_drop` with the elapsed duration when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a guard that reports the elapsed time on drop.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Creates a timing guard recording a phase duration.
#[must_use]
pub fn time_phase(
    metrics: &MaintenanceMetrics,
    phase: &'static str,
) -> TimingGuard<impl FnOnce(Duration) + use<>> {
    let metrics = metrics.clone();
    TimingGuard::new(move |duration| metrics.observe_phase_duration(phase, duration))
}
