//! Write and read instrumentation
//!
//! Counters are plain atomics so hot paths never take a lock. A
//! [`MetricsSnapshot`] is serializable for JSON health output and
//! [`MetricsReporter::render_prometheus`] produces the text exposition format.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::models::ReadSource;

/// Upper bounds of the write latency buckets, in seconds
pub const LATENCY_BUCKETS: [f64; 12] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

#[derive(Default)]
struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS.len()],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl LatencyHistogram {
    fn observe(&self, latency: Duration) {
        let seconds = latency.as_secs_f64();
        for (bucket, bound) in self.buckets.iter().zip(LATENCY_BUCKETS) {
            if seconds <= bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct ShardCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    conflicts: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    stale_replays: AtomicU64,
    latency: LatencyHistogram,
}

/// Per-operation counters and latency, labeled by shard
pub struct MetricsReporter {
    shards: Vec<ShardCounters>,
    rejected_records: AtomicU64,
    breaker_trips: AtomicU64,
    breaker_rejections: AtomicU64,
    reads_primary: AtomicU64,
    reads_replica: AtomicU64,
    reads_in_flight: AtomicU64,
    read_fallbacks: AtomicU64,
    read_errors: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardMetricsSnapshot {
    pub shard_id: u32,
    pub attempts: u64,
    pub successes: u64,
    pub conflicts: u64,
    pub failures: u64,
    pub retries: u64,
    pub stale_replays: u64,
    pub writes_observed: u64,
    pub mean_write_latency_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub shards: Vec<ShardMetricsSnapshot>,
    pub rejected_records: u64,
    pub breaker_trips: u64,
    pub breaker_rejections: u64,
    pub reads_primary: u64,
    pub reads_replica: u64,
    pub reads_in_flight: u64,
    pub read_fallbacks: u64,
    pub read_errors: u64,
}

impl MetricsReporter {
    pub fn new(shard_count: u32) -> Self {
        Self {
            shards: (0..shard_count).map(|_| ShardCounters::default()).collect(),
            rejected_records: AtomicU64::new(0),
            breaker_trips: AtomicU64::new(0),
            breaker_rejections: AtomicU64::new(0),
            reads_primary: AtomicU64::new(0),
            reads_replica: AtomicU64::new(0),
            reads_in_flight: AtomicU64::new(0),
            read_fallbacks: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
        }
    }

    fn shard(&self, shard_id: u32) -> Option<&ShardCounters> {
        self.shards.get(shard_id as usize)
    }

    pub fn record_attempt(&self, shard_id: u32) {
        if let Some(shard) = self.shard(shard_id) {
            shard.attempts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_retry(&self, shard_id: u32) {
        if let Some(shard) = self.shard(shard_id) {
            shard.retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_success(&self, shard_id: u32, latency: Duration) {
        if let Some(shard) = self.shard(shard_id) {
            shard.successes.fetch_add(1, Ordering::Relaxed);
            shard.latency.observe(latency);
        }
    }

    /// An older or identical replay; counted as a success too
    pub fn record_stale_replay(&self, shard_id: u32, latency: Duration) {
        if let Some(shard) = self.shard(shard_id) {
            shard.stale_replays.fetch_add(1, Ordering::Relaxed);
        }
        self.record_success(shard_id, latency);
    }

    pub fn record_conflict(&self, shard_id: u32, latency: Duration) {
        if let Some(shard) = self.shard(shard_id) {
            shard.conflicts.fetch_add(1, Ordering::Relaxed);
            shard.latency.observe(latency);
        }
    }

    pub fn record_failure(&self, shard_id: u32, latency: Duration) {
        if let Some(shard) = self.shard(shard_id) {
            shard.failures.fetch_add(1, Ordering::Relaxed);
            shard.latency.observe(latency);
        }
    }

    /// Record rejected by validation before reaching a shard
    pub fn record_rejected(&self) {
        self.rejected_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_breaker_trip(&self) {
        self.breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_breaker_rejection(&self) {
        self.breaker_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read(&self, source: &ReadSource) {
        let counter = match source {
            ReadSource::Primary => &self.reads_primary,
            ReadSource::Replica(_) => &self.reads_replica,
            ReadSource::InFlight => &self.reads_in_flight,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// A replica was skipped (lagging, unknown lag, or errored) in favor of the primary
    pub fn record_read_fallback(&self) {
        self.read_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn breaker_trips(&self) -> u64 {
        self.breaker_trips.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let shards = self
            .shards
            .iter()
            .zip(0_u32..)
            .map(|(shard, shard_id)| {
                let observed = shard.latency.count.load(Ordering::Relaxed);
                let sum_micros = shard.latency.sum_micros.load(Ordering::Relaxed);
                #[allow(clippy::cast_precision_loss)]
                let mean_write_latency_ms = if observed == 0 {
                    0.0
                } else {
                    sum_micros as f64 / observed as f64 / 1_000.0
                };
                ShardMetricsSnapshot {
                    shard_id,
                    attempts: shard.attempts.load(Ordering::Relaxed),
                    successes: shard.successes.load(Ordering::Relaxed),
                    conflicts: shard.conflicts.load(Ordering::Relaxed),
                    failures: shard.failures.load(Ordering::Relaxed),
                    retries: shard.retries.load(Ordering::Relaxed),
                    stale_replays: shard.stale_replays.load(Ordering::Relaxed),
                    writes_observed: observed,
                    mean_write_latency_ms,
                }
            })
            .collect();

        MetricsSnapshot {
            shards,
            rejected_records: self.rejected_records.load(Ordering::Relaxed),
            breaker_trips: self.breaker_trips.load(Ordering::Relaxed),
            breaker_rejections: self.breaker_rejections.load(Ordering::Relaxed),
            reads_primary: self.reads_primary.load(Ordering::Relaxed),
            reads_replica: self.reads_replica.load(Ordering::Relaxed),
            reads_in_flight: self.reads_in_flight.load(Ordering::Relaxed),
            read_fallbacks: self.read_fallbacks.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
        }
    }

    /// Prometheus text exposition format (v0.0.4)
    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        let shard_counters: [(&str, &str, fn(&ShardCounters) -> &AtomicU64); 6] = [
            ("fieldsync_write_attempts_total", "Logical writes started", |s| &s.attempts),
            ("fieldsync_write_successes_total", "Writes committed or replayed", |s| {
                &s.successes
            }),
            ("fieldsync_write_conflicts_total", "Writes rejected as version conflicts", |s| {
                &s.conflicts
            }),
            ("fieldsync_write_failures_total", "Writes that failed for good", |s| &s.failures),
            ("fieldsync_write_retries_total", "Re-attempts after retryable errors", |s| {
                &s.retries
            }),
            ("fieldsync_write_stale_replays_total", "Replays of an equal or older version", |s| {
                &s.stale_replays
            }),
        ];
        for (name, help, counter) in shard_counters {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} counter");
            for (shard, shard_id) in self.shards.iter().zip(0_u32..) {
                let _ = writeln!(
                    output,
                    "{name}{{shard=\"{shard_id}\"}} {}",
                    counter(shard).load(Ordering::Relaxed)
                );
            }
        }

        let name = "fieldsync_write_latency_seconds";
        let _ = writeln!(output, "# HELP {name} Write latency per logical write");
        let _ = writeln!(output, "# TYPE {name} histogram");
        for (shard, shard_id) in self.shards.iter().zip(0_u32..) {
            for (bucket, bound) in shard.latency.buckets.iter().zip(LATENCY_BUCKETS) {
                let _ = writeln!(
                    output,
                    "{name}_bucket{{shard=\"{shard_id}\",le=\"{bound}\"}} {}",
                    bucket.load(Ordering::Relaxed)
                );
            }
            let count = shard.latency.count.load(Ordering::Relaxed);
            #[allow(clippy::cast_precision_loss)]
            let sum = shard.latency.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            let _ = writeln!(output, "{name}_bucket{{shard=\"{shard_id}\",le=\"+Inf\"}} {count}");
            let _ = writeln!(output, "{name}_sum{{shard=\"{shard_id}\"}} {sum:.6}");
            let _ = writeln!(output, "{name}_count{{shard=\"{shard_id}\"}} {count}");
        }

        let globals: [(&str, &str, &AtomicU64); 4] = [
            (
                "fieldsync_rejected_records_total",
                "Records rejected by validation",
                &self.rejected_records,
            ),
            (
                "fieldsync_breaker_trips_total",
                "Write circuit breaker transitions to open",
                &self.breaker_trips,
            ),
            (
                "fieldsync_breaker_rejections_total",
                "Writes refused while the breaker was open",
                &self.breaker_rejections,
            ),
            (
                "fieldsync_read_fallbacks_total",
                "Reads redirected from a replica to the primary",
                &self.read_fallbacks,
            ),
        ];
        for (name, help, counter) in globals {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} counter");
            let _ = writeln!(output, "{name} {}", counter.load(Ordering::Relaxed));
        }

        let name = "fieldsync_reads_total";
        let _ = writeln!(output, "# HELP {name} Status reads by source");
        let _ = writeln!(output, "# TYPE {name} counter");
        for (source, counter) in [
            ("primary", &self.reads_primary),
            ("replica", &self.reads_replica),
            ("in_flight", &self.reads_in_flight),
        ] {
            let _ = writeln!(
                output,
                "{name}{{source=\"{source}\"}} {}",
                counter.load(Ordering::Relaxed)
            );
        }

        let name = "fieldsync_read_errors_total";
        let _ = writeln!(output, "# HELP {name} Reads that failed on every source");
        let _ = writeln!(output, "# TYPE {name} counter");
        let _ = writeln!(output, "{name} {}", self.read_errors.load(Ordering::Relaxed));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn counts_by_shard() {
        let metrics = MetricsReporter::new(2);
        metrics.record_attempt(0);
        metrics.record_attempt(1);
        metrics.record_retry(1);
        metrics.record_success(1, Duration::from_millis(4));
        metrics.record_conflict(0, Duration::from_millis(2));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.shards[0].attempts, 1);
        assert_eq!(snapshot.shards[0].conflicts, 1);
        assert_eq!(snapshot.shards[1].retries, 1);
        assert_eq!(snapshot.shards[1].successes, 1);
        assert_eq!(snapshot.shards[1].writes_observed, 1);
        assert!((snapshot.shards[1].mean_write_latency_ms - 4.0).abs() < 0.01);
    }

    #[test]
    fn out_of_range_shard_is_ignored() {
        let metrics = MetricsReporter::new(1);
        metrics.record_attempt(7);
        assert_eq!(metrics.snapshot().shards[0].attempts, 0);
    }

    #[test]
    fn stale_replay_counts_as_success() {
        let metrics = MetricsReporter::new(1);
        metrics.record_stale_replay(0, Duration::ZERO);
        let shard = &metrics.snapshot().shards[0];
        assert_eq!(shard.stale_replays, 1);
        assert_eq!(shard.successes, 1);
    }

    #[test]
    fn reads_tracked_by_source() {
        let metrics = MetricsReporter::new(1);
        metrics.record_read(&ReadSource::Primary);
        metrics.record_read(&ReadSource::Replica("r1".into()));
        metrics.record_read(&ReadSource::Replica("r2".into()));
        metrics.record_read_fallback();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.reads_primary, 1);
        assert_eq!(snapshot.reads_replica, 2);
        assert_eq!(snapshot.read_fallbacks, 1);
    }

    #[test]
    fn prometheus_output_has_labeled_series() {
        let metrics = MetricsReporter::new(2);
        metrics.record_attempt(1);
        metrics.record_success(1, Duration::from_millis(30));
        metrics.record_breaker_trip();

        let text = metrics.render_prometheus();
        assert!(text.contains("# TYPE fieldsync_write_attempts_total counter"));
        assert!(text.contains("fieldsync_write_attempts_total{shard=\"1\"} 1"));
        assert!(text.contains("fieldsync_write_latency_seconds_bucket{shard=\"1\",le=\"0.05\"} 1"));
        assert!(text.contains("fieldsync_write_latency_seconds_bucket{shard=\"1\",le=\"0.025\"} 0"));
        assert!(text.contains("fieldsync_write_latency_seconds_count{shard=\"1\"} 1"));
        assert!(text.contains("fieldsync_breaker_trips_total 1"));
        assert!(text.contains("fieldsync_reads_total{source=\"replica\"} 0"));
    }
}
