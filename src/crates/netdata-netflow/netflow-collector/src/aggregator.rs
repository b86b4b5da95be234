//! Time-bucketed flow aggregation.
//!
//! One writer (the ingestion task) and any number of readers share the state
//! behind a single `RwLock`. Every bound is enforced by dropping or evicting
//! and counting; no operation here fails.

use crate::config::ExporterConfig;
use crate::flow::{Direction, FlowKey, FlowRecord, FlowVersion};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

pub const SCHEMA_VERSION: &str = "1.0";

pub const DEFAULT_BUCKET_DURATION: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_BUCKETS: usize = 60;
pub const DEFAULT_SAMPLING_RATE: u64 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct FlowMetrics {
    bytes: u64,
    packets: u64,
    flows: u64,
    raw_bytes: u64,
    raw_packets: u64,
}

impl FlowMetrics {
    fn sampled(record: &FlowRecord, rate: u64) -> Self {
        Self {
            bytes: record.bytes.saturating_mul(rate),
            packets: record.packets.saturating_mul(rate),
            flows: record.flows.saturating_mul(rate),
            raw_bytes: record.bytes,
            raw_packets: record.packets,
        }
    }

    fn add(&mut self, other: FlowMetrics) {
        self.bytes = self.bytes.saturating_add(other.bytes);
        self.packets = self.packets.saturating_add(other.packets);
        self.flows = self.flows.saturating_add(other.flows);
        self.raw_bytes = self.raw_bytes.saturating_add(other.raw_bytes);
        self.raw_packets = self.raw_packets.saturating_add(other.raw_packets);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EntryKey {
    key: FlowKey,
    exporter_ip: String,
    direction: Direction,
}

#[derive(Debug, Clone, Copy)]
struct BucketEntry {
    metrics: FlowMetrics,
    /// Rate of the most recent record folded in.
    sampling_rate: u64,
}

#[derive(Debug, Default)]
struct Bucket {
    entries: HashMap<EntryKey, BucketEntry>,
    dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExporterState {
    pub ip: String,
    pub name: String,
    pub sampling_rate: u64,
    pub version: Option<FlowVersion>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct ExporterOverride {
    name: String,
    sampling_rate: u64,
}

/// Monotonic counters; exposed through `Snapshot` metrics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AggregatorStats {
    pub records_total: u64,
    pub records_dropped: u64,
    pub records_too_old: u64,
    pub records_in_future: u64,
    pub decode_errors: u64,
}

#[derive(Debug, Default)]
struct State {
    /// Keyed by bucket start, unix milliseconds.
    buckets: BTreeMap<i64, Bucket>,
    exporters: HashMap<String, ExporterState>,
    stats: AggregatorStats,
}

/// One bucket entry flattened into a standalone record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    #[serde(flatten)]
    pub key: FlowKey,
    pub exporter_ip: String,
    pub direction: Direction,
    pub bytes: u64,
    pub packets: u64,
    pub flows: u64,
    pub raw_bytes: u64,
    pub raw_packets: u64,
    pub sampling_rate: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowData {
    pub schema_version: String,
    pub agent_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub exporters: Vec<ExporterState>,
    pub buckets: Vec<FlowEntry>,
    pub summaries: BTreeMap<String, u64>,
    pub metrics: BTreeMap<String, u64>,
}

/// Summed counters of the newest bucket.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlowTotals {
    pub bytes: u64,
    pub packets: u64,
    pub flows: u64,
    pub dropped: u64,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Aggregator {
    bucket_duration: Duration,
    bucket_millis: i64,
    max_buckets: usize,
    max_keys: usize,
    default_sampling_rate: u64,
    stale_millis: i64,
    overrides: HashMap<String, ExporterOverride>,
    decode_errors: AtomicU64,
    state: RwLock<State>,
}

impl Aggregator {
    /// Zero values fall back to defaults, except `max_keys` where 0 means unbounded.
    pub fn new(
        bucket_duration: Duration,
        max_buckets: usize,
        max_keys: usize,
        default_sampling_rate: u64,
        exporters: &[ExporterConfig],
    ) -> Self {
        let bucket_duration = if bucket_duration.is_zero() {
            DEFAULT_BUCKET_DURATION
        } else {
            bucket_duration
        };
        let max_buckets = if max_buckets == 0 {
            DEFAULT_MAX_BUCKETS
        } else {
            max_buckets
        };
        let bucket_millis = duration_millis(bucket_duration).max(1);

        let overrides = exporters
            .iter()
            .map(|exporter| {
                (
                    normalize_ip(&exporter.ip),
                    ExporterOverride {
                        name: exporter.name.clone(),
                        sampling_rate: exporter.sampling_rate,
                    },
                )
            })
            .collect();

        Self {
            bucket_duration,
            bucket_millis,
            max_buckets,
            max_keys,
            default_sampling_rate: default_sampling_rate.max(DEFAULT_SAMPLING_RATE),
            stale_millis: bucket_millis.saturating_mul(max_buckets as i64),
            overrides,
            decode_errors: AtomicU64::new(0),
            state: RwLock::new(State::default()),
        }
    }

    /// Replaces the `max_buckets * bucket_duration` staleness threshold.
    pub fn with_stale_after(mut self, stale_after: Option<Duration>) -> Self {
        if let Some(stale_after) = stale_after
            && !stale_after.is_zero()
        {
            self.stale_millis = duration_millis(stale_after);
        }
        self
    }

    pub fn bucket_duration(&self) -> Duration {
        self.bucket_duration
    }

    pub fn add_records(&self, records: &[FlowRecord]) {
        self.add_records_at(records, Utc::now());
    }

    pub fn add_records_at(&self, records: &[FlowRecord], now: DateTime<Utc>) {
        if records.is_empty() {
            return;
        }

        let now_millis = now.timestamp_millis();
        let oldest_allowed = now_millis.saturating_sub(self.stale_millis);
        // No bucket opens ahead of the one holding `now`.
        let newest_start = self.bucket_start(now_millis);

        let mut guard = self.write();
        let state = &mut *guard;

        for record in records {
            state.stats.records_total += 1;

            let mut timestamp_millis = record.timestamp.timestamp_millis();
            if self.bucket_start(timestamp_millis) < oldest_allowed {
                state.stats.records_too_old += 1;
                timestamp_millis = now_millis;
            } else if self.bucket_start(timestamp_millis) > newest_start {
                state.stats.records_in_future += 1;
                timestamp_millis = now_millis;
            }

            let rate = self.effective_sampling_rate(record);
            let metrics = FlowMetrics::sampled(record, rate);
            let start = self.bucket_start(timestamp_millis);

            if !state.buckets.contains_key(&start) {
                while state.buckets.len() >= self.max_buckets {
                    state.buckets.pop_first();
                }
            }
            let bucket = state.buckets.entry(start).or_default();

            let entry_key = EntryKey {
                key: record.key.clone(),
                exporter_ip: record.exporter_ip.clone(),
                direction: record.direction,
            };
            let at_capacity = self.max_keys > 0 && bucket.entries.len() >= self.max_keys;
            match bucket.entries.get_mut(&entry_key) {
                Some(entry) => {
                    entry.metrics.add(metrics);
                    entry.sampling_rate = rate;
                }
                None if at_capacity => {
                    bucket.dropped += 1;
                    state.stats.records_dropped += 1;
                    continue;
                }
                None => {
                    bucket.entries.insert(
                        entry_key,
                        BucketEntry {
                            metrics,
                            sampling_rate: rate,
                        },
                    );
                }
            }

            if let Some(version) = record.version {
                let exporter = state
                    .exporters
                    .entry(record.exporter_ip.clone())
                    .or_insert_with(|| ExporterState {
                        ip: record.exporter_ip.clone(),
                        name: self
                            .overrides
                            .get(&record.exporter_ip)
                            .map(|o| o.name.clone())
                            .filter(|name| !name.is_empty())
                            .unwrap_or_else(|| record.exporter_ip.clone()),
                        sampling_rate: rate,
                        version: Some(version),
                        last_seen: now,
                    });
                exporter.version = Some(version);
                exporter.sampling_rate = rate;
                exporter.last_seen = now;
            }
        }
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            ..self.read().stats
        }
    }

    pub fn snapshot(&self, agent_id: &str) -> FlowData {
        self.snapshot_at(agent_id, Utc::now())
    }

    /// `now` only matters when no bucket exists yet.
    pub fn snapshot_at(&self, agent_id: &str, now: DateTime<Utc>) -> FlowData {
        let state = self.read();

        let mut buckets = Vec::new();
        let mut totals = FlowMetrics::default();
        let mut total_dropped = 0_u64;
        for (start, bucket) in &state.buckets {
            let timestamp = millis_to_utc(*start);
            total_dropped = total_dropped.saturating_add(bucket.dropped);
            for (key, entry) in &bucket.entries {
                totals.add(entry.metrics);
                buckets.push(FlowEntry {
                    timestamp,
                    duration: self.bucket_duration,
                    key: key.key.clone(),
                    exporter_ip: key.exporter_ip.clone(),
                    direction: key.direction,
                    bytes: entry.metrics.bytes,
                    packets: entry.metrics.packets,
                    flows: entry.metrics.flows,
                    raw_bytes: entry.metrics.raw_bytes,
                    raw_packets: entry.metrics.raw_packets,
                    sampling_rate: entry.sampling_rate,
                });
            }
        }
        buckets.sort_by(|a, b| {
            (a.timestamp, &a.exporter_ip, &a.key, a.direction).cmp(&(
                b.timestamp,
                &b.exporter_ip,
                &b.key,
                b.direction,
            ))
        });

        let (period_start, period_end) = match (
            state.buckets.first_key_value(),
            state.buckets.last_key_value(),
        ) {
            (Some((first, _)), Some((last, _))) => (
                millis_to_utc(*first),
                millis_to_utc(last.saturating_add(self.bucket_millis)),
            ),
            _ => (
                millis_to_utc(now.timestamp_millis().saturating_sub(self.bucket_millis)),
                now,
            ),
        };

        let mut exporters: Vec<ExporterState> = state.exporters.values().cloned().collect();
        exporters.sort_by_key(|exporter| (exporter.ip.parse::<IpAddr>().ok(), exporter.ip.clone()));

        let summaries = BTreeMap::from([
            ("total_bytes".to_string(), totals.bytes),
            ("total_packets".to_string(), totals.packets),
            ("total_flows".to_string(), totals.flows),
            ("total_raw_bytes".to_string(), totals.raw_bytes),
            ("total_raw_packets".to_string(), totals.raw_packets),
            ("total_dropped".to_string(), total_dropped),
        ]);

        let stats = state.stats;
        let metrics = BTreeMap::from([
            ("records_total".to_string(), stats.records_total),
            ("records_dropped".to_string(), stats.records_dropped),
            ("records_too_old".to_string(), stats.records_too_old),
            ("records_in_future".to_string(), stats.records_in_future),
            (
                "decode_errors".to_string(),
                self.decode_errors.load(Ordering::Relaxed),
            ),
            ("exporters".to_string(), exporters.len() as u64),
            ("buckets".to_string(), state.buckets.len() as u64),
        ]);

        FlowData {
            schema_version: SCHEMA_VERSION.to_string(),
            agent_id: agent_id.to_string(),
            period_start,
            period_end,
            exporters,
            buckets,
            summaries,
            metrics,
        }
    }

    pub fn latest_totals(&self) -> FlowTotals {
        let state = self.read();
        let Some((start, bucket)) = state.buckets.last_key_value() else {
            return FlowTotals::default();
        };

        let mut totals = FlowMetrics::default();
        for entry in bucket.entries.values() {
            totals.add(entry.metrics);
        }
        FlowTotals {
            bytes: totals.bytes,
            packets: totals.packets,
            flows: totals.flows,
            dropped: bucket.dropped,
            duration: self.bucket_duration,
            timestamp: millis_to_utc(*start),
        }
    }

    /// Record rate, then exporter override, then the default; never below 1.
    fn effective_sampling_rate(&self, record: &FlowRecord) -> u64 {
        if record.sampling_rate > 0 {
            return record.sampling_rate;
        }
        self.overrides
            .get(&record.exporter_ip)
            .map(|o| o.sampling_rate)
            .filter(|rate| *rate > 0)
            .unwrap_or(self.default_sampling_rate)
            .max(1)
    }

    fn bucket_start(&self, millis: i64) -> i64 {
        millis - millis.rem_euclid(self.bucket_millis)
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn normalize_ip(ip: &str) -> String {
    ip.parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| ip.to_string())
}
