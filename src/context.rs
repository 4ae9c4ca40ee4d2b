//! # Core Context
//!
//! Process-wide state shared by the registry, the pending table and the
//! planner: the smoothed typical priority, the cover-traffic counters, the
//! average peer latency, the load estimators and the observability counters.
//!
//! One context exists per node and is owned by the dispatch actor, which is
//! its only writer. Components receive it by reference.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::FsConfig;
use crate::identity::Identity;
use crate::load::{LoadValue, LoadVerdict};

/// Seconds of TTL each unit of priority buys.
pub const TTL_PER_PRIORITY: Duration = Duration::from_secs(5);

/// Largest TTL (seconds) a query may carry after bounding.
pub const MAX_BOUNDED_TTL: i64 = 1 << 30;

/// Per-sample ceiling for the average latency fold.
pub const MAX_LATENCY_SAMPLE: Duration = Duration::from_secs(5);

/// Largest contribution a single charge makes above the typical priority.
const TYPICAL_PRIORITY_SLACK: f64 = 128.0;

/// Weight of the previous typical priority (`N - 1` of `N`).
const TYPICAL_PRIORITY_WEIGHT: f64 = 128.0;

/// Put-load averages (ms) below this never count as too high.
const PUT_LOAD_FREE_AVERAGE: f64 = 50.0;

/// Observability counters. Monotonic except where noted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    pub queries_received: u64,
    pub queries_dropped_load: u64,
    pub queries_dropped_queue: u64,
    pub queries_dropped_ttl: u64,
    pub queries_dropped_unknown_peer: u64,
    pub queries_merged: u64,
    pub queries_indirected: u64,
    pub queries_sent: u64,
    pub content_received: u64,
    pub content_duplicate: u64,
    pub content_irrelevant: u64,
    pub content_invalid: u64,
    pub content_cached: u64,
    pub protocol_violations: u64,
    pub replies_to_clients: u64,
    pub replies_to_peers: u64,
    pub replies_dropped_cover: u64,
    pub replies_delayed: u64,
    pub requests_evicted: u64,
    pub requests_expired: u64,
    pub local_results: u64,
    pub dht_results: u64,
    pub cadet_results: u64,
    pub migration_stops_sent: u64,
    pub migration_stops_received: u64,
}

/// Snapshot of process-wide routing state.
#[derive(Clone, Debug, PartialEq)]
pub struct Telemetry {
    pub local: Identity,
    pub connected_peers: usize,
    pub pending_requests: usize,
    pub expiring_requests: usize,
    pub plans: usize,
    pub typical_priority: f64,
    pub cover_query_count: u32,
    pub cover_content_count: u32,
    pub avg_latency: Duration,
    pub datastore_get_load: f64,
    pub datastore_put_load: f64,
    pub counters: Counters,
}

#[derive(Debug)]
pub struct CoreContext {
    pub config: FsConfig,
    pub local: Identity,
    /// Smoothed priority of recently charged queries.
    pub typical_priority: f64,
    /// Queries received that may serve as cover for our own.
    pub cover_query_count: u32,
    /// Content received that may serve as cover for our replies.
    pub cover_content_count: u32,
    pub avg_latency: Duration,
    /// Fed with local lookup durations (ms).
    pub datastore_get_load: LoadValue,
    /// Fed with datastore put durations (ms).
    pub datastore_put_load: LoadValue,
    /// Fed with lifetimes (ms) of requests that found their last result.
    pub request_lifetime: LoadValue,
    /// Moving average (µs) of plan delays; shared by all peers.
    pub planner_avg_delay: f64,
    pub counters: Counters,
}

impl CoreContext {
    pub fn new(config: FsConfig, local: Identity) -> Self {
        Self {
            config,
            local,
            typical_priority: 0.0,
            cover_query_count: 0,
            cover_content_count: 0,
            avg_latency: Duration::from_millis(500),
            datastore_get_load: LoadValue::new(),
            datastore_put_load: LoadValue::new(),
            request_lifetime: LoadValue::new(),
            planner_avg_delay: 0.0,
            counters: Counters::default(),
        }
    }

    /// Admission verdict for a datastore lookup at `priority`.
    pub fn test_get_load(&self, priority: u32) -> LoadVerdict {
        LoadVerdict::classify(self.datastore_get_load.load(), priority)
    }

    /// Whether a datastore write at `priority` should be skipped.
    pub fn put_load_too_high(&self, priority: u32) -> bool {
        if self.datastore_put_load.average() < PUT_LOAD_FREE_AVERAGE {
            return false;
        }
        self.datastore_put_load.load() >= 2.0 * (1.0 + priority as f64)
    }

    /// Record how long a datastore put took.
    pub fn record_put_duration(&mut self, started: Instant, now: Instant) {
        let ms = now.saturating_duration_since(started).as_millis();
        self.datastore_put_load.update(u64::try_from(ms).unwrap_or(u64::MAX));
    }

    pub fn record_get_duration(&mut self, started: Instant, now: Instant) {
        let ms = now.saturating_duration_since(started).as_millis();
        self.datastore_get_load.update(u64::try_from(ms).unwrap_or(u64::MAX));
    }

    pub fn record_request_lifetime(&mut self, started: Instant, now: Instant) {
        let ms = now.saturating_duration_since(started).as_millis();
        self.request_lifetime.update(u64::try_from(ms).unwrap_or(u64::MAX));
    }

    /// Fold a charged priority into the typical-priority estimate.
    pub fn fold_typical_priority(&mut self, charge: u32) {
        let sample = (charge as f64).min(self.typical_priority + TYPICAL_PRIORITY_SLACK);
        self.typical_priority = (self.typical_priority * (TYPICAL_PRIORITY_WEIGHT - 1.0) + sample)
            / TYPICAL_PRIORITY_WEIGHT;
    }

    /// Fold a latency report into the average peer latency.
    pub fn update_latency(&mut self, sample: Duration) {
        let sample = sample.min(MAX_LATENCY_SAMPLE);
        self.avg_latency = (self.avg_latency * 31 + sample) / 32;
    }

    /// Decay both cover-traffic counters by 15/16.
    pub fn age_cover_counters(&mut self) {
        self.cover_query_count = (self.cover_query_count as u64 * 15 / 16) as u32;
        self.cover_content_count = (self.cover_content_count as u64 * 15 / 16) as u32;
    }

    /// Cap a relative TTL (seconds) by what `priority` pays for.
    pub fn bound_ttl(ttl: i32, priority: u32) -> i32 {
        if ttl <= 0 {
            return ttl;
        }
        let allowed = priority as i64 * TTL_PER_PRIORITY.as_secs() as i64;
        let allowed = allowed.min(MAX_BOUNDED_TTL);
        (ttl as i64).min(allowed) as i32
    }
}
