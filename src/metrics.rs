// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{
    counter, describe_counter, describe_histogram, histogram, increment_counter, Unit,
};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
pub enum Unit {
    Count,
    Seconds,
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! increment_counter {
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{counter, describe_counter, describe_histogram, histogram, increment_counter};

use std::time::Duration;

/// Initializes the descriptions for all the metrics in the crate.
/// This should be called once at startup.
pub fn describe_metrics() {
    describe_counter!(
        "cache_hits_total",
        Unit::Count,
        "Keyed cache hits, labeled by component (snapshot, certs)."
    );
    describe_counter!(
        "cache_miss_total",
        Unit::Count,
        "Keyed cache misses, labeled by component (snapshot, certs)."
    );
    describe_counter!(
        "cache_errors_total",
        Unit::Count,
        "Best-effort cache operations that failed and were ignored, labeled by operation."
    );
    describe_counter!(
        "snapshot_writes_total",
        Unit::Count,
        "Snapshots persisted."
    );
    describe_counter!(
        "snapshot_not_modified_total",
        Unit::Count,
        "Conditional snapshot reads answered with not-modified."
    );
    describe_counter!(
        "changelog_skipped_entries_total",
        Unit::Count,
        "Malformed change-log entries skipped while folding."
    );
    describe_counter!(
        "dedup_candidates_total",
        Unit::Count,
        "Notification candidates checked against the dedup set, labeled by outcome (seen, unseen)."
    );
    describe_counter!(
        "cert_fetches_total",
        Unit::Count,
        "Live signing-key fetches, labeled by outcome (ok, error)."
    );
    describe_histogram!(
        "store_query_duration_seconds",
        Unit::Seconds,
        "Backing store listing query latency, labeled by record kind."
    );
}

pub fn increment_cache_hit(component: &'static str) {
    counter!("cache_hits_total", 1, "component" => component);
}

pub fn increment_cache_miss(component: &'static str) {
    counter!("cache_miss_total", 1, "component" => component);
}

pub fn increment_cache_error(operation: &'static str) {
    counter!("cache_errors_total", 1, "operation" => operation);
}

pub fn increment_snapshot_write() {
    increment_counter!("snapshot_writes_total");
}

pub fn increment_snapshot_not_modified() {
    increment_counter!("snapshot_not_modified_total");
}

pub fn increment_changelog_skipped(count: u64) {
    counter!("changelog_skipped_entries_total", count);
}

pub fn record_dedup_outcome(seen: u64, unseen: u64) {
    counter!("dedup_candidates_total", seen, "outcome" => "seen");
    counter!("dedup_candidates_total", unseen, "outcome" => "unseen");
}

pub fn increment_cert_fetch(outcome: &'static str) {
    counter!("cert_fetches_total", 1, "outcome" => outcome);
}

pub fn record_store_query_duration(kind: &'static str, duration: Duration) {
    histogram!("store_query_duration_seconds", duration.as_secs_f64(), "kind" => kind);
}
