//! Prometheus metrics for reconciliation health and latency.
//!
//! This module provides metrics for:
//! - Stale diff drops, malformed message drops, orphan buffer overflow
//! - Per-pair queue overflow and reconciler restarts
//! - Reconnection-triggered resnapshots and snapshot fetches
//! - Message apply latency and feed lag

use std::time::Instant;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use tracing::debug;

// === Metric Name Constants ===

/// Message apply latency metric name.
pub const METRIC_APPLY_LATENCY: &str = "book_apply_latency_ms";
/// Feed lag (receipt to apply) metric name.
pub const METRIC_MESSAGE_LAG: &str = "feed_message_lag_ms";
/// Snapshot fetch latency metric name.
pub const METRIC_SNAPSHOT_FETCH_LATENCY: &str = "snapshot_fetch_latency_ms";
/// Messages routed counter metric name.
pub const METRIC_MESSAGES_ROUTED: &str = "messages_routed_total";
/// Messages orphan-buffered counter metric name.
pub const METRIC_MESSAGES_ORPHANED: &str = "messages_orphaned_total";
/// Stale diffs dropped counter metric name.
pub const METRIC_STALE_DIFFS: &str = "stale_diffs_dropped_total";
/// Malformed messages dropped counter metric name.
pub const METRIC_MALFORMED_MESSAGES: &str = "malformed_messages_dropped_total";
/// Orphan buffer overflow counter metric name.
pub const METRIC_ORPHAN_OVERFLOW: &str = "orphan_buffer_overflow_total";
/// Past-diffs window overflow counter metric name.
pub const METRIC_PAST_DIFFS_OVERFLOW: &str = "past_diffs_overflow_total";
/// Queue overflow counter metric name.
pub const METRIC_QUEUE_OVERFLOW: &str = "pair_queue_overflow_total";
/// Resnapshot counter metric name.
pub const METRIC_RESNAPSHOTS: &str = "resnapshots_total";
/// Snapshot fetch failures counter metric name.
pub const METRIC_SNAPSHOT_FAILURES: &str = "snapshot_fetch_failures_total";
/// Reconciler restarts counter metric name.
pub const METRIC_RECONCILER_RESTARTS: &str = "reconciler_restarts_total";
/// Trades forwarded counter metric name.
pub const METRIC_TRADES_FORWARDED: &str = "trades_forwarded_total";
/// Feed reconnects counter metric name.
pub const METRIC_FEED_RECONNECTS: &str = "feed_reconnects_total";

/// Initialize all metric descriptions.
/// Call this once at startup to register metrics with descriptions.
pub fn init_metrics() {
    describe_histogram!(
        METRIC_APPLY_LATENCY,
        "Time to apply one message to a book in milliseconds"
    );
    describe_histogram!(
        METRIC_MESSAGE_LAG,
        "Time between message receipt and application in milliseconds"
    );
    describe_histogram!(
        METRIC_SNAPSHOT_FETCH_LATENCY,
        "Snapshot fetch latency in milliseconds"
    );

    describe_counter!(METRIC_MESSAGES_ROUTED, "Messages delivered to pair queues");
    describe_counter!(
        METRIC_MESSAGES_ORPHANED,
        "Messages buffered for pairs not yet registered"
    );
    describe_counter!(METRIC_STALE_DIFFS, "Diffs dropped as stale");
    describe_counter!(METRIC_MALFORMED_MESSAGES, "Malformed messages dropped");
    describe_counter!(
        METRIC_ORPHAN_OVERFLOW,
        "Orphan-buffered messages dropped on overflow"
    );
    describe_counter!(
        METRIC_PAST_DIFFS_OVERFLOW,
        "Buffered pre-snapshot diffs dropped on overflow"
    );
    describe_counter!(METRIC_QUEUE_OVERFLOW, "Messages dropped on full pair queues");
    describe_counter!(METRIC_RESNAPSHOTS, "Snapshot refetches by cause");
    describe_counter!(METRIC_SNAPSHOT_FAILURES, "Failed snapshot fetch attempts");
    describe_counter!(
        METRIC_RECONCILER_RESTARTS,
        "Reconcilers restarted after a fatal error"
    );
    describe_counter!(METRIC_TRADES_FORWARDED, "Trades forwarded to subscribers");
    describe_counter!(METRIC_FEED_RECONNECTS, "Feed reconnections");

    debug!("Metrics initialized");
}

/// Record feed lag for a message about to be applied.
pub fn record_message_lag(lag_ms: f64) {
    histogram!(METRIC_MESSAGE_LAG).record(lag_ms);
}

/// Record snapshot fetch latency.
pub fn record_snapshot_fetch_latency(start: Instant, trading_pair: &str) {
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
    histogram!(METRIC_SNAPSHOT_FETCH_LATENCY, "trading_pair" => trading_pair.to_string())
        .record(latency_ms);
}

/// Increment messages routed counter.
pub fn inc_messages_routed() {
    counter!(METRIC_MESSAGES_ROUTED).increment(1);
}

/// Increment messages orphaned counter.
pub fn inc_messages_orphaned() {
    counter!(METRIC_MESSAGES_ORPHANED).increment(1);
}

/// Increment stale diffs counter.
pub fn inc_stale_diffs(trading_pair: &str) {
    counter!(METRIC_STALE_DIFFS, "trading_pair" => trading_pair.to_string()).increment(1);
}

/// Increment malformed messages counter.
pub fn inc_malformed_messages(source: &'static str) {
    counter!(METRIC_MALFORMED_MESSAGES, "source" => source).increment(1);
}

/// Add to the orphan overflow counter.
pub fn inc_orphan_overflow(trading_pair: &str, dropped: u64) {
    counter!(METRIC_ORPHAN_OVERFLOW, "trading_pair" => trading_pair.to_string())
        .increment(dropped);
}

/// Increment past-diffs overflow counter.
pub fn inc_past_diffs_overflow(trading_pair: &str) {
    counter!(METRIC_PAST_DIFFS_OVERFLOW, "trading_pair" => trading_pair.to_string())
        .increment(1);
}

/// Increment queue overflow counter.
pub fn inc_queue_overflow(trading_pair: &str) {
    counter!(METRIC_QUEUE_OVERFLOW, "trading_pair" => trading_pair.to_string()).increment(1);
}

/// Increment resnapshot counter.
pub fn inc_resnapshots(reason: &'static str) {
    counter!(METRIC_RESNAPSHOTS, "reason" => reason).increment(1);
}

/// Increment snapshot failures counter.
pub fn inc_snapshot_failures() {
    counter!(METRIC_SNAPSHOT_FAILURES).increment(1);
}

/// Increment reconciler restarts counter.
pub fn inc_reconciler_restarts(trading_pair: &str) {
    counter!(METRIC_RECONCILER_RESTARTS, "trading_pair" => trading_pair.to_string())
        .increment(1);
}

/// Increment trades forwarded counter.
pub fn inc_trades_forwarded() {
    counter!(METRIC_TRADES_FORWARDED).increment(1);
}

/// Increment feed reconnects counter.
pub fn inc_feed_reconnects() {
    counter!(METRIC_FEED_RECONNECTS).increment(1);
}

/// RAII guard for timing operations.
/// Automatically records latency when dropped.
pub struct LatencyTimer {
    start: Instant,
    metric_name: &'static str,
}

impl LatencyTimer {
    /// Create a new latency timer for the given metric.
    pub fn new(metric_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            metric_name,
        }
    }

    /// Get elapsed time in milliseconds (without recording).
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        let latency_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        histogram!(self.metric_name).record(latency_ms);
    }
}

/// Create a latency timer for applying one message.
pub fn timer_apply() -> LatencyTimer {
    LatencyTimer::new(METRIC_APPLY_LATENCY)
}
