//! Metrics for the request lifecycle.
//!
//! Counters are recorded through the [`metrics`] facade. The library installs
//! no recorder: applications pick an exporter and call [`describe_metrics`]
//! once to register descriptions.
//!
//! | name | labels |
//! |---|---|
//! | `fetchline_operations_applied_total` | `op` |
//! | `fetchline_operations_dropped_total` | `op` |
//! | `fetchline_fetch_started_total` | |
//! | `fetchline_fetch_deduplicated_total` | |
//! | `fetchline_requests_evicted_total` | |
//! | `fetchline_retries_scheduled_total` | |

use fetchline_core::OperationKind;
use metrics::{counter, describe_counter};

/// Operations that passed the status gate and ran through the pipeline.
pub const OPERATIONS_APPLIED: &str = "fetchline_operations_applied_total";
/// Operations dropped by the status gate.
pub const OPERATIONS_DROPPED: &str = "fetchline_operations_dropped_total";
/// Producers started by the fetch plugin.
pub const FETCH_STARTED: &str = "fetchline_fetch_started_total";
/// Fetches ignored because the request was already in flight.
pub const FETCH_DEDUPLICATED: &str = "fetchline_fetch_deduplicated_total";
/// Cache entries disposed by the garbage collector.
pub const REQUESTS_EVICTED: &str = "fetchline_requests_evicted_total";
/// Retries scheduled by the retry plugin.
pub const RETRIES_SCHEDULED: &str = "fetchline_retries_scheduled_total";

/// Register descriptions for every counter.
pub fn describe_metrics() {
    describe_counter!(
        OPERATIONS_APPLIED,
        "Total number of operations dispatched through the pipeline"
    );
    describe_counter!(
        OPERATIONS_DROPPED,
        "Total number of operations dropped because they would not change status"
    );
    describe_counter!(FETCH_STARTED, "Total number of producers started");
    describe_counter!(
        FETCH_DEDUPLICATED,
        "Total number of fetches ignored because the request was in flight"
    );
    describe_counter!(
        REQUESTS_EVICTED,
        "Total number of cache entries removed by garbage collection"
    );
    describe_counter!(RETRIES_SCHEDULED, "Total number of retries scheduled");
}

/// Client metrics recorder.
pub struct ClientMetrics;

impl ClientMetrics {
    /// Record an operation that went through the pipeline.
    pub fn record_applied(kind: OperationKind) {
        counter!(OPERATIONS_APPLIED, "op" => kind.as_str()).increment(1);
    }

    /// Record an operation dropped by the status gate.
    pub fn record_dropped(kind: OperationKind) {
        counter!(OPERATIONS_DROPPED, "op" => kind.as_str()).increment(1);
    }

    /// Record a garbage-collected entry.
    pub fn record_evicted() {
        counter!(REQUESTS_EVICTED).increment(1);
    }
}

/// Fetch plugin metrics recorder.
pub struct FetchMetrics;

impl FetchMetrics {
    /// Record a started producer.
    pub fn record_started() {
        counter!(FETCH_STARTED).increment(1);
    }

    /// Record a deduplicated fetch.
    pub fn record_deduplicated() {
        counter!(FETCH_DEDUPLICATED).increment(1);
    }
}

/// Retry plugin metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a scheduled retry.
    pub fn record_scheduled(attempt: u32) {
        counter!(RETRIES_SCHEDULED).increment(1);
        tracing::trace!(attempt, "Retry recorded");
    }
}
