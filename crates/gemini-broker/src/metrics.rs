//! Broker metrics
//!
//! Counters emitted through the `metrics` facade:
//!
//! - `broker_acquire_total` (counter): label `outcome`
//! - `broker_failures_total` (counter): label `kind`
//! - `broker_keys_retired_total` (counter)
//!
//! The embedding process decides whether to install a recorder; without
//! one, these calls are no-ops.

/// Record an acquire call's outcome.
pub(crate) fn record_acquire(outcome: &'static str) {
    metrics::counter!("broker_acquire_total", "outcome" => outcome).increment(1);
}

/// Record a reported failure.
pub(crate) fn record_failure(kind: &'static str) {
    metrics::counter!("broker_failures_total", "kind" => kind).increment(1);
}

/// Record a key leaving the pool for good.
pub(crate) fn record_retirement() {
    metrics::counter!("broker_keys_retired_total").increment(1);
}
