// Metric names and descriptions for lock operations
// Recording is a no-op until the host application installs a recorder

use metrics::{describe_counter, describe_gauge};

pub const ACQUIRE_TOTAL: &str = "dlock_acquire_total";
pub const ACQUIRE_TIMEOUT_TOTAL: &str = "dlock_acquire_timeout_total";
pub const RELEASE_TOTAL: &str = "dlock_release_total";
pub const LEASE_RENEWALS_TOTAL: &str = "dlock_lease_renewals_total";
pub const LEASE_LOST_TOTAL: &str = "dlock_lease_lost_total";
pub const QUEUE_WAITERS: &str = "dlock_queue_waiters";

/// Register metric descriptions. Call once at startup, after installing a recorder.
pub fn describe_metrics() {
    describe_counter!(ACQUIRE_TOTAL, "Total number of successful lock acquisitions");
    describe_counter!(
        ACQUIRE_TIMEOUT_TOTAL,
        "Total number of try_lock calls that ran out of wait budget"
    );
    describe_counter!(RELEASE_TOTAL, "Total number of release calls by outcome");
    describe_counter!(LEASE_RENEWALS_TOTAL, "Total number of successful lease renewals");
    describe_counter!(
        LEASE_LOST_TOTAL,
        "Total number of leases lost to expiry or a competing owner"
    );
    describe_gauge!(QUEUE_WAITERS, "Number of callers waiting in a lock queue");
}

pub(crate) fn record_acquire(backend: &'static str) {
    metrics::counter!(ACQUIRE_TOTAL, "backend" => backend).increment(1);
}

pub(crate) fn record_timeout(backend: &'static str) {
    metrics::counter!(ACQUIRE_TIMEOUT_TOTAL, "backend" => backend).increment(1);
}

pub(crate) fn record_release(backend: &'static str, released: bool) {
    let outcome = if released { "released" } else { "not_held" };
    metrics::counter!(RELEASE_TOTAL, "backend" => backend, "outcome" => outcome).increment(1);
}
