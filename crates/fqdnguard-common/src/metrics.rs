//! OpenTelemetry counters
//!
//! Instruments are created lazily against the global meter, so they are
//! no-ops until [`crate::telemetry::init_telemetry`] installs an OTLP
//! provider.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("fqdnguard"));

/// Admission decisions
///
/// Labels:
/// - `operation`: CREATE, UPDATE, DELETE
/// - `decision`: allowed, denied, error
pub static ADMISSION_DECISIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("fqdnguard_admission_decisions_total")
        .with_description("Admission decisions by operation and outcome")
        .with_unit("{decisions}")
        .build()
});

/// Provisional reservations removed by the sweeper
pub static CACHE_EVICTIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("fqdnguard_cache_evictions_total")
        .with_description("Expired provisional reservations evicted from the cache")
        .with_unit("{entries}")
        .build()
});

/// Keys confirmed by the controller
pub static CACHE_CONFIRMATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("fqdnguard_cache_confirmations_total")
        .with_description("Reservations confirmed from observed HTTPProxy objects")
        .with_unit("{entries}")
        .build()
});

/// Finalizer writes rejected with 409 Conflict
pub static FINALIZER_CONFLICTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("fqdnguard_finalizer_conflicts_total")
        .with_description("Finalizer updates that lost an optimistic-concurrency race")
        .with_unit("{conflicts}")
        .build()
});

/// Record one admission decision
pub fn record_admission(operation: &str, decision: &str) {
    ADMISSION_DECISIONS.add(
        1,
        &[
            KeyValue::new("operation", operation.to_string()),
            KeyValue::new("decision", decision.to_string()),
        ],
    );
}
