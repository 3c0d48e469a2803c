use std::net::SocketAddr;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking requests. Labels: outcome.
pub const BOOKINGS_TOTAL: &str = "slotguard_bookings_total";

/// Histogram: end-to-end booking latency in seconds, lock wait included.
pub const BOOKING_DURATION_SECONDS: &str = "slotguard_booking_duration_seconds";

/// Counter: status transitions. Labels: to, outcome.
pub const TRANSITIONS_TOTAL: &str = "slotguard_transitions_total";

/// Counter: reschedule requests. Labels: outcome.
pub const RESCHEDULES_TOTAL: &str = "slotguard_reschedules_total";

/// Counter: availability publishes. Labels: outcome.
pub const PUBLISHES_TOTAL: &str = "slotguard_publishes_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: time spent queueing for a provider lock, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "slotguard_lock_wait_seconds";

/// Counter: optimistic-concurrency conflicts reported by the repository.
pub const REPOSITORY_CONFLICTS_TOTAL: &str = "slotguard_repository_conflicts_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotguard_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotguard_wal_flush_batch_size";

/// Counter: WAL compactions run.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotguard_wal_compactions_total";

/// Install the fmt tracing subscriber (honours `RUST_LOG`). Safe to call twice.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().try_init();
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map an outcome to a short label for metrics.
pub fn outcome_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => error_label(e),
    }
}

pub fn error_label(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidInterval { .. } => "invalid_interval",
        EngineError::InvalidSlotSet(_) => "invalid_slot_set",
        EngineError::NoAvailability => "no_availability",
        EngineError::SlotFull => "slot_full",
        EngineError::IllegalTransition { .. } => "illegal_transition",
        EngineError::TimeConstraintViolated { .. } => "time_constraint_violated",
        EngineError::NotFound(_) => "not_found",
        EngineError::Conflict(_) => "conflict",
        EngineError::LockTimeout => "lock_timeout",
        EngineError::LimitExceeded(_) => "limit_exceeded",
        EngineError::Storage(_) => "storage",
    }
}
