use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::engine::{ConflictKind, EngineError};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "slotlock_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "slotlock_http_request_duration_seconds";

/// Counter: engine errors returned to callers. Labels: kind.
pub const ERRORS_TOTAL: &str = "slotlock_errors_total";

// ── Lease table ─────────────────────────────────────────────────

/// Counter: leases granted.
pub const LEASES_ACQUIRED_TOTAL: &str = "slotlock_leases_acquired_total";

/// Counter: acquire attempts refused. Labels: reason (held, booked).
pub const LEASE_CONFLICTS_TOTAL: &str = "slotlock_lease_conflicts_total";

/// Counter: leases removed by their owner. Labels: reason (explicit, session_lost).
pub const LEASES_RELEASED_TOTAL: &str = "slotlock_leases_released_total";

/// Counter: leases dropped after their TTL ran out.
pub const LEASES_EXPIRED_TOTAL: &str = "slotlock_leases_expired_total";

/// Gauge: leases currently in the table.
pub const LEASES_ACTIVE: &str = "slotlock_leases_active";

/// Counter: promotion attempts. Labels: outcome (created, held, booked, rejected).
pub const PROMOTIONS_TOTAL: &str = "slotlock_promotions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: connected real-time sessions.
pub const SESSIONS_ACTIVE: &str = "slotlock_sessions_active";

/// Counter: real-time sessions accepted.
pub const SESSIONS_TOTAL: &str = "slotlock_sessions_total";

/// Counter: sessions refused due to the session limit.
pub const SESSIONS_REJECTED_TOTAL: &str = "slotlock_sessions_rejected_total";

/// Counter: times a subscriber fell behind and was resynchronised.
pub const SUBSCRIBER_LAGS_TOTAL: &str = "slotlock_subscriber_lags_total";

/// Counter: operator requests refused for a missing or wrong token.
pub const AUTH_FAILURES_TOTAL: &str = "slotlock_auth_failures_total";

/// Histogram: booking WAL group-commit flush duration in seconds.
pub const STORE_FLUSH_DURATION_SECONDS: &str = "slotlock_store_flush_duration_seconds";

/// Histogram: booking WAL group-commit batch size (records per flush).
pub const STORE_FLUSH_BATCH_SIZE: &str = "slotlock_store_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map an engine error to a short label for metrics.
pub fn error_label(err: &EngineError) -> &'static str {
    match err {
        EngineError::Conflict(ConflictKind::HeldByOtherSession) => "conflict_held",
        EngineError::Conflict(ConflictKind::AlreadyBooked) => "conflict_booked",
        EngineError::NotFound(_) => "not_found",
        EngineError::Validation(_) => "validation",
        EngineError::LimitExceeded(_) => "limit_exceeded",
        EngineError::StoreUnavailable(_) => "store_unavailable",
    }
}
