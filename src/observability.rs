use std::net::SocketAddr;

use crate::api::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests executed. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "stayd_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "stayd_request_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "stayd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "stayd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "stayd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "stayd_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "stayd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "stayd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "stayd_wal_flush_batch_size";

// ── Sweeper metrics ─────────────────────────────────────────────

/// Counter: holds cancelled because their TTL lapsed.
pub const HOLDS_EXPIRED_TOTAL: &str = "stayd_holds_expired_total";

/// Counter: stays promoted to completed by the lifecycle sweeper.
pub const STAYS_COMPLETED_TOTAL: &str = "stayd_stays_completed_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Request variant to a short label for metrics.
pub fn request_label(req: &Request) -> &'static str {
    match req {
        Request::RegisterUnit { .. } => "register_unit",
        Request::UpdateUnit { .. } => "update_unit",
        Request::RemoveUnit { .. } => "remove_unit",
        Request::SetUnitStatus { .. } => "set_unit_status",
        Request::ListUnits => "list_units",
        Request::GetUnit { .. } => "get_unit",
        Request::CreateReservation { .. } => "create_reservation",
        Request::CancelReservation { .. } => "cancel_reservation",
        Request::ConfirmReservation { .. } => "confirm_reservation",
        Request::FailReservation { .. } => "fail_reservation",
        Request::GetReservation { .. } => "get_reservation",
        Request::ListReservations { .. } => "list_reservations",
        Request::CheckAvailability { .. } => "check_availability",
        Request::OccupancyRate { .. } => "occupancy_rate",
        Request::FreeRanges { .. } => "free_ranges",
        Request::CalendarDays { .. } => "calendar_days",
        Request::BlockDays { .. } => "block_days",
        Request::UnblockDays { .. } => "unblock_days",
        Request::SeedCalendar { .. } => "seed_calendar",
        Request::RunExpirySweep => "run_expiry_sweep",
        Request::RunLifecycleSweep { .. } => "run_lifecycle_sweep",
        Request::Listen { .. } => "listen",
        Request::Unlisten { .. } => "unlisten",
        Request::UnlistenAll => "unlisten_all",
    }
}
