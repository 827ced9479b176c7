use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "chargeslot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "chargeslot_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "chargeslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "chargeslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "chargeslot_connections_rejected_total";

/// Gauge: number of open marketplaces (loaded engines).
pub const TENANTS_ACTIVE: &str = "chargeslot_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "chargeslot_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "chargeslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "chargeslot_wal_flush_batch_size";

// ── Scheduling ──────────────────────────────────────────────────

/// Counter: bookings accepted. Labels: status (pending or confirmed).
pub const BOOKINGS_CREATED_TOTAL: &str = "chargeslot_bookings_created_total";

/// Counter: caller-invoked lifecycle actions applied. Labels: kind.
pub const TRANSITIONS_TOTAL: &str = "chargeslot_transitions_total";

/// Counter: time-driven transitions written by reconciliation. Labels: kind.
pub const RECONCILED_TOTAL: &str = "chargeslot_reconciled_total";

/// Install the `fmt` subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertStation { .. } => "insert_station",
        Command::UpdateStation { .. } => "update_station",
        Command::DeleteStation { .. } => "delete_station",
        Command::InsertWindow { .. } => "insert_window",
        Command::DeleteWindow { .. } => "delete_window",
        Command::InsertBooking { .. } => "insert_booking",
        Command::BookingAction { .. } => "booking_action",
        Command::ReportIssue { .. } => "report_issue",
        Command::LeaveFeedback { .. } => "leave_feedback",
        Command::SelectStations { .. } => "select_stations",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectFreeSlots { .. } => "select_free_slots",
        Command::SelectLiveStatus { .. } => "select_live_status",
        Command::SelectQueue { .. } => "select_queue",
    }
}
