use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "fieldbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "fieldbook_query_duration_seconds";

// ── Booking lifecycle ───────────────────────────────────────────

/// Counter: reservations admitted.
pub const BOOKINGS_CREATED_TOTAL: &str = "fieldbook_bookings_created_total";

/// Counter: booking requests refused because the window overlapped.
pub const BOOKING_CONFLICTS_TOTAL: &str = "fieldbook_booking_conflicts_total";

/// Counter: status transitions. Labels: to.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "fieldbook_booking_transitions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "fieldbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "fieldbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "fieldbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "fieldbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "fieldbook_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "fieldbook_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertField { .. } => "insert_field",
        Command::UpdateField { .. } => "update_field",
        Command::DeleteField { .. } => "delete_field",
        Command::SelectFields(_) => "select_fields",
        Command::SetupSchedules { .. } => "setup_schedules",
        Command::SelectSchedules { .. } => "select_schedules",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::InsertBooking(_) => "insert_booking",
        Command::SelectBookings(_) => "select_bookings",
        Command::ConfirmBooking { .. } => "confirm_booking",
        Command::CompleteBooking { .. } => "complete_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::SelectPayments(_) => "select_payments",
        Command::SettlePayment { .. } => "settle_payment",
    }
}
