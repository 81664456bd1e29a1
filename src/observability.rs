use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "boxoffice_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "boxoffice_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "boxoffice_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "boxoffice_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "boxoffice_connections_rejected_total";

/// Gauge: number of open businesses (loaded engines).
pub const TENANTS_ACTIVE: &str = "boxoffice_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "boxoffice_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "boxoffice_wal_flush_batch_size";

// ── Ledger metrics ──────────────────────────────────────────────

/// Counter: checkout holds placed.
pub const HOLDS_PLACED_TOTAL: &str = "boxoffice_holds_placed_total";

/// Counter: holds released by the reaper after expiring.
pub const HOLDS_EXPIRED_TOTAL: &str = "boxoffice_holds_expired_total";

/// Counter: bookings confirmed, from a hold or directly.
pub const BOOKINGS_CONFIRMED_TOTAL: &str = "boxoffice_bookings_confirmed_total";

/// Counter: bookings cancelled.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "boxoffice_bookings_cancelled_total";

/// Counter: holds or bookings refused for lack of seats.
pub const CAPACITY_REJECTIONS_TOTAL: &str = "boxoffice_capacity_rejections_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertExperience { .. } => "insert_experience",
        Command::UpdateExperience { .. } => "update_experience",
        Command::DeleteExperience { .. } => "delete_experience",
        Command::InsertTicketType { .. } => "insert_ticket_type",
        Command::UpdateTicketType { .. } => "update_ticket_type",
        Command::DeleteTicketType { .. } => "delete_ticket_type",
        Command::InsertEvent { .. } => "insert_event",
        Command::DeleteEvent { .. } => "delete_event",
        Command::InsertSession { .. } => "insert_session",
        Command::UpdateSessionCapacity { .. } => "update_session_capacity",
        Command::CancelSession { .. } => "cancel_session",
        Command::DeleteSession { .. } => "delete_session",
        Command::InsertGuest { .. } => "insert_guest",
        Command::UpdateGuest { .. } => "update_guest",
        Command::DeleteGuest { .. } => "delete_guest",
        Command::InsertHold { .. } => "insert_hold",
        Command::DeleteHold { .. } => "delete_hold",
        Command::ConfirmHold { .. } => "confirm_hold",
        Command::InsertBooking { .. } => "insert_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::SelectExperiences { .. } => "select_experiences",
        Command::SelectTicketTypes { .. } => "select_ticket_types",
        Command::SelectEvents { .. } => "select_events",
        Command::SelectSessions { .. } => "select_sessions",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectHolds { .. } => "select_holds",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectGuests { .. } => "select_guests",
        Command::SelectSummary => "select_summary",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
