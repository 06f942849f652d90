use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const STATEMENTS_TOTAL: &str = "reservd_statements_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const STATEMENT_DURATION_SECONDS: &str = "reservd_statement_duration_seconds";

/// Counter: reservation writes refused by the validator. Labels: reason.
pub const RESERVATION_REJECTIONS_TOTAL: &str = "reservd_reservation_rejections_total";

/// Counter: rejected credentials. Labels: scheme.
pub const AUTH_FAILURES_TOTAL: &str = "reservd_auth_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "reservd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "reservd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "reservd_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "reservd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "reservd_wal_flush_batch_size";

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
        Command::SetCredential { .. } | Command::SetOther { .. } => "set",
        Command::InsertReservation(_) => "insert_reservation",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectReservation { .. } => "select_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::InsertSource { .. } => "insert_source",
        Command::UpdateSource { .. } => "update_source",
        Command::DeleteSource { .. } => "delete_source",
        Command::SelectSource { .. } => "select_source",
        Command::SelectSources { .. } => "select_sources",
        Command::InsertCustomer { .. } => "insert_customer",
        Command::UpdateCustomer { .. } => "update_customer",
        Command::DeleteCustomer { .. } => "delete_customer",
        Command::SelectCustomer { .. } => "select_customer",
        Command::SelectCustomers { .. } => "select_customers",
        Command::IssueSecret { .. } => "issue_secret",
        Command::IssueToken { .. } => "issue_token",
    }
}
