use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "vetbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "vetbook_query_duration_seconds";

/// Counter: bookings turned away by a rule. Labels: reason.
pub const BOOKINGS_REJECTED_TOTAL: &str = "vetbook_bookings_rejected_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: appointments held in memory, any status.
pub const APPOINTMENTS_STORED: &str = "vetbook_appointments_stored";

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "vetbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "vetbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "vetbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "vetbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "vetbook_wal_flush_batch_size";

/// Counter: WAL compactions run by the background compactor.
pub const WAL_COMPACTIONS_TOTAL: &str = "vetbook_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
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
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::UpdateAppointment { .. } => "update_appointment",
        Command::CancelAppointment { .. } => "cancel_appointment",
        Command::SelectAppointments { id: Some(_) } => "select_appointment",
        Command::SelectAppointments { id: None } => "select_appointments",
        Command::SelectCancelled { .. } => "select_cancelled",
        Command::SelectAgenda { .. } => "select_agenda",
        Command::SelectSuggestion { .. } => "select_suggestion",
        Command::SelectVeterinarians => "select_veterinarians",
        Command::SelectSpecies => "select_species",
    }
}
