use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── Requests ────────────────────────────────────────────────────

/// Counter: queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotwise_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotwise_query_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: booking attempts. Labels: outcome.
pub const BOOKINGS_TOTAL: &str = "slotwise_bookings_total";

/// Counter: cancellation attempts. Labels: outcome.
pub const CANCELLATIONS_TOTAL: &str = "slotwise_cancellations_total";

/// Counter: completion attempts. Labels: outcome.
pub const COMPLETIONS_TOTAL: &str = "slotwise_completions_total";

/// Counter: timeslots excluded because their date is a holiday.
pub const HOLIDAY_TRANSITIONS_TOTAL: &str = "slotwise_holiday_transitions_total";

/// Counter: availability queries that fell back after a failed lookup. Labels: lookup.
pub const LOOKUP_FALLBACKS_TOTAL: &str = "slotwise_lookup_fallbacks_total";

/// Gauge: timeslots created by the last schedule load.
pub const SCHEDULE_TIMESLOTS: &str = "slotwise_schedule_timeslots";

// ── Connections ─────────────────────────────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "slotwise_connections_active";
pub const CONNECTIONS_TOTAL: &str = "slotwise_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotwise_connections_rejected_total";

// ── WAL ─────────────────────────────────────────────────────────

/// Histogram: group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotwise_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotwise_wal_flush_batch_size";

/// Counter: completed compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotwise_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op without a port.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertUser { .. } => "insert_user",
        Command::InsertDelivery { .. } => "insert_delivery",
        Command::DeleteDelivery { .. } => "delete_delivery",
        Command::CompleteDelivery { .. } => "complete_delivery",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectDeliveries { .. } => "select_deliveries",
        Command::SelectTimeslots { .. } => "select_timeslots",
    }
}
