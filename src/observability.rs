use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "studiodb_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "studiodb_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "studiodb_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "studiodb_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "studiodb_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "studiodb_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "studiodb_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "studiodb_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "studiodb_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "studiodb_wal_compactions_total";

// ── Units of work ───────────────────────────────────────────────

/// Counter: committed units of work.
pub const TRANSACTIONS_TOTAL: &str = "studiodb_transactions_total";

/// Histogram: events per committed unit of work.
pub const TRANSACTION_EVENTS: &str = "studiodb_transaction_events";

/// Counter: row lock waits that timed out. Labels: row.
pub const LOCK_TIMEOUTS_TOTAL: &str = "studiodb_lock_timeouts_total";

/// Counter: writes rejected by a calendar conflict. Labels: resource.
pub const CONFLICTS_TOTAL: &str = "studiodb_conflicts_total";

// ── Booking and ledger ──────────────────────────────────────────

/// Counter: class bookings. Labels: status (booked / waitlist).
pub const BOOKINGS_TOTAL: &str = "studiodb_bookings_total";

pub const CANCELLATIONS_TOTAL: &str = "studiodb_cancellations_total";

/// Counter: cancellations refused inside the lock window.
pub const CANCELLATIONS_LOCKED_TOTAL: &str = "studiodb_cancellations_locked_total";

pub const WAITLIST_PROMOTIONS_TOTAL: &str = "studiodb_waitlist_promotions_total";

pub const CREDITS_DEDUCTED_TOTAL: &str = "studiodb_credits_deducted_total";

pub const CREDITS_REFUNDED_TOTAL: &str = "studiodb_credits_refunded_total";

pub const PASSES_EXPIRED_TOTAL: &str = "studiodb_passes_expired_total";

// ── Outbox ──────────────────────────────────────────────────────

/// Counter: side effects delivered. Labels: kind (notify / sync).
pub const OUTBOX_DELIVERED_TOTAL: &str = "studiodb_outbox_delivered_total";

/// Counter: side effects that failed or were dropped. Labels: kind.
pub const OUTBOX_FAILED_TOTAL: &str = "studiodb_outbox_failed_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertResource { .. } => "insert_resource",
        Command::InsertClient { .. } => "insert_client",
        Command::InsertPass { .. } => "insert_pass",
        Command::InsertClass { .. } => "insert_class",
        Command::CompleteClass { .. } => "complete_class",
        Command::DeleteClass { .. } => "delete_class",
        Command::InsertSession { .. } => "insert_session",
        Command::UpdateSession { .. } => "update_session",
        Command::SetSessionStatus { .. } => "set_session_status",
        Command::DeleteSession { .. } => "delete_session",
        Command::InsertRegistration { .. } => "insert_registration",
        Command::MarkAttendance { .. } => "mark_attendance",
        Command::DeleteRegistration { .. } => "delete_registration",
        Command::InsertDeduction { .. } => "insert_deduction",
        Command::InsertRefund { .. } => "insert_refund",
        Command::InsertPayment { .. } => "insert_payment",
        Command::SelectResources { .. } => "select_resources",
        Command::SelectCalendar { .. } => "select_calendar",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectSession { .. } => "select_session",
        Command::SelectClass { .. } => "select_class",
        Command::SelectRegistrations { .. } => "select_registrations",
        Command::SelectAudit { .. } => "select_audit",
        Command::SelectCredits { .. } => "select_credits",
        Command::SelectPasses { .. } => "select_passes",
    }
}
