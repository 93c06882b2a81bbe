//! # Audit
//!
//! Append-only audit trail fed by the event bus.
//!
//! [`AuditTrailHandler`] is an [`event_bus::EventHandler`]: subscribe it to
//! an event type and every successfully decoded envelope of that type becomes
//! exactly one [`AuditLogRecord`], however many times the broker delivers it.
//!
//! The `audit_logs` table ships as an embedded migration, see [`MIGRATOR`].

mod handler;
mod record;
mod repository;

pub use handler::AuditTrailHandler;
pub use record::{AuditLogRecord, NewAuditLog};
pub use repository::{
    AuditLogRepository, InMemoryAuditRepository, PostgresAuditRepository, RegisterOutcome,
    DEFAULT_STATEMENT_TIMEOUT,
};

use std::time::Duration;

/// Migrations for the `audit_logs` table
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./db/migrations");

/// Errors raised while auditing an event
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit log validation: event ID cannot be nil")]
    NilEventId,

    #[error("audit log validation: event type cannot be empty")]
    EmptyEventType,

    #[error("audit log validation: trace id cannot be nil")]
    NilTraceId,

    #[error("audit log creation: failed to encode {field}: {source}")]
    Encoding {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode {event_type} payload: {source}")]
    PayloadDecode {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to save audit log: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to save audit log: timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to save audit log: {0}")]
    Storage(String),
}
