//! Audit log records derived from consumed envelopes

use chrono::{DateTime, Utc};
use event_bus::EventEnvelope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::AuditError;

/// Fields of a record before an id and timestamp are assigned
#[derive(Debug, Clone)]
pub struct NewAuditLog {
    pub event_id: Uuid,
    pub event_type: String,
    pub event_version: String,
    pub event_context: Value,
    pub trace_id: Uuid,
    pub user_author_id: Option<Uuid>,
    pub payload: Value,
}

/// One row of the append-only audit trail
///
/// Never updated or deleted once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct AuditLogRecord {
    pub id: Uuid,
    pub event_id: Uuid,
    pub event_type: String,
    pub event_version: String,
    pub event_context: Value,
    pub trace_id: Uuid,
    pub user_author_id: Option<Uuid>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl AuditLogRecord {
    pub fn new(input: NewAuditLog) -> Result<Self, AuditError> {
        if input.event_id.is_nil() {
            return Err(AuditError::NilEventId);
        }
        if input.event_type.trim().is_empty() {
            return Err(AuditError::EmptyEventType);
        }
        if input.trace_id.is_nil() {
            return Err(AuditError::NilTraceId);
        }

        Ok(Self {
            id: Uuid::new_v4(),
            event_id: input.event_id,
            event_type: input.event_type,
            event_version: input.event_version,
            event_context: input.event_context,
            trace_id: input.trace_id,
            user_author_id: input.user_author_id,
            payload: input.payload,
            created_at: Utc::now(),
        })
    }

    /// Record for a consumed envelope; the acting user comes from its context
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self, AuditError> {
        let payload = serde_json::from_str(envelope.payload().as_str()).map_err(|source| {
            AuditError::Encoding {
                field: "payload",
                source,
            }
        })?;
        Self::from_envelope_payload(envelope, payload)
    }

    /// Like [`from_envelope`](Self::from_envelope) for a payload the caller
    /// already parsed
    pub fn from_envelope_payload(envelope: &EventEnvelope, payload: Value) -> Result<Self, AuditError> {
        let event_context = serde_json::to_value(envelope.context()).map_err(|source| {
            AuditError::Encoding {
                field: "event context",
                source,
            }
        })?;

        Self::new(NewAuditLog {
            event_id: envelope.event_id(),
            event_type: envelope.event_type().to_string(),
            event_version: envelope.header().schema_version().to_string(),
            event_context,
            trace_id: envelope.trace_id(),
            user_author_id: envelope.context().user_id(),
            payload,
        })
    }
}
