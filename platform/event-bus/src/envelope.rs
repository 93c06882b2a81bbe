//! # Event Envelope
//!
//! Platform-wide wire structure for every domain event published to a stream.
//!
//! ## Wire Format
//!
//! ```json
//! {
//!   "header":   { "eventId", "eventType", "timestamp", "source", "jsonSchemaVersion" },
//!   "context":  { "correlationId", "userId" },
//!   "metadata": { "traceId", "previousEventId", "causationId" },
//!   "payload":  <opaque JSON>
//! }
//! ```
//!
//! `userId`, `previousEventId` and `causationId` are omitted when absent.
//!
//! ## Invariants
//!
//! - Event id and timestamp are generated here, never supplied by callers
//! - Type, source, schema version, correlation id, trace id and payload are required
//! - The payload must be syntactically valid JSON; its shape belongs to the event type
//! - An envelope is immutable once built: fields are only reachable through getters

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use uuid::Uuid;

/// Errors raised when an envelope violates its construction invariants
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("event ID cannot be empty")]
    NilEventId,

    #[error("event type cannot be empty")]
    EmptyEventType,

    #[error("event source cannot be empty")]
    EmptySource,

    #[error("event version cannot be empty")]
    EmptySchemaVersion,

    #[error("correlation ID cannot be empty")]
    NilCorrelationId,

    #[error("trace ID cannot be empty")]
    NilTraceId,

    #[error("event payload cannot be empty")]
    MissingPayload,

    #[error("event payload must be valid JSON: {0}")]
    InvalidPayload(String),

    #[error("malformed envelope: {0}")]
    Malformed(String),
}

/// Opaque, syntactically valid JSON payload
///
/// The raw text is kept byte-for-byte so that consumers see exactly what the
/// producer wrote. Equality compares that text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Box<RawValue>);

impl Payload {
    /// Validate raw bytes as JSON and wrap them
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(EnvelopeError::MissingPayload);
        }
        serde_json::from_slice::<Box<RawValue>>(bytes)
            .map(Self)
            .map_err(|e| EnvelopeError::InvalidPayload(e.to_string()))
    }

    /// Serialize a typed value into a payload
    pub fn from_value<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::value::to_raw_value(value).map(Self)
    }

    /// Decode the payload into the shape owned by the event type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(self.0.get())
    }

    /// Raw JSON text
    pub fn as_str(&self) -> &str {
        self.0.get()
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.0.get() == other.0.get()
    }
}

impl Eq for Payload {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventHeader {
    event_id: Uuid,
    event_type: String,
    timestamp: DateTime<Utc>,
    source: String,
    #[serde(rename = "jsonSchemaVersion")]
    schema_version: String,
}

impl EventHeader {
    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }
}

/// Business context: which operation the event belongs to and who caused it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    correlation_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_id: Option<Uuid>,
}

impl EventContext {
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Actor that caused the event, if known
    pub fn user_id(&self) -> Option<Uuid> {
        self.user_id
    }
}

/// Causal chain and trace linkage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    trace_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    previous_event_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    causation_id: Option<Uuid>,
}

impl EventMetadata {
    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn previous_event_id(&self) -> Option<Uuid> {
        self.previous_event_id
    }

    pub fn causation_id(&self) -> Option<Uuid> {
        self.causation_id
    }
}

/// Caller-supplied fields for a new envelope
///
/// `payload` holds the raw JSON bytes of the event body.
#[derive(Debug, Clone, Default)]
pub struct NewEvent {
    pub event_type: String,
    pub schema_version: String,
    pub source: String,
    pub correlation_id: Uuid,
    pub user_id: Option<Uuid>,
    pub trace_id: Uuid,
    pub previous_event_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    pub payload: Vec<u8>,
}

/// Immutable, versioned event envelope
///
/// # Examples
///
/// ```rust
/// use event_bus::{EventEnvelope, NewEvent};
/// use uuid::Uuid;
///
/// let envelope = EventEnvelope::new(NewEvent {
///     event_type: "user.created".to_string(),
///     schema_version: "v1.0.0".to_string(),
///     source: "IdentityService".to_string(),
///     correlation_id: Uuid::new_v4(),
///     trace_id: Uuid::new_v4(),
///     payload: br#"{"name":"Ada"}"#.to_vec(),
///     ..Default::default()
/// })
/// .unwrap();
///
/// assert_eq!(envelope.event_type(), "user.created");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    header: EventHeader,
    context: EventContext,
    metadata: EventMetadata,
    payload: Payload,
}

impl EventEnvelope {
    /// Build a new envelope with a fresh event id and UTC timestamp
    pub fn new(input: NewEvent) -> Result<Self, EnvelopeError> {
        require_text(&input.event_type, EnvelopeError::EmptyEventType)?;
        require_text(&input.source, EnvelopeError::EmptySource)?;
        require_text(&input.schema_version, EnvelopeError::EmptySchemaVersion)?;
        require_id(input.correlation_id, EnvelopeError::NilCorrelationId)?;
        require_id(input.trace_id, EnvelopeError::NilTraceId)?;
        let payload = Payload::from_slice(&input.payload)?;

        Ok(Self {
            header: EventHeader {
                event_id: Uuid::new_v4(),
                event_type: input.event_type,
                timestamp: Utc::now(),
                source: input.source,
                schema_version: input.schema_version,
            },
            context: EventContext {
                correlation_id: input.correlation_id,
                user_id: input.user_id,
            },
            metadata: EventMetadata {
                trace_id: input.trace_id,
                previous_event_id: input.previous_event_id,
                causation_id: input.causation_id,
            },
            payload,
        })
    }

    /// Decode wire bytes and re-check the construction invariants
    ///
    /// Anything that fails here can never be processed, whatever the number
    /// of redeliveries.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Self =
            serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Encode to wire bytes
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        require_id(self.header.event_id, EnvelopeError::NilEventId)?;
        require_text(&self.header.event_type, EnvelopeError::EmptyEventType)?;
        require_text(&self.header.source, EnvelopeError::EmptySource)?;
        require_text(&self.header.schema_version, EnvelopeError::EmptySchemaVersion)?;
        require_id(self.context.correlation_id, EnvelopeError::NilCorrelationId)?;
        require_id(self.metadata.trace_id, EnvelopeError::NilTraceId)?;
        Ok(())
    }

    pub fn header(&self) -> &EventHeader {
        &self.header
    }

    pub fn context(&self) -> &EventContext {
        &self.context
    }

    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn event_id(&self) -> Uuid {
        self.header.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.header.event_type
    }

    pub fn trace_id(&self) -> Uuid {
        self.metadata.trace_id
    }
}

fn require_text(value: &str, err: EnvelopeError) -> Result<(), EnvelopeError> {
    if value.trim().is_empty() {
        return Err(err);
    }
    Ok(())
}

fn require_id(value: Uuid, err: EnvelopeError) -> Result<(), EnvelopeError> {
    if value.is_nil() {
        return Err(err);
    }
    Ok(())
}
