//! user.created v1.0.0

use event_bus::{BusError, BusResult, EventEnvelope, NewEvent};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const USER_CREATED_EVENT_TYPE: &str = "user.created";
pub const USER_CREATED_EVENT_VERSION: &str = "v1.0.0";
pub const USER_EVENT_SOURCE: &str = "IdentityService";

/// Payload of `user.created`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserCreatedPayload {
    pub user_id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: String,
}

/// Everything needed to emit `user.created` besides the fixed contract fields
#[derive(Debug, Clone)]
pub struct UserCreatedEventInput {
    pub correlation_id: Uuid,
    /// Who created the user, when known
    pub author_id: Option<Uuid>,
    pub trace_id: Uuid,
    pub previous_event_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    pub payload: UserCreatedPayload,
}

pub fn new_user_created_event(input: UserCreatedEventInput) -> BusResult<EventEnvelope> {
    let payload = serde_json::to_vec(&input.payload)
        .map_err(|e| BusError::SerializationError(e.to_string()))?;

    let envelope = EventEnvelope::new(NewEvent {
        event_type: USER_CREATED_EVENT_TYPE.to_string(),
        schema_version: USER_CREATED_EVENT_VERSION.to_string(),
        source: USER_EVENT_SOURCE.to_string(),
        correlation_id: input.correlation_id,
        user_id: input.author_id,
        trace_id: input.trace_id,
        previous_event_id: input.previous_event_id,
        causation_id: input.causation_id,
        payload,
    })?;

    Ok(envelope)
}
