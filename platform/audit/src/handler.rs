//! Event handler that writes consumed envelopes to the audit trail

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use event_bus::{EventEnvelope, EventHandler, HandlerError, RequestContext};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::Instrument;

use crate::{AuditError, AuditLogRecord, AuditLogRepository, RegisterOutcome};

/// Audits every envelope of one event type
///
/// `P` is the payload shape expected for that event type. A payload that
/// does not decode as `P` fails the delivery like any other handler error.
pub struct AuditTrailHandler<P> {
    repository: Arc<dyn AuditLogRepository>,
    _payload: PhantomData<fn() -> P>,
}

impl<P> AuditTrailHandler<P> {
    pub fn new(repository: Arc<dyn AuditLogRepository>) -> Self {
        Self {
            repository,
            _payload: PhantomData,
        }
    }

    async fn audit(&self, envelope: &EventEnvelope) -> Result<(), AuditError>
    where
        P: DeserializeOwned,
    {
        let payload = serde_json::from_str::<Value>(envelope.payload().as_str())
            .and_then(|payload| P::deserialize(&payload).map(|_| payload))
            .map_err(|source| {
                tracing::error!(
                    error = %source,
                    payload = %envelope.payload().as_str(),
                    "Failed to decode event payload for auditing"
                );
                AuditError::PayloadDecode {
                    event_type: envelope.event_type().to_string(),
                    source,
                }
            })?;

        let record = AuditLogRecord::from_envelope_payload(envelope, payload).map_err(|e| {
            tracing::error!(error = %e, "Failed to build audit log record from event");
            e
        })?;

        match self.repository.register(&record).await {
            Ok(RegisterOutcome::Inserted) => {
                tracing::info!(
                    audit_log_id = %record.id,
                    user_id = ?record.user_author_id,
                    "Event audited successfully"
                );
                Ok(())
            }
            Ok(RegisterOutcome::Duplicate) => {
                tracing::info!("Event already audited, skipping duplicate");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to save audit log");
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<P> EventHandler for AuditTrailHandler<P>
where
    P: DeserializeOwned + Send + 'static,
{
    async fn handle(&self, ctx: &RequestContext, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let span = tracing::info_span!(
            "audit",
            event_id = %envelope.event_id(),
            event_type = %envelope.event_type(),
            trace_id = %ctx.trace().trace_id(),
        );
        self.audit(envelope).instrument(span).await?;
        Ok(())
    }
}
