//! Durable envelope publishing
//!
//! Publishing never retries on its own. A broker fault comes back as
//! `BusError::PublishError` and the caller decides whether to retry or drop.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::Instrument;

use crate::{
    BusError, BusMessage, BusResult, EventEnvelope, RequestContext, StreamBroker, StreamRouter,
    EXPECTED_STREAM_HEADER, MSG_ID_HEADER,
};

/// Publishes envelopes to their durable stream
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, ctx: &RequestContext, envelope: &EventEnvelope) -> BusResult<()>;
}

/// Publisher that routes by event type and appends through a `StreamBroker`
#[derive(Clone)]
pub struct JetStreamPublisher {
    broker: Arc<dyn StreamBroker>,
    router: Arc<StreamRouter>,
}

impl JetStreamPublisher {
    pub fn new(broker: Arc<dyn StreamBroker>, router: Arc<StreamRouter>) -> Self {
        Self { broker, router }
    }

    /// Wire message for an envelope bound to `stream`
    fn build_message(
        ctx: &RequestContext,
        envelope: &EventEnvelope,
        stream: &str,
    ) -> BusResult<BusMessage> {
        let body = envelope
            .to_vec()
            .map_err(|e| BusError::SerializationError(e.to_string()))?;

        let mut message = BusMessage::new(envelope.event_type().to_string(), body)
            .with_header(MSG_ID_HEADER, envelope.event_id().to_string())
            .with_header(EXPECTED_STREAM_HEADER, stream.to_string());
        ctx.trace().inject(&mut message.headers);
        Ok(message)
    }
}

#[async_trait]
impl EventPublisher for JetStreamPublisher {
    async fn publish(&self, ctx: &RequestContext, envelope: &EventEnvelope) -> BusResult<()> {
        let span = tracing::debug_span!(
            "publish",
            messaging.system = "nats",
            messaging.destination = %envelope.event_type(),
            event_id = %envelope.event_id(),
            trace_id = %ctx.trace().trace_id(),
        );
        self.publish_in_span(ctx, envelope).instrument(span).await
    }
}

impl JetStreamPublisher {
    async fn publish_in_span(&self, ctx: &RequestContext, envelope: &EventEnvelope) -> BusResult<()> {
        let stream = self.router.resolve(envelope.event_type()).map_err(|e| {
            tracing::error!(
                event_type = %envelope.event_type(),
                error = %e,
                "Configuration error: could not find a stream for the subject"
            );
            e
        })?;

        let message = Self::build_message(ctx, envelope, stream).map_err(|e| {
            tracing::error!(
                event_type = %envelope.event_type(),
                error = %e,
                "Failed to serialize event"
            );
            e
        })?;

        let receipt = ctx
            .run(self.broker.publish(message))
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))
            .and_then(|r| r)
            .map_err(|e| {
                tracing::error!(
                    event_id = %envelope.event_id(),
                    event_type = %envelope.event_type(),
                    stream = %stream,
                    error = %e,
                    "Failed to publish event"
                );
                e
            })?;

        if receipt.duplicate {
            tracing::debug!(
                event_id = %envelope.event_id(),
                stream = %receipt.stream,
                "Broker already held this event, duplicate publish dropped"
            );
        } else {
            tracing::debug!(
                event_id = %envelope.event_id(),
                event_type = %envelope.event_type(),
                stream = %receipt.stream,
                sequence = receipt.sequence,
                "Event published successfully"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ensure_streams, InMemoryBroker, NewEvent, TraceContext};
    use uuid::Uuid;

    fn envelope(event_type: &str) -> EventEnvelope {
        EventEnvelope::new(NewEvent {
            event_type: event_type.to_string(),
            schema_version: "v1.0.0".to_string(),
            source: "IdentityService".to_string(),
            correlation_id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            payload: br#"{"name":"Ada"}"#.to_vec(),
            ..Default::default()
        })
        .unwrap()
    }

    async fn setup() -> (Arc<InMemoryBroker>, JetStreamPublisher) {
        let broker = Arc::new(InMemoryBroker::new());
        let router = Arc::new(StreamRouter::with_default_streams().unwrap());
        ensure_streams(broker.as_ref(), &router).await;
        let publisher = JetStreamPublisher::new(broker.clone(), router);
        (broker, publisher)
    }

    #[tokio::test]
    async fn test_publish_appends_to_resolved_stream_with_headers() {
        let (broker, publisher) = setup().await;
        let envelope = envelope("user.created");
        let ctx = RequestContext::new(TraceContext::new(envelope.trace_id()));

        publisher.publish(&ctx, &envelope).await.unwrap();

        let stored = broker.stream_messages("identity-stream").await;
        assert_eq!(stored.len(), 1);
        let msg = &stored[0];
        assert_eq!(msg.subject, "user.created");
        assert_eq!(msg.header(MSG_ID_HEADER), Some(envelope.event_id().to_string().as_str()));
        assert_eq!(msg.header(EXPECTED_STREAM_HEADER), Some("identity-stream"));
        assert_eq!(TraceContext::extract(&msg.headers), Some(*ctx.trace()));
        assert_eq!(EventEnvelope::from_slice(&msg.payload).unwrap(), envelope);
    }

    #[tokio::test]
    async fn test_publish_without_stream_is_not_retryable() {
        let (broker, publisher) = setup().await;
        let envelope = envelope("unknown.thing");
        let ctx = RequestContext::for_trace(envelope.trace_id());

        let err = publisher.publish(&ctx, &envelope).await.unwrap_err();

        assert!(matches!(err, BusError::NoStreamConfigured(_)));
        assert!(!err.is_retryable());
        assert!(broker.stream_messages("identity-stream").await.is_empty());
    }

    #[tokio::test]
    async fn test_broker_failure_surfaces_as_publish_error() {
        let (broker, publisher) = setup().await;
        broker.fail_next_publish("connection reset").await;
        let envelope = envelope("user.created");
        let ctx = RequestContext::for_trace(envelope.trace_id());

        let err = publisher.publish(&ctx, &envelope).await.unwrap_err();

        assert!(matches!(err, BusError::PublishError(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_republishing_same_envelope_is_deduplicated() {
        let (broker, publisher) = setup().await;
        let envelope = envelope("user.created");
        let ctx = RequestContext::for_trace(envelope.trace_id());

        publisher.publish(&ctx, &envelope).await.unwrap();
        publisher.publish(&ctx, &envelope).await.unwrap();

        assert_eq!(broker.stream_messages("identity-stream").await.len(), 1);
    }
}
