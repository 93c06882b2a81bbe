//! # Event Bus
//!
//! Durable event delivery between bounded contexts.
//!
//! ## Pipeline
//!
//! ```text
//! domain operation → EventEnvelope → EventPublisher → broker stream
//!                  → DurableSubscriber → EventHandler → storage
//! ```
//!
//! - **EventEnvelope**: immutable, versioned wire structure of one event
//! - **StreamRouter**: maps a subject to the durable stream that retains it
//! - **JetStreamPublisher**: serializes, propagates trace context, appends durably
//! - **DurableSubscriber**: one durable consumer and one pull loop per subject,
//!   applying ack / retry / terminate per delivery
//!
//! ## Brokers
//!
//! - **JetStreamBroker**: production implementation on NATS JetStream
//! - **InMemoryBroker**: dev/test implementation with the same redelivery rules
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{
//!     DurableSubscriber, EventPublisher, InMemoryBroker, JetStreamPublisher,
//!     RequestContext, StreamBroker, StreamRouter,
//! };
//! use std::sync::Arc;
//!
//! # async fn example(envelope: event_bus::EventEnvelope) -> Result<(), Box<dyn std::error::Error>> {
//! let router = Arc::new(StreamRouter::with_default_streams()?);
//! let broker: Arc<dyn StreamBroker> = Arc::new(InMemoryBroker::new());
//! event_bus::ensure_streams(broker.as_ref(), &router).await;
//!
//! let publisher = JetStreamPublisher::new(broker.clone(), router.clone());
//! let ctx = RequestContext::for_trace(envelope.trace_id());
//! publisher.publish(&ctx, &envelope).await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
mod context;
mod envelope;
mod inmemory_bus;
mod nats_bus;
mod publisher;
mod streams;
mod subject;
mod subscriber;

pub use backoff::{BackoffSchedule, DeliveryPolicy};
pub use context::{DeadlineExceeded, RequestContext, TraceContext, TRACEPARENT_HEADER};
pub use envelope::{
    EnvelopeError, EventContext, EventEnvelope, EventHeader, EventMetadata, NewEvent, Payload,
};
pub use inmemory_bus::{ConsumerStats, InMemoryBroker};
pub use nats_bus::JetStreamBroker;
pub use publisher::{EventPublisher, JetStreamPublisher};
pub use streams::{
    default_stream_definitions, RetentionClass, StorageClass, StreamDefinition, StreamRouter,
};
pub use subject::{durable_name, matches_pattern, validate_subject};
pub use subscriber::{dispatch, Disposition, DurableSubscriber, EventHandler, HandlerError};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;

/// Header carrying the event id; the broker drops repeats inside its duplicate window
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Header asking the broker to reject a publish that lands in another stream
pub const EXPECTED_STREAM_HEADER: &str = "Nats-Expected-Stream";

/// A message as carried by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// The subject this message was published to
    pub subject: String,
    /// Raw body
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl BusMessage {
    pub fn new(subject: String, payload: Vec<u8>) -> Self {
        Self {
            subject,
            payload,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: String) -> Self {
        self.headers.insert(name.to_string(), value);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Broker confirmation of a durable append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub stream: String,
    pub sequence: u64,
    /// The broker already held a message with the same id
    pub duplicate: bool,
}

/// A durable consumer to create or update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub durable_name: String,
    pub filter_subject: String,
    pub policy: DeliveryPolicy,
}

/// Settles one delivery with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Processing succeeded; never redeliver
    async fn ack(&self) -> BusResult<()>;

    /// Message can never be processed; never redeliver
    async fn term(&self) -> BusResult<()>;
}

/// One delivery attempt of a stored message
pub struct Delivery {
    pub message: BusMessage,
    /// 1 on first delivery, incremented on each redelivery
    pub delivered: u64,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(message: BusMessage, delivered: u64, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            message,
            delivered,
            acker,
        }
    }

    pub async fn ack(&self) -> BusResult<()> {
        self.acker.ack().await
    }

    pub async fn term(&self) -> BusResult<()> {
        self.acker.term().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.message.subject)
            .field("delivered", &self.delivered)
            .finish()
    }
}

/// Pull stream of deliveries for one durable consumer
pub type DeliveryStream = BoxStream<'static, BusResult<Delivery>>;

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[from] EnvelopeError),

    #[error("no stream configured for subject: {0}")]
    NoStreamConfigured(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe to subject: {0}")]
    SubscribeError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("failed to set up stream: {0}")]
    StreamSetupError(String),

    #[error("failed to settle message: {0}")]
    AckError(String),

    #[error("invalid subject: {0}")]
    InvalidSubject(String),
}

impl BusError {
    /// Transient infrastructure faults may succeed on a later attempt;
    /// configuration and validation faults never will
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::PublishError(_)
                | BusError::SubscribeError(_)
                | BusError::ConnectionError(_)
                | BusError::StreamSetupError(_)
                | BusError::AckError(_)
        )
    }
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Durable stream broker
///
/// Implemented by `JetStreamBroker` for production and `InMemoryBroker`
/// for development and tests.
#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Create the stream if it does not exist yet
    async fn ensure_stream(&self, definition: &StreamDefinition) -> BusResult<()>;

    /// Append a message and wait for the broker to confirm it is stored
    async fn publish(&self, message: BusMessage) -> BusResult<PublishReceipt>;

    /// Create or update a durable consumer and start pulling from it
    ///
    /// Attaching an existing durable name keeps its committed position.
    async fn attach_consumer(&self, stream: &str, spec: &ConsumerSpec) -> BusResult<DeliveryStream>;
}

impl fmt::Debug for dyn StreamBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamBroker")
    }
}

/// Create every declared stream that is missing
///
/// Failures are logged and skipped: a stream that cannot be created surfaces
/// later as a publish or subscribe error for its subjects.
pub async fn ensure_streams(broker: &dyn StreamBroker, router: &StreamRouter) {
    for definition in router.definitions() {
        match broker.ensure_stream(definition).await {
            Ok(()) => tracing::info!(stream = %definition.name, "Stream ready"),
            Err(e) => tracing::warn!(
                stream = %definition.name,
                error = %e,
                "Failed to create stream"
            ),
        }
    }
}
