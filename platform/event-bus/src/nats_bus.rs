//! NATS JetStream implementation of the `StreamBroker` trait

use std::collections::HashMap;

use async_nats::jetstream::{self, consumer, stream, AckKind};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use futures::stream::StreamExt;

use crate::{
    Acknowledger, BusError, BusMessage, BusResult, ConsumerSpec, Delivery, DeliveryStream,
    PublishReceipt, RetentionClass, StorageClass, StreamBroker, StreamDefinition,
};

/// StreamBroker implementation using NATS JetStream
///
/// This is the production implementation. Publishes wait for the stream's
/// acknowledgment, and consumers are durable pull consumers with explicit acks.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{JetStreamBroker, StreamBroker, StreamRouter};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = JetStreamBroker::connect("nats://localhost:4222").await?;
/// let router = StreamRouter::with_default_streams()?;
/// event_bus::ensure_streams(&broker, &router).await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct JetStreamBroker {
    client: Client,
    context: jetstream::Context,
}

impl JetStreamBroker {
    /// Wrap an already-connected client
    pub fn new(client: Client) -> Self {
        let context = jetstream::new(client.clone());
        Self { client, context }
    }

    pub async fn connect(url: &str) -> BusResult<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::ConnectionError(format!("{}: {}", url, e)))?;
        Ok(Self::new(client))
    }

    /// Get a reference to the underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn stream_config(definition: &StreamDefinition) -> stream::Config {
    stream::Config {
        name: definition.name.clone(),
        subjects: definition.subjects.clone(),
        storage: match definition.storage {
            StorageClass::File => stream::StorageType::File,
            StorageClass::Memory => stream::StorageType::Memory,
        },
        retention: match definition.retention {
            RetentionClass::Limits => stream::RetentionPolicy::Limits,
            RetentionClass::Interest => stream::RetentionPolicy::Interest,
            RetentionClass::WorkQueue => stream::RetentionPolicy::WorkQueue,
        },
        num_replicas: definition.replicas,
        max_messages: definition.max_messages,
        max_age: definition.max_age,
        ..Default::default()
    }
}

fn to_header_map(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(name.as_str(), value.as_str());
    }
    map
}

fn to_bus_message(msg: &async_nats::Message) -> BusMessage {
    let mut out = BusMessage::new(msg.subject.to_string(), msg.payload.to_vec());
    if let Some(nats_headers) = &msg.headers {
        for (key, values) in nats_headers.iter() {
            // Take the first value for each header
            if let Some(value) = values.first() {
                out.headers.insert(key.to_string(), value.to_string());
            }
        }
    }
    out
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acknowledger for NatsAcker {
    async fn ack(&self) -> BusResult<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }

    async fn term(&self) -> BusResult<()> {
        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }
}

#[async_trait]
impl StreamBroker for JetStreamBroker {
    async fn ensure_stream(&self, definition: &StreamDefinition) -> BusResult<()> {
        self.context
            .get_or_create_stream(stream_config(definition))
            .await
            .map_err(|e| BusError::StreamSetupError(format!("{}: {}", definition.name, e)))?;
        Ok(())
    }

    async fn publish(&self, message: BusMessage) -> BusResult<PublishReceipt> {
        let headers = to_header_map(&message.headers);
        let ack = self
            .context
            .publish_with_headers(message.subject, headers, message.payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        Ok(PublishReceipt {
            stream: ack.stream,
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }

    async fn attach_consumer(&self, stream: &str, spec: &ConsumerSpec) -> BusResult<DeliveryStream> {
        let js_stream = self
            .context
            .get_stream(stream)
            .await
            .map_err(|e| BusError::SubscribeError(format!("stream {}: {}", stream, e)))?;

        let pull = js_stream
            .create_consumer(consumer::pull::Config {
                durable_name: Some(spec.durable_name.clone()),
                filter_subject: spec.filter_subject.clone(),
                ack_policy: consumer::AckPolicy::Explicit,
                deliver_policy: consumer::DeliverPolicy::All,
                ack_wait: spec.policy.ack_wait,
                max_deliver: i64::from(spec.policy.max_deliver),
                backoff: spec.policy.backoff.steps().to_vec(),
                ..Default::default()
            })
            .await
            .map_err(|e| {
                BusError::SubscribeError(format!("consumer {}: {}", spec.durable_name, e))
            })?;

        let messages = pull
            .messages()
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let deliveries = messages.map(|result| {
            let message = result.map_err(|e| BusError::SubscribeError(e.to_string()))?;
            let delivered = message
                .info()
                .map(|info| info.delivered.max(1) as u64)
                .unwrap_or(1);
            let bus_message = to_bus_message(&message.message);
            Ok(Delivery::new(
                bus_message,
                delivered,
                Box::new(NatsAcker { message }),
            ))
        });

        Ok(deliveries.boxed())
    }
}
