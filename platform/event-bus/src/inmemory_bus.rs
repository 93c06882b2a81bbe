//! In-memory implementation of `StreamBroker` for testing and development
//!
//! Mirrors the JetStream rules the pipeline depends on:
//! - streams capture subjects by wildcard pattern and trim to `max_messages`
//! - `Nats-Msg-Id` duplicates are dropped, `Nats-Expected-Stream` is enforced
//! - durable consumers keep their cursor across re-attach
//! - unacknowledged deliveries come back after the backoff for their count,
//!   until `max_deliver` is spent

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::StreamExt;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use crate::subject::matches_pattern;
use crate::{
    Acknowledger, BusError, BusMessage, BusResult, ConsumerSpec, Delivery, DeliveryStream,
    PublishReceipt, StreamBroker, StreamDefinition, EXPECTED_STREAM_HEADER, MSG_ID_HEADER,
};

/// Counters for one durable consumer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Deliveries handed out, redeliveries included
    pub delivered: u64,
    pub acked: u64,
    pub terminated: u64,
    /// Messages abandoned after `max_deliver` deliveries
    pub exhausted: u64,
    /// Delivered but not yet settled
    pub pending: usize,
}

struct StoredMessage {
    seq: u64,
    message: BusMessage,
}

struct StreamState {
    definition: StreamDefinition,
    messages: VecDeque<StoredMessage>,
    last_seq: u64,
}

impl StreamState {
    fn get(&self, seq: u64) -> Option<&StoredMessage> {
        self.messages.iter().find(|m| m.seq == seq)
    }
}

struct InFlight {
    delivered: u64,
    redeliver_at: Instant,
}

struct ConsumerState {
    spec: ConsumerSpec,
    cursor: u64,
    in_flight: BTreeMap<u64, InFlight>,
    stats: ConsumerStats,
}

type ConsumerKey = (String, String);

#[derive(Default)]
struct BrokerState {
    streams: HashMap<String, StreamState>,
    consumers: HashMap<ConsumerKey, ConsumerState>,
    publish_failures: VecDeque<String>,
    ack_failures: u32,
}

enum Next {
    Ready(BusMessage, u64, u64),
    WaitUntil(Option<Instant>),
    Closed,
}

impl BrokerState {
    fn next_delivery(&mut self, key: &ConsumerKey, now: Instant) -> Next {
        let BrokerState {
            streams, consumers, ..
        } = self;
        let (Some(consumer), Some(stream)) = (consumers.get_mut(key), streams.get(&key.0)) else {
            return Next::Closed;
        };
        let policy = &consumer.spec.policy;

        // Expired deliveries first
        while let Some(seq) = consumer
            .in_flight
            .iter()
            .find(|(_, f)| f.redeliver_at <= now)
            .map(|(seq, _)| *seq)
        {
            let Some(stored) = stream.get(seq) else {
                consumer.in_flight.remove(&seq);
                continue;
            };
            let Some(flight) = consumer.in_flight.get_mut(&seq) else {
                continue;
            };
            if policy.is_exhausted(flight.delivered) {
                consumer.in_flight.remove(&seq);
                consumer.stats.exhausted += 1;
                tracing::warn!(
                    consumer = %key.1,
                    stream_sequence = seq,
                    "Delivery budget exhausted, message abandoned"
                );
                continue;
            }
            flight.delivered += 1;
            flight.redeliver_at = now + policy.redelivery_delay(flight.delivered);
            consumer.stats.delivered += 1;
            return Next::Ready(stored.message.clone(), seq, flight.delivered);
        }

        let filter = &consumer.spec.filter_subject;
        if let Some(stored) = stream
            .messages
            .iter()
            .find(|m| m.seq > consumer.cursor && matches_pattern(&m.message.subject, filter))
        {
            consumer.cursor = stored.seq;
            consumer.in_flight.insert(
                stored.seq,
                InFlight {
                    delivered: 1,
                    redeliver_at: now + policy.redelivery_delay(1),
                },
            );
            consumer.stats.delivered += 1;
            return Next::Ready(stored.message.clone(), stored.seq, 1);
        }

        Next::WaitUntil(consumer.in_flight.values().map(|f| f.redeliver_at).min())
    }
}

/// `StreamBroker` backed by process memory
///
/// # Example
/// ```rust
/// use event_bus::{BusMessage, InMemoryBroker, StreamBroker, StreamDefinition};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// broker
///     .ensure_stream(&StreamDefinition::with_defaults("identity-stream", &["user.*"]))
///     .await?;
///
/// let receipt = broker
///     .publish(BusMessage::new("user.created".to_string(), b"{}".to_vec()))
///     .await?;
/// assert_eq!(receipt.stream, "identity-stream");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    // Bumped on every append so idle consumers wake up
    changes: Arc<watch::Sender<u64>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            changes: Arc::new(changes),
        }
    }

    /// Make the next publish fail with `reason`
    pub async fn fail_next_publish(&self, reason: &str) {
        self.state
            .lock()
            .await
            .publish_failures
            .push_back(reason.to_string());
    }

    /// Make the next `count` acknowledgments fail
    pub async fn fail_next_acks(&self, count: u32) {
        self.state.lock().await.ack_failures += count;
    }

    /// Messages currently retained by `stream`, oldest first
    pub async fn stream_messages(&self, stream: &str) -> Vec<BusMessage> {
        self.state
            .lock()
            .await
            .streams
            .get(stream)
            .map(|s| s.messages.iter().map(|m| m.message.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn consumer_stats(&self, stream: &str, durable: &str) -> Option<ConsumerStats> {
        let state = self.state.lock().await;
        state
            .consumers
            .get(&(stream.to_string(), durable.to_string()))
            .map(|c| ConsumerStats {
                pending: c.in_flight.len(),
                ..c.stats.clone()
            })
    }

    pub async fn consumer_count(&self) -> usize {
        self.state.lock().await.consumers.len()
    }

    async fn settle(&self, key: &ConsumerKey, seq: u64, terminate: bool) -> BusResult<()> {
        let mut state = self.state.lock().await;
        if !terminate && state.ack_failures > 0 {
            state.ack_failures -= 1;
            return Err(BusError::AckError("simulated acknowledgment failure".to_string()));
        }
        let consumer = state
            .consumers
            .get_mut(key)
            .ok_or_else(|| BusError::AckError(format!("consumer {} no longer exists", key.1)))?;
        if consumer.in_flight.remove(&seq).is_some() {
            if terminate {
                consumer.stats.terminated += 1;
            } else {
                consumer.stats.acked += 1;
            }
        }
        Ok(())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryAcker {
    broker: InMemoryBroker,
    key: ConsumerKey,
    seq: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> BusResult<()> {
        self.broker.settle(&self.key, self.seq, false).await
    }

    async fn term(&self) -> BusResult<()> {
        self.broker.settle(&self.key, self.seq, true).await
    }
}

#[async_trait]
impl StreamBroker for InMemoryBroker {
    async fn ensure_stream(&self, definition: &StreamDefinition) -> BusResult<()> {
        let mut state = self.state.lock().await;
        state
            .streams
            .entry(definition.name.clone())
            .or_insert_with(|| StreamState {
                definition: definition.clone(),
                messages: VecDeque::new(),
                last_seq: 0,
            });
        Ok(())
    }

    async fn publish(&self, message: BusMessage) -> BusResult<PublishReceipt> {
        let receipt = {
            let mut state = self.state.lock().await;
            if let Some(reason) = state.publish_failures.pop_front() {
                return Err(BusError::PublishError(reason));
            }

            let stream = state
                .streams
                .values_mut()
                .find(|s| {
                    s.definition
                        .subjects
                        .iter()
                        .any(|p| matches_pattern(&message.subject, p))
                })
                .ok_or_else(|| {
                    BusError::PublishError(format!("no stream captures subject {}", message.subject))
                })?;

            if let Some(expected) = message.header(EXPECTED_STREAM_HEADER) {
                if expected != stream.definition.name {
                    return Err(BusError::PublishError(format!(
                        "expected stream {} but subject {} is stored in {}",
                        expected, message.subject, stream.definition.name
                    )));
                }
            }

            let msg_id = message.header(MSG_ID_HEADER).map(str::to_string);
            if let Some(id) = msg_id.as_deref() {
                if let Some(existing) = stream
                    .messages
                    .iter()
                    .find(|m| m.message.header(MSG_ID_HEADER) == Some(id))
                {
                    return Ok(PublishReceipt {
                        stream: stream.definition.name.clone(),
                        sequence: existing.seq,
                        duplicate: true,
                    });
                }
            }

            stream.last_seq += 1;
            let seq = stream.last_seq;
            stream.messages.push_back(StoredMessage { seq, message });

            let max = stream.definition.max_messages;
            if max > 0 {
                while stream.messages.len() as i64 > max {
                    stream.messages.pop_front();
                }
            }

            PublishReceipt {
                stream: stream.definition.name.clone(),
                sequence: seq,
                duplicate: false,
            }
        };

        self.changes.send_modify(|v| *v += 1);
        Ok(receipt)
    }

    async fn attach_consumer(&self, stream: &str, spec: &ConsumerSpec) -> BusResult<DeliveryStream> {
        let key: ConsumerKey = (stream.to_string(), spec.durable_name.clone());
        {
            let mut state = self.state.lock().await;
            if !state.streams.contains_key(stream) {
                return Err(BusError::SubscribeError(format!("stream not found: {}", stream)));
            }
            state
                .consumers
                .entry(key.clone())
                .and_modify(|c| c.spec = spec.clone())
                .or_insert_with(|| ConsumerState {
                    spec: spec.clone(),
                    cursor: 0,
                    in_flight: BTreeMap::new(),
                    stats: ConsumerStats::default(),
                });
        }

        let broker = self.clone();
        let mut changes = self.changes.subscribe();

        let deliveries = async_stream::stream! {
            loop {
                changes.borrow_and_update();
                let next = {
                    let mut state = broker.state.lock().await;
                    state.next_delivery(&key, Instant::now())
                };

                match next {
                    Next::Ready(message, seq, delivered) => {
                        let acker = MemoryAcker {
                            broker: broker.clone(),
                            key: key.clone(),
                            seq,
                        };
                        yield Ok(Delivery::new(message, delivered, Box::new(acker)));
                    }
                    Next::WaitUntil(Some(at)) => {
                        tokio::select! {
                            _ = changes.changed() => {}
                            _ = tokio::time::sleep_until(at) => {}
                        }
                    }
                    Next::WaitUntil(None) => {
                        if changes.changed().await.is_err() {
                            break;
                        }
                    }
                    Next::Closed => break,
                }
            }
        };

        Ok(deliveries.boxed())
    }
}
