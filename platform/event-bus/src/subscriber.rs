//! Durable subscriptions
//!
//! Each subscribed subject gets its own durable consumer and its own consume
//! loop task. Per delivery the loop decides one of three outcomes:
//!
//! | Outcome                 | Broker action | Redelivered?                 |
//! |-------------------------|---------------|------------------------------|
//! | handler succeeded       | ack           | no                           |
//! | handler failed          | none          | yes, until `max_deliver`     |
//! | body is not an envelope | term          | no                           |
//!
//! A delivery stream that ends while the subscriber is still running is
//! re-attached to the same durable consumer, so consumption resumes from the
//! committed position.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::StreamExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::backoff::{retry_with_backoff, RetryConfig};
use crate::subject::{durable_name, validate_subject};
use crate::{
    BusMessage, BusResult, ConsumerSpec, Delivery, DeliveryPolicy, DeliveryStream, EventEnvelope,
    RequestContext, StreamBroker, StreamRouter, TraceContext,
};

/// Error returned by an event handler; any failure triggers redelivery
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes envelopes delivered for one subject
///
/// Deliveries are at-least-once, so implementations must tolerate seeing the
/// same envelope more than once.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: &RequestContext, envelope: &EventEnvelope) -> Result<(), HandlerError>;
}

/// What to tell the broker about one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Leave unacknowledged so the broker redelivers after backoff
    Retry,
    Terminate,
}

/// Decode a delivered message and run `handler` on it
///
/// The handler runs under a deadline of `ack_wait` so that it gives up before
/// the broker would redeliver the same message anyway.
pub async fn dispatch(
    handler: &dyn EventHandler,
    message: &BusMessage,
    ack_wait: Duration,
) -> Disposition {
    let span = tracing::Span::current();

    let envelope = match EventEnvelope::from_slice(&message.payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::error!(
                subject = %message.subject,
                error = %e,
                "Failed to decode event envelope, terminating message"
            );
            return Disposition::Terminate;
        }
    };

    let trace = match TraceContext::extract(&message.headers) {
        Some(parent) => parent.child(),
        None => TraceContext::new(envelope.trace_id()),
    };
    span.record("trace_id", tracing::field::display(trace.trace_id()));
    span.record("event_id", tracing::field::display(envelope.event_id()));

    let ctx = RequestContext::new(trace).with_timeout(ack_wait);
    match ctx.run(handler.handle(&ctx, &envelope)).await {
        Ok(Ok(())) => Disposition::Ack,
        Ok(Err(e)) => {
            tracing::warn!(
                event_id = %envelope.event_id(),
                event_type = %envelope.event_type(),
                error = %e,
                "Event handler failed"
            );
            Disposition::Retry
        }
        Err(e) => {
            tracing::warn!(
                event_id = %envelope.event_id(),
                event_type = %envelope.event_type(),
                timeout_ms = ack_wait.as_millis() as u64,
                error = %e,
                "Event handler timed out"
            );
            Disposition::Retry
        }
    }
}

async fn settle(delivery: &Delivery, disposition: Disposition, policy: &DeliveryPolicy) {
    match disposition {
        Disposition::Ack => {
            if let Err(e) = delivery.ack().await {
                tracing::error!(error = %e, "Failed to acknowledge message");
            }
        }
        Disposition::Terminate => {
            if let Err(e) = delivery.term().await {
                tracing::error!(error = %e, "Failed to terminate message");
            }
        }
        Disposition::Retry if policy.is_exhausted(delivery.delivered) => {
            tracing::error!(
                attempts = delivery.delivered,
                max_deliver = policy.max_deliver,
                "Delivery budget exhausted, message will not be redelivered"
            );
        }
        Disposition::Retry => {
            tracing::debug!(
                attempt = delivery.delivered,
                max_deliver = policy.max_deliver,
                retry_in_ms = policy.redelivery_delay(delivery.delivered).as_millis() as u64,
                "Message left unacknowledged for redelivery"
            );
        }
    }
}

/// The durable consumer a consume loop pulls from
struct ConsumerBinding {
    broker: Arc<dyn StreamBroker>,
    stream: String,
    spec: ConsumerSpec,
}

impl ConsumerBinding {
    /// Attach again after the delivery stream ended
    ///
    /// Keeps retrying until it succeeds; `None` means shutdown came first.
    async fn reattach(&self, shutdown: &mut watch::Receiver<bool>) -> Option<DeliveryStream> {
        let retry = RetryConfig::default();
        loop {
            if *shutdown.borrow() {
                return None;
            }

            let attached = tokio::select! {
                biased;
                _ = shutdown.changed() => return None,
                attached = retry_with_backoff(
                    || self.broker.attach_consumer(&self.stream, &self.spec),
                    &retry,
                    "reattach_consumer",
                ) => attached,
            };

            match attached {
                Ok(deliveries) => {
                    tracing::info!(
                        stream = %self.stream,
                        durable = %self.spec.durable_name,
                        "Re-attached durable consumer"
                    );
                    return Some(deliveries);
                }
                Err(e) => {
                    tracing::error!(
                        stream = %self.stream,
                        durable = %self.spec.durable_name,
                        error = %e,
                        "Failed to re-attach durable consumer, will keep trying"
                    );
                }
            }
        }
    }
}

async fn consume_loop(
    subject: String,
    binding: ConsumerBinding,
    mut deliveries: DeliveryStream,
    handler: Arc<dyn EventHandler>,
    policy: DeliveryPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = deliveries.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => {
                tracing::warn!(subject = %subject, error = %e, "Failed to pull message");
                continue;
            }
            None => {
                tracing::warn!(subject = %subject, "Delivery stream ended, re-attaching");
                match binding.reattach(&mut shutdown).await {
                    Some(fresh) => {
                        deliveries = fresh;
                        continue;
                    }
                    None => break,
                }
            }
        };

        let span = tracing::info_span!(
            "consume",
            subject = %subject,
            attempt = delivery.delivered,
            trace_id = tracing::field::Empty,
            event_id = tracing::field::Empty,
        );
        async {
            let disposition = dispatch(handler.as_ref(), &delivery.message, policy.ack_wait).await;
            settle(&delivery, disposition, &policy).await;
        }
        .instrument(span)
        .await;
    }

    tracing::info!(subject = %subject, "Consumer stopped");
}

/// Attaches durable consumers and runs one consume loop per subject
pub struct DurableSubscriber {
    broker: Arc<dyn StreamBroker>,
    router: Arc<StreamRouter>,
    policy: DeliveryPolicy,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DurableSubscriber {
    pub fn new(broker: Arc<dyn StreamBroker>, router: Arc<StreamRouter>, policy: DeliveryPolicy) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            broker,
            router,
            policy,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn policy(&self) -> &DeliveryPolicy {
        &self.policy
    }

    /// Attach the durable consumer for `subject` and start consuming
    ///
    /// Returns once the consumer exists; messages are processed on a
    /// background task until [`shutdown`](Self::shutdown). Subscribing the
    /// same subject again resumes from the consumer's committed position.
    pub async fn subscribe(&self, subject: &str, handler: Arc<dyn EventHandler>) -> BusResult<()> {
        validate_subject(subject)?;

        let stream = self.router.resolve(subject).map_err(|e| {
            tracing::error!(subject = %subject, error = %e, "Cannot subscribe, no stream owns subject");
            e
        })?;

        let spec = ConsumerSpec {
            durable_name: durable_name(subject),
            filter_subject: subject.to_string(),
            policy: self.policy.clone(),
        };
        let deliveries = self.broker.attach_consumer(stream, &spec).await?;

        tracing::info!(
            subject = %subject,
            stream = %stream,
            durable = %spec.durable_name,
            max_deliver = self.policy.max_deliver,
            "Subscribed to subject"
        );

        let binding = ConsumerBinding {
            broker: self.broker.clone(),
            stream: stream.to_string(),
            spec,
        };
        let handle = tokio::spawn(consume_loop(
            subject.to_string(),
            binding,
            deliveries,
            handler,
            self.policy.clone(),
            self.shutdown_tx.subscribe(),
        ));
        self.tasks.lock().await.push(handle);
        Ok(())
    }

    pub async fn active_subscriptions(&self) -> usize {
        self.tasks
            .lock()
            .await
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Stop every consume loop
    ///
    /// In-flight handlers get up to `grace` to finish; loops still running
    /// after that are aborted and their messages redelivered later.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown_tx.send_replace(true);

        let handles = std::mem::take(&mut *self.tasks.lock().await);
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        match tokio::time::timeout(grace, join_all(handles)).await {
            Ok(_) => tracing::info!("All consumers stopped"),
            Err(_) => {
                tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Grace period elapsed, aborting remaining consumers"
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ensure_streams, BackoffSchedule, BusError, EventPublisher, InMemoryBroker,
        JetStreamPublisher, NewEvent,
    };
    use std::future::Future;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    const STREAM: &str = "identity-stream";
    const DURABLE: &str = "user-created-processor";

    struct RecordingHandler {
        fail_first: u32,
        delay: Duration,
        slow_calls: u32,
        calls: AtomicU32,
        traces: std::sync::Mutex<Vec<Uuid>>,
    }

    impl RecordingHandler {
        fn failing(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                fail_first,
                delay: Duration::ZERO,
                slow_calls: 0,
                calls: AtomicU32::new(0),
                traces: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                fail_first: 0,
                delay,
                slow_calls: u32::MAX,
                calls: AtomicU32::new(0),
                traces: std::sync::Mutex::new(Vec::new()),
            })
        }

        /// Only the first call takes `delay`
        fn slow_once(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                fail_first: 0,
                delay,
                slow_calls: 1,
                calls: AtomicU32::new(0),
                traces: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle(&self, ctx: &RequestContext, _envelope: &EventEnvelope) -> Result<(), HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.traces.lock().unwrap().push(ctx.trace().trace_id());
            if call <= self.slow_calls && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if call <= self.fail_first {
                return Err(format!("attempt {} failed", call).into());
            }
            Ok(())
        }
    }

    fn fast_policy() -> DeliveryPolicy {
        DeliveryPolicy {
            max_deliver: 5,
            ack_wait: Duration::from_secs(1),
            backoff: BackoffSchedule::exponential(Duration::from_millis(10), 4),
        }
    }

    struct Harness {
        broker: Arc<InMemoryBroker>,
        router: Arc<StreamRouter>,
        publisher: JetStreamPublisher,
    }

    impl Harness {
        async fn new() -> Self {
            let broker = Arc::new(InMemoryBroker::new());
            let router = Arc::new(StreamRouter::with_default_streams().unwrap());
            ensure_streams(broker.as_ref(), &router).await;
            let publisher = JetStreamPublisher::new(broker.clone(), router.clone());
            Self {
                broker,
                router,
                publisher,
            }
        }

        fn subscriber(&self) -> DurableSubscriber {
            DurableSubscriber::new(self.broker.clone(), self.router.clone(), fast_policy())
        }

        async fn publish_user_created(&self) -> EventEnvelope {
            let envelope = EventEnvelope::new(NewEvent {
                event_type: "user.created".to_string(),
                schema_version: "v1.0.0".to_string(),
                source: "IdentityService".to_string(),
                correlation_id: Uuid::new_v4(),
                trace_id: Uuid::new_v4(),
                payload: br#"{"userId":"u-1"}"#.to_vec(),
                ..Default::default()
            })
            .unwrap();
            let ctx = RequestContext::for_trace(envelope.trace_id());
            self.publisher.publish(&ctx, &envelope).await.unwrap();
            envelope
        }

        async fn stats(&self) -> crate::ConsumerStats {
            self.broker.consumer_stats(STREAM, DURABLE).await.unwrap()
        }
    }

    async fn eventually<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..300 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never held: {}", what);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_then_acked_once() {
        let h = Harness::new().await;
        let subscriber = h.subscriber();
        let handler = RecordingHandler::failing(2);
        subscriber.subscribe("user.created", handler.clone()).await.unwrap();

        h.publish_user_created().await;

        eventually("message acked", || async { h.stats().await.acked == 1 }).await;
        assert_eq!(handler.calls(), 3);
        let stats = h.stats().await;
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.pending, 0);

        subscriber.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_handler_over_ack_wait_is_cut_off_and_redelivered() {
        let h = Harness::new().await;
        let policy = DeliveryPolicy {
            ack_wait: Duration::from_millis(200),
            ..fast_policy()
        };
        let subscriber = DurableSubscriber::new(h.broker.clone(), h.router.clone(), policy);
        let handler = RecordingHandler::slow_once(Duration::from_secs(2));
        subscriber.subscribe("user.created", handler.clone()).await.unwrap();

        let started = tokio::time::Instant::now();
        h.publish_user_created().await;

        eventually("message acked", || async { h.stats().await.acked == 1 }).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(handler.calls(), 2);
        let stats = h.stats().await;
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.pending, 0);

        subscriber.shutdown(Duration::from_secs(1)).await;
    }

    /// Hands out a delivery stream that ends after one message on first attach
    struct EndingOnceBroker {
        inner: Arc<InMemoryBroker>,
        attaches: AtomicU32,
    }

    #[async_trait]
    impl StreamBroker for EndingOnceBroker {
        async fn ensure_stream(&self, definition: &crate::StreamDefinition) -> BusResult<()> {
            self.inner.ensure_stream(definition).await
        }

        async fn publish(&self, message: BusMessage) -> BusResult<crate::PublishReceipt> {
            self.inner.publish(message).await
        }

        async fn attach_consumer(&self, stream: &str, spec: &ConsumerSpec) -> BusResult<DeliveryStream> {
            let deliveries = self.inner.attach_consumer(stream, spec).await?;
            if self.attaches.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(deliveries.take(1).boxed())
            } else {
                Ok(deliveries)
            }
        }
    }

    #[tokio::test]
    async fn test_ended_delivery_stream_is_reattached() {
        let h = Harness::new().await;
        let broker = Arc::new(EndingOnceBroker {
            inner: h.broker.clone(),
            attaches: AtomicU32::new(0),
        });
        let subscriber = DurableSubscriber::new(broker.clone(), h.router.clone(), fast_policy());
        let handler = RecordingHandler::failing(0);
        subscriber.subscribe("user.created", handler.clone()).await.unwrap();

        h.publish_user_created().await;
        h.publish_user_created().await;

        eventually("both acked", || async { h.stats().await.acked == 2 }).await;
        assert_eq!(broker.attaches.load(Ordering::SeqCst), 2);
        assert_eq!(handler.calls(), 2);
        assert_eq!(subscriber.active_subscriptions().await, 1);

        subscriber.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_undecodable_message_is_terminated_without_calling_handler() {
        let h = Harness::new().await;
        let subscriber = h.subscriber();
        let handler = RecordingHandler::failing(0);
        subscriber.subscribe("user.created", handler.clone()).await.unwrap();

        h.broker
            .publish(BusMessage::new("user.created".into(), b"not an envelope".to_vec()))
            .await
            .unwrap();

        eventually("message terminated", || async { h.stats().await.terminated == 1 }).await;
        assert_eq!(handler.calls(), 0);
        assert_eq!(h.stats().await.delivered, 1);

        subscriber.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_persistent_failure_stops_at_max_deliver() {
        let h = Harness::new().await;
        let subscriber = h.subscriber();
        let handler = RecordingHandler::failing(u32::MAX);
        subscriber.subscribe("user.created", handler.clone()).await.unwrap();

        h.publish_user_created().await;

        eventually("message exhausted", || async { h.stats().await.exhausted == 1 }).await;
        assert_eq!(handler.calls(), 5);
        assert_eq!(h.stats().await.acked, 0);

        subscriber.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_ack_failure_leads_to_redelivery() {
        let h = Harness::new().await;
        let subscriber = h.subscriber();
        let handler = RecordingHandler::failing(0);
        subscriber.subscribe("user.created", handler.clone()).await.unwrap();
        h.broker.fail_next_acks(1).await;

        h.publish_user_created().await;

        eventually("message acked", || async { h.stats().await.acked == 1 }).await;
        assert_eq!(handler.calls(), 2);

        subscriber.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_handler_sees_propagated_trace() {
        let h = Harness::new().await;
        let subscriber = h.subscriber();
        let handler = RecordingHandler::failing(0);
        subscriber.subscribe("user.created", handler.clone()).await.unwrap();

        let envelope = h.publish_user_created().await;

        eventually("handler called", || async { handler.calls() == 1 }).await;
        assert_eq!(*handler.traces.lock().unwrap(), vec![envelope.trace_id()]);

        subscriber.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_invalid_subscriptions_are_rejected() {
        let h = Harness::new().await;
        let subscriber = h.subscriber();

        let wildcard = subscriber
            .subscribe("user.*", RecordingHandler::failing(0))
            .await
            .unwrap_err();
        assert!(matches!(wildcard, BusError::InvalidSubject(_)));

        let unrouted = subscriber
            .subscribe("order.placed", RecordingHandler::failing(0))
            .await
            .unwrap_err();
        assert!(matches!(unrouted, BusError::NoStreamConfigured(_)));
        assert!(!unrouted.is_retryable());

        assert_eq!(h.broker.consumer_count().await, 0);
        assert_eq!(subscriber.active_subscriptions().await, 0);
    }

    #[tokio::test]
    async fn test_resubscribe_resumes_committed_position() {
        let h = Harness::new().await;

        let first = h.subscriber();
        let first_handler = RecordingHandler::failing(0);
        first.subscribe("user.created", first_handler.clone()).await.unwrap();
        h.publish_user_created().await;
        eventually("first acked", || async { h.stats().await.acked == 1 }).await;
        first.shutdown(Duration::from_secs(1)).await;

        h.publish_user_created().await;

        let second = h.subscriber();
        let second_handler = RecordingHandler::failing(0);
        second.subscribe("user.created", second_handler.clone()).await.unwrap();
        eventually("second acked", || async { h.stats().await.acked == 2 }).await;

        assert_eq!(first_handler.calls(), 1);
        assert_eq!(second_handler.calls(), 1);
        assert_eq!(h.broker.consumer_count().await, 1);

        second.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_aborts_after_grace() {
        let h = Harness::new().await;
        let subscriber = h.subscriber();
        let handler = RecordingHandler::slow(Duration::from_secs(30));
        subscriber.subscribe("user.created", handler.clone()).await.unwrap();
        h.publish_user_created().await;
        eventually("handler started", || async { handler.calls() == 1 }).await;

        let started = tokio::time::Instant::now();
        subscriber.shutdown(Duration::from_millis(50)).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(subscriber.active_subscriptions().await, 0);
        assert_eq!(h.stats().await.acked, 0);
    }
}
