//! Request-scoped context passed explicitly through publish and handle calls
//!
//! Trace context travels between processes as a W3C `traceparent` header:
//! `00-<trace id, 32 hex>-<span id, 16 hex>-<flags, 2 hex>`. The trace id is
//! the envelope's trace UUID, so logs on both sides of the broker share it.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

pub const TRACEPARENT_HEADER: &str = "traceparent";

const TRACE_VERSION: &str = "00";
const FLAG_SAMPLED: u8 = 0x01;

/// Propagated trace position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceContext {
    trace_id: Uuid,
    span_id: u64,
    sampled: bool,
}

impl TraceContext {
    /// Root span of a new or known trace
    pub fn new(trace_id: Uuid) -> Self {
        Self {
            trace_id,
            span_id: new_span_id(),
            sampled: true,
        }
    }

    /// Next span within the same trace
    pub fn child(&self) -> Self {
        Self {
            span_id: new_span_id(),
            ..*self
        }
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn span_id(&self) -> u64 {
        self.span_id
    }

    pub fn sampled(&self) -> bool {
        self.sampled
    }

    pub fn to_traceparent(&self) -> String {
        let flags = if self.sampled { FLAG_SAMPLED } else { 0 };
        format!(
            "{}-{}-{:016x}-{:02x}",
            TRACE_VERSION,
            self.trace_id.simple(),
            self.span_id,
            flags
        )
    }

    pub fn from_traceparent(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let version = parts.next()?;
        let trace = parts.next()?;
        let span = parts.next()?;
        let flags = parts.next()?;
        if parts.next().is_some() || version != TRACE_VERSION {
            return None;
        }
        if trace.len() != 32 || span.len() != 16 || flags.len() != 2 {
            return None;
        }

        let trace_id = Uuid::try_parse(trace).ok()?;
        let span_id = u64::from_str_radix(span, 16).ok()?;
        let flags = u8::from_str_radix(flags, 16).ok()?;
        if trace_id.is_nil() || span_id == 0 {
            return None;
        }

        Some(Self {
            trace_id,
            span_id,
            sampled: flags & FLAG_SAMPLED != 0,
        })
    }

    pub fn inject(&self, headers: &mut HashMap<String, String>) {
        headers.insert(TRACEPARENT_HEADER.to_string(), self.to_traceparent());
    }

    pub fn extract(headers: &HashMap<String, String>) -> Option<Self> {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(TRACEPARENT_HEADER))
            .and_then(|(_, v)| Self::from_traceparent(v))
    }
}

fn new_span_id() -> u64 {
    loop {
        let id: u64 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

/// Raised when an operation outlives its caller's deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline exceeded")]
pub struct DeadlineExceeded;

/// Per-call context: trace position plus an optional deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    trace: TraceContext,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new(trace: TraceContext) -> Self {
        Self {
            trace,
            deadline: None,
        }
    }

    /// Context rooted in the given trace id
    pub fn for_trace(trace_id: Uuid) -> Self {
        Self::new(TraceContext::new(trace_id))
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Run `fut`, giving up once the deadline passes
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, DeadlineExceeded> {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| DeadlineExceeded),
            None => Ok(fut.await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traceparent_round_trip() {
        let ctx = TraceContext::new(Uuid::new_v4());
        let header = ctx.to_traceparent();

        assert_eq!(header.len(), 55);
        assert!(header.starts_with("00-"));
        assert!(header.ends_with("-01"));
        assert_eq!(TraceContext::from_traceparent(&header), Some(ctx));
    }

    #[test]
    fn test_malformed_traceparent_is_ignored() {
        assert!(TraceContext::from_traceparent("").is_none());
        assert!(TraceContext::from_traceparent("garbage").is_none());
        assert!(TraceContext::from_traceparent(
            "01-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
        )
        .is_none());
        assert!(TraceContext::from_traceparent(
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01"
        )
        .is_none());
        assert!(TraceContext::from_traceparent(
            "00-4bf92f3577b34da6a3ce929d0e0e4736-0000000000000000-01"
        )
        .is_none());
    }

    #[test]
    fn test_child_keeps_trace_and_changes_span() {
        let parent = TraceContext::new(Uuid::new_v4());
        let child = parent.child();
        assert_eq!(child.trace_id(), parent.trace_id());
        assert_ne!(child.span_id(), parent.span_id());
    }

    #[test]
    fn test_inject_extract_headers() {
        let ctx = TraceContext::new(Uuid::new_v4());
        let mut headers = HashMap::new();
        ctx.inject(&mut headers);

        assert_eq!(TraceContext::extract(&headers), Some(ctx));
        assert_eq!(TraceContext::extract(&HashMap::new()), None);
    }

    #[tokio::test]
    async fn test_deadline_cancels_slow_work() {
        let ctx = RequestContext::for_trace(Uuid::new_v4()).with_timeout(Duration::from_millis(10));
        let result = ctx
            .run(tokio::time::sleep(Duration::from_millis(200)))
            .await;
        assert_eq!(result, Err(DeadlineExceeded));

        let unbounded = RequestContext::for_trace(Uuid::new_v4());
        assert_eq!(unbounded.run(async { 7 }).await, Ok(7));
    }
}
