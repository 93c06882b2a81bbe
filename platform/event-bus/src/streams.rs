//! Static stream definitions and subject → stream routing
//!
//! Every durable stream is declared once at process start. A subject belongs
//! to the stream whose declared pattern captures it under NATS wildcard rules,
//! the same rule the broker applies on append. Declared patterns whose literal
//! prefixes overlap are rejected up front so the result never depends on order.

use std::time::Duration;

use crate::subject::matches_pattern;
use crate::{BusError, BusResult};

/// Where the broker keeps stream data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    File,
    Memory,
}

/// When the broker may discard stream messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionClass {
    /// Keep until a size or age limit is hit
    Limits,
    /// Remove once every bound consumer acknowledged
    Interest,
    /// Remove on first acknowledgment
    WorkQueue,
}

/// A durable stream and the subjects it owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDefinition {
    pub name: String,
    pub subjects: Vec<String>,
    pub storage: StorageClass,
    pub replicas: usize,
    pub max_messages: i64,
    pub max_age: Duration,
    pub retention: RetentionClass,
}

impl StreamDefinition {
    /// Stream with the platform retention defaults: file storage, 3 replicas,
    /// 10,000 messages, 24 hours, limits-based retention
    pub fn with_defaults(name: &str, subjects: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            storage: StorageClass::File,
            replicas: 3,
            max_messages: 10_000,
            max_age: Duration::from_secs(24 * 60 * 60),
            retention: RetentionClass::Limits,
        }
    }
}

/// Streams declared by the platform
pub fn default_stream_definitions() -> Vec<StreamDefinition> {
    vec![
        StreamDefinition::with_defaults("identity-stream", &["user.*"]),
        StreamDefinition::with_defaults("wallet-stream", &["wallet.*"]),
        StreamDefinition::with_defaults("notification-stream", &["notification.*"]),
        StreamDefinition::with_defaults("dlq-stream", &["dlq.*"]),
    ]
}

/// Literal part of a subject pattern: `user.*` → `user.`, `a.b.>` → `a.b.`
fn literal_prefix(pattern: &str) -> &str {
    pattern
        .strip_suffix('*')
        .or_else(|| pattern.strip_suffix('>'))
        .unwrap_or(pattern)
}

/// Resolves subjects to the stream that retains them
#[derive(Debug, Clone)]
pub struct StreamRouter {
    definitions: Vec<StreamDefinition>,
}

impl StreamRouter {
    /// Build a router, rejecting definitions whose prefixes overlap
    pub fn new(definitions: Vec<StreamDefinition>) -> BusResult<Self> {
        let mut owned: Vec<(&str, &str)> = Vec::new();
        for def in &definitions {
            if def.subjects.is_empty() {
                return Err(BusError::Configuration(format!(
                    "stream {} declares no subjects",
                    def.name
                )));
            }
            for pattern in &def.subjects {
                let prefix = literal_prefix(pattern);
                if prefix.is_empty() {
                    return Err(BusError::Configuration(format!(
                        "stream {} declares an empty subject pattern",
                        def.name
                    )));
                }
                if let Some((other_stream, other_prefix)) = owned
                    .iter()
                    .find(|(_, p)| p.starts_with(prefix) || prefix.starts_with(p))
                {
                    return Err(BusError::Configuration(format!(
                        "subject pattern {} of stream {} overlaps {} of stream {}",
                        pattern, def.name, other_prefix, other_stream
                    )));
                }
                owned.push((def.name.as_str(), prefix));
            }
        }
        Ok(Self { definitions })
    }

    /// Router over the platform's declared streams
    pub fn with_default_streams() -> BusResult<Self> {
        Self::new(default_stream_definitions())
    }

    pub fn definitions(&self) -> &[StreamDefinition] {
        &self.definitions
    }

    /// Find the stream that stores `subject`
    ///
    /// # Errors
    /// `BusError::NoStreamConfigured` when no declared pattern captures the
    /// subject. This is a configuration fault and is never retryable.
    pub fn resolve(&self, subject: &str) -> BusResult<&str> {
        self.definitions
            .iter()
            .find(|def| {
                def.subjects
                    .iter()
                    .any(|pattern| matches_pattern(subject, pattern))
            })
            .map(|def| def.name.as_str())
            .ok_or_else(|| BusError::NoStreamConfigured(subject.to_string()))
    }
}
