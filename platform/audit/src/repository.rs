//! Audit log storage

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{AuditError, AuditLogRecord};

/// Upper bound on a single insert
pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of registering a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Inserted,
    /// A record for the same source event already exists
    Duplicate,
}

/// Append-only audit log storage
///
/// Registration is keyed by the source event id, so a redelivered event
/// never produces a second record.
#[async_trait]
pub trait AuditLogRepository: Send + Sync {
    async fn register(&self, record: &AuditLogRecord) -> Result<RegisterOutcome, AuditError>;
}

/// Postgres-backed audit log
#[derive(Debug, Clone)]
pub struct PostgresAuditRepository {
    pool: PgPool,
    statement_timeout: Duration,
}

impl PostgresAuditRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT,
        }
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }

    /// Find the record written for a source event
    pub async fn find_by_event_id(&self, event_id: Uuid) -> Result<Option<AuditLogRecord>, AuditError> {
        let record = sqlx::query_as::<_, AuditLogRecord>(
            r#"
            SELECT id, event_id, event_type, event_version, event_context,
                   trace_id, user_author_id, payload, created_at
            FROM audit_logs
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}

#[async_trait]
impl AuditLogRepository for PostgresAuditRepository {
    async fn register(&self, record: &AuditLogRecord) -> Result<RegisterOutcome, AuditError> {
        let insert = sqlx::query(
            r#"
            INSERT INTO audit_logs (id, event_id, event_type, event_version, event_context,
                                    trace_id, user_author_id, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(record.event_id)
        .bind(&record.event_type)
        .bind(&record.event_version)
        .bind(&record.event_context)
        .bind(record.trace_id)
        .bind(record.user_author_id)
        .bind(&record.payload)
        .bind(record.created_at)
        .execute(&self.pool);

        let result = tokio::time::timeout(self.statement_timeout, insert)
            .await
            .map_err(|_| AuditError::Timeout(self.statement_timeout))??;

        if result.rows_affected() == 0 {
            Ok(RegisterOutcome::Duplicate)
        } else {
            Ok(RegisterOutcome::Inserted)
        }
    }
}

#[derive(Default)]
struct MemoryState {
    records: Vec<AuditLogRecord>,
    event_ids: HashSet<Uuid>,
    failures: u32,
    attempts: u32,
}

/// In-memory audit log for tests and development
#[derive(Default)]
pub struct InMemoryAuditRepository {
    state: Mutex<MemoryState>,
}

impl InMemoryAuditRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` registrations fail
    pub async fn fail_next(&self, count: u32) {
        self.state.lock().await.failures += count;
    }

    pub async fn records(&self) -> Vec<AuditLogRecord> {
        self.state.lock().await.records.clone()
    }

    /// Registrations attempted, failed ones included
    pub async fn attempts(&self) -> u32 {
        self.state.lock().await.attempts
    }
}

#[async_trait]
impl AuditLogRepository for InMemoryAuditRepository {
    async fn register(&self, record: &AuditLogRecord) -> Result<RegisterOutcome, AuditError> {
        let mut state = self.state.lock().await;
        state.attempts += 1;
        if state.failures > 0 {
            state.failures -= 1;
            return Err(AuditError::Storage("simulated storage failure".to_string()));
        }
        if !state.event_ids.insert(record.event_id) {
            return Ok(RegisterOutcome::Duplicate);
        }
        state.records.push(record.clone());
        Ok(RegisterOutcome::Inserted)
    }
}
