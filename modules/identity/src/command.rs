//! Create-user command
//!
//! Runs the create-user use case, then announces the new user on the event
//! bus. The announcement is best-effort: once the user exists the command
//! succeeds, and a failed publish only leaves a gap in downstream audit.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::RequestContext;
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use crate::contracts::{UserCreatedEventInput, UserCreatedPayload};
use crate::publisher::UserEventPublisher;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUserInput {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUserOutput {
    pub user: User,
}

#[derive(Debug, Error)]
pub enum UseCaseError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("user already exists: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Validates, stores and returns a new user
#[async_trait]
pub trait CreateUserUseCase: Send + Sync {
    async fn execute(&self, ctx: &RequestContext, input: NewUserInput) -> Result<CreateUserOutput, UseCaseError>;
}

#[derive(Debug, Clone)]
pub struct CreateUserCommandInput {
    pub correlation_id: Uuid,
    pub trace_id: Uuid,
    pub author_id: Option<Uuid>,
    pub previous_event_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    pub new_user: NewUserInput,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("create user failed: {0}")]
    UseCase(#[from] UseCaseError),
}

pub struct CreateUserCommand {
    use_case: Arc<dyn CreateUserUseCase>,
    publisher: Arc<dyn UserEventPublisher>,
}

impl CreateUserCommand {
    pub fn new(use_case: Arc<dyn CreateUserUseCase>, publisher: Arc<dyn UserEventPublisher>) -> Self {
        Self { use_case, publisher }
    }

    pub async fn execute(&self, input: CreateUserCommandInput) -> Result<CreateUserOutput, CommandError> {
        let span = tracing::info_span!(
            "create_user",
            trace_id = %input.trace_id,
            correlation_id = %input.correlation_id,
        );
        self.run(input).instrument(span).await
    }

    async fn run(&self, input: CreateUserCommandInput) -> Result<CreateUserOutput, CommandError> {
        let ctx = RequestContext::for_trace(input.trace_id);
        tracing::info!(email = %input.new_user.email, "Starting create user command");

        let output = self
            .use_case
            .execute(&ctx, input.new_user)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Create user use case failed");
                e
            })?;

        let event = UserCreatedEventInput {
            correlation_id: input.correlation_id,
            author_id: input.author_id,
            trace_id: input.trace_id,
            previous_event_id: input.previous_event_id,
            causation_id: input.causation_id,
            payload: UserCreatedPayload {
                user_id: output.user.id,
                name: output.user.name.clone(),
                email: output.user.email.clone(),
                phone: output.user.phone.clone(),
            },
        };

        if let Err(e) = self.publisher.publish_user_created(&ctx, event).await {
            tracing::error!(
                user_id = %output.user.id,
                error = %e,
                retryable = e.is_retryable(),
                "Failed to publish user created event"
            );
        }

        tracing::info!(user_id = %output.user.id, "Create user command finished successfully");
        Ok(output)
    }
}
