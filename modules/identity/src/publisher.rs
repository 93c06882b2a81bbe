//! Publishing of user lifecycle events

use std::sync::Arc;

use async_trait::async_trait;
use event_bus::{BusResult, EventPublisher, RequestContext};

use crate::contracts::{new_user_created_event, UserCreatedEventInput};

#[async_trait]
pub trait UserEventPublisher: Send + Sync {
    async fn publish_user_created(&self, ctx: &RequestContext, input: UserCreatedEventInput) -> BusResult<()>;
}

/// Builds user event envelopes and hands them to the event bus
#[derive(Clone)]
pub struct UserPublisher {
    bus: Arc<dyn EventPublisher>,
}

impl UserPublisher {
    pub fn new(bus: Arc<dyn EventPublisher>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl UserEventPublisher for UserPublisher {
    async fn publish_user_created(&self, ctx: &RequestContext, input: UserCreatedEventInput) -> BusResult<()> {
        let envelope = new_user_created_event(input)?;
        self.bus.publish(ctx, &envelope).await
    }
}
