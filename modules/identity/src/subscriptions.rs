//! Event subscriptions owned by the identity process

use std::sync::Arc;

use audit::{AuditLogRepository, AuditTrailHandler};
use event_bus::{BusResult, DurableSubscriber};

use crate::contracts::{UserCreatedPayload, USER_CREATED_EVENT_TYPE};

/// Subscribe the audit trail to user events
pub async fn register_subscriptions(
    subscriber: &DurableSubscriber,
    audit_repository: Arc<dyn AuditLogRepository>,
) -> BusResult<()> {
    let handler = Arc::new(AuditTrailHandler::<UserCreatedPayload>::new(audit_repository));

    subscriber
        .subscribe(USER_CREATED_EVENT_TYPE, handler)
        .await
        .map_err(|e| {
            tracing::error!(
                subject = USER_CREATED_EVENT_TYPE,
                error = %e,
                "Failed to subscribe to user events"
            );
            e
        })
}
