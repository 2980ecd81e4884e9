//! Outbox handlers for account events.

use std::sync::Arc;

use async_trait::async_trait;
use ledgerfold::{BoxError, Outbox, OutboxHandler, OutboxItem};

use crate::domain::ACCOUNT_EVENT_TYPES;

/// Writes every committed account event to the log.
#[derive(Debug, Default)]
pub struct AuditLogHandler;

#[async_trait]
impl OutboxHandler for AuditLogHandler {
    fn name(&self) -> &str {
        "audit-log"
    }

    async fn handle(&self, item: &OutboxItem) -> Result<(), BoxError> {
        tracing::info!(
            stream = %item.stream_id,
            version = item.version,
            event_type = %item.event_type,
            event_id = %item.event_id,
            payload = %item.payload,
            "account event committed"
        );
        Ok(())
    }
}

/// Build the outbox with [`AuditLogHandler`] registered for every account
/// event type.
pub fn build_outbox() -> Outbox {
    let handler: Arc<dyn OutboxHandler> = Arc::new(AuditLogHandler);
    ACCOUNT_EVENT_TYPES
        .iter()
        .fold(Outbox::builder(), |builder, event_type| {
            builder.register_handler(*event_type, Arc::clone(&handler))
        })
        .build()
}
