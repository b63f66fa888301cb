use async_trait::async_trait;
use rally_shared::SlotEvent;

/// Outbound event sink. Publishing is fire-and-forget: implementations log
/// delivery failures and never fail the operation that produced the event.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &SlotEvent);
}

/// Discards events; used when no broker is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, event: &SlotEvent) {
        tracing::trace!(topic = event.topic(), "event dropped, no publisher configured");
    }
}
