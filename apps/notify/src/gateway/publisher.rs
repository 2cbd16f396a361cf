use std::sync::Arc;

use crate::error::PublishError;

use super::events::Envelope;
use super::transport::RealtimeTransport;

/// Serializes envelopes and hands them to the transport. No retry.
#[derive(Clone)]
pub struct EventPublisher {
    transport: Arc<dyn RealtimeTransport>,
}

impl EventPublisher {
    pub fn new(transport: Arc<dyn RealtimeTransport>) -> Self {
        Self { transport }
    }

    pub async fn publish(&self, envelope: &Envelope) -> Result<(), PublishError> {
        let payload = serde_json::to_string(envelope)?;
        self.transport.publish(envelope.channel(), &payload).await?;
        tracing::debug!(
            envelope_id = envelope.id(),
            event_type = envelope.event_type(),
            channel = envelope.channel(),
            "envelope published"
        );
        Ok(())
    }
}
