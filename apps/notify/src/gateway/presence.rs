//! Who is actively viewing a channel right now.
//!
//! Presence is advisory: any failure or slow answer degrades to "nobody is
//! watching", which only makes delivery fall back to the lighter
//! unread-counter event.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::transport::RealtimeTransport;

#[derive(Clone)]
pub struct PresenceFilter {
    transport: Arc<dyn RealtimeTransport>,
    timeout: Duration,
}

impl PresenceFilter {
    pub fn new(transport: Arc<dyn RealtimeTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Snapshot of user ids subscribed to `channel`. Never fails.
    pub async fn active_viewers(&self, channel: &str) -> HashSet<i64> {
        match tokio::time::timeout(self.timeout, self.transport.presence(channel)).await {
            Ok(Ok(viewers)) => viewers,
            Ok(Err(e)) => {
                tracing::warn!(?e, channel, "presence query failed, assuming no viewers");
                HashSet::new()
            }
            Err(_) => {
                tracing::warn!(
                    channel,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "presence query timed out, assuming no viewers"
                );
                HashSet::new()
            }
        }
    }
}
