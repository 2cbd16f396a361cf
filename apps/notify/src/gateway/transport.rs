//! Realtime transport: where serialized envelopes go, and who is listening.
//!
//! Two implementations: an in-process broadcast hub (single-node deployments
//! and tests) and a redis transport (PUBLISH plus per-channel presence hashes).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::sync::broadcast;

use crate::error::TransportError;

/// Publish/presence contract consumed by the publisher and presence filter.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), TransportError>;

    /// User ids currently subscribed to `channel`. Eventually consistent.
    async fn presence(&self, channel: &str) -> Result<HashSet<i64>, TransportError>;
}

// ---------------------------------------------------------------------------
// In-process broadcast transport
// ---------------------------------------------------------------------------

/// Capacity of the broadcast channel. Slow receivers that fall behind will
/// skip messages (RecvError::Lagged).
const BROADCAST_CAPACITY: usize = 4096;

/// One published payload as seen by subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub channel: String,
    pub payload: String,
}

/// Broadcast hub with local presence bookkeeping. Cloneable.
#[derive(Clone)]
pub struct BroadcastTransport {
    sender: broadcast::Sender<Arc<Published>>,
    /// channel -> user id -> number of live subscriptions
    presence: Arc<DashMap<String, HashMap<i64, usize>>>,
}

impl BroadcastTransport {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            sender,
            presence: Arc::new(DashMap::new()),
        }
    }

    /// Each connected session subscribes once and filters by channel locally.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Published>> {
        self.sender.subscribe()
    }

    /// Record a session of `user_id` subscribing to `channel`.
    pub fn join(&self, channel: &str, user_id: i64) {
        let mut entry = self.presence.entry(channel.to_string()).or_default();
        *entry.entry(user_id).or_insert(0) += 1;
    }

    /// Drop one subscription. The user leaves the presence set when their
    /// last session on the channel is gone.
    pub fn leave(&self, channel: &str, user_id: i64) {
        let mut empty = false;
        if let Some(mut entry) = self.presence.get_mut(channel) {
            if let Some(count) = entry.get_mut(&user_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    entry.remove(&user_id);
                }
            }
            empty = entry.is_empty();
        }
        if empty {
            self.presence.remove_if(channel, |_, v| v.is_empty());
        }
    }
}

impl Default for BroadcastTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeTransport for BroadcastTransport {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), TransportError> {
        // send() returns Err if there are no receivers; nobody listening is fine.
        let _ = self.sender.send(Arc::new(Published {
            channel: channel.to_string(),
            payload: payload.to_string(),
        }));
        Ok(())
    }

    async fn presence(&self, channel: &str) -> Result<HashSet<i64>, TransportError> {
        Ok(self
            .presence
            .get(channel)
            .map(|entry| entry.keys().copied().collect())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Redis transport
// ---------------------------------------------------------------------------

/// Presence hash key for a channel: user id -> live session count.
fn presence_key(channel: &str) -> String {
    format!("presence:{channel}")
}

// Same shape as the online counter: nil when the user has no session on the
// channel, field removed when the last one goes.
const LEAVE_CHANNEL: &str = r"
local v = redis.call('HGET', KEYS[1], ARGV[1])
if not v then
  return nil
end
if tonumber(v) <= 1 then
  redis.call('HDEL', KEYS[1], ARGV[1])
  return 0
end
return redis.call('HINCRBY', KEYS[1], ARGV[1], -1)
";

/// PUBLISH over redis pub/sub; presence kept in `presence:<channel>` hashes
/// maintained by the websocket edge, one field per user counting sessions.
#[derive(Clone)]
pub struct RedisTransport {
    conn: ConnectionManager,
    leave: Script,
}

impl RedisTransport {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            leave: Script::new(LEAVE_CHANNEL),
        }
    }

    /// Record a session of `user_id` subscribing to `channel`. Returns the
    /// user's session count on the channel.
    pub async fn join(&self, channel: &str, user_id: i64) -> Result<i64, TransportError> {
        let mut conn = self.conn.clone();
        let sessions: i64 = conn.hincr(presence_key(channel), user_id, 1).await?;
        Ok(sessions)
    }

    /// Drop one session. Returns the remaining count, or `None` if the user
    /// had no session on the channel.
    pub async fn leave(&self, channel: &str, user_id: i64) -> Result<Option<i64>, TransportError> {
        let mut conn = self.conn.clone();
        let sessions: Option<i64> = self
            .leave
            .key(presence_key(channel))
            .arg(user_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(sessions)
    }
}

#[async_trait]
impl RealtimeTransport for RedisTransport {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), TransportError> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(channel, payload).await?;
        tracing::trace!(channel, receivers, "published");
        Ok(())
    }

    async fn presence(&self, channel: &str) -> Result<HashSet<i64>, TransportError> {
        let mut conn = self.conn.clone();
        let members: HashSet<i64> = conn.hkeys(presence_key(channel)).await?;
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_delivers_to_subscribers() {
        let transport = BroadcastTransport::new();
        let mut rx = transport.subscribe();

        transport.publish("personal:1", "{}").await.unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.channel, "personal:1");
        assert_eq!(got.payload, "{}");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let transport = BroadcastTransport::new();
        assert!(transport.publish("chat:1", "{}").await.is_ok());
    }

    #[tokio::test]
    async fn presence_counts_sessions_per_user() {
        let transport = BroadcastTransport::new();
        transport.join("chat:5", 1);
        transport.join("chat:5", 1);
        transport.join("chat:5", 2);

        transport.leave("chat:5", 1);
        let viewers = transport.presence("chat:5").await.unwrap();
        assert_eq!(viewers, HashSet::from([1, 2]));

        transport.leave("chat:5", 1);
        transport.leave("chat:5", 2);
        assert!(transport.presence("chat:5").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn leave_unknown_channel_is_noop() {
        let transport = BroadcastTransport::new();
        transport.leave("chat:404", 1);
        assert!(transport.presence("chat:404").await.unwrap().is_empty());
    }
}
