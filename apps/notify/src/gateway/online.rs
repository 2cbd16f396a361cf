//! Distributed "is this user connected anywhere" counter.
//!
//! Each websocket connection increments `online:<userId>`, each disconnect
//! decrements it. The TTL reaps counters left behind by crashed nodes. The
//! counter is never negative and zero is represented by the key's absence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::db::kv::CounterStore;

use super::events::{Envelope, NotificationEvent, UserOnlineChanged};
use super::publisher::EventPublisher;

/// Counter TTL used when the edge does not configure one.
const DEFAULT_TTL: Duration = Duration::from_secs(120);

/// Settings for [`ConnectionHooks`].
#[derive(Debug, Clone, Copy)]
pub struct OnlineConfig {
    /// Applied on every connect and keep-alive.
    pub ttl: Duration,
}

impl Default for OnlineConfig {
    fn default() -> Self {
        Self { ttl: DEFAULT_TTL }
    }
}

fn online_key(user_id: i64) -> String {
    format!("online:{user_id}")
}

// EXPIRE with 0 would delete the key outright.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[derive(Clone)]
pub struct OnlinePresenceCounter {
    store: Arc<dyn CounterStore>,
}

impl OnlinePresenceCounter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Count one more connection and push the TTL out to `ttl`. Returns the
    /// new count, or `None` if the store could not be reached.
    pub async fn put_online(&self, user_id: i64, ttl: Duration) -> Option<i64> {
        match self
            .store
            .incr_with_ttl(&online_key(user_id), ttl_secs(ttl))
            .await
        {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::error!(?e, user_id, "online counter increment failed");
                None
            }
        }
    }

    /// Count one connection fewer. A user with no counter stays at zero.
    /// Returns the new count, or `None` if nothing was decremented.
    pub async fn remove_online(&self, user_id: i64) -> Option<i64> {
        match self.store.decr_or_delete(&online_key(user_id)).await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(?e, user_id, "online counter decrement failed");
                None
            }
        }
    }

    pub async fn get_online(&self, user_id: i64) -> i64 {
        match self.store.get_count(&online_key(user_id)).await {
            Ok(count) => count.unwrap_or(0).max(0),
            Err(e) => {
                tracing::error!(?e, user_id, "online counter read failed");
                0
            }
        }
    }

    /// Keep-alive: push the TTL out without touching the count.
    pub async fn refresh_online(&self, user_id: i64, ttl: Duration) {
        match self
            .store
            .expire(&online_key(user_id), ttl_secs(ttl))
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::debug!(user_id, "keep-alive for user with no counter"),
            Err(e) => tracing::error!(?e, user_id, "online counter refresh failed"),
        }
    }

    /// Counts for every requested user, zero-filled.
    pub async fn get_online_batch(&self, user_ids: &[i64]) -> HashMap<i64, i64> {
        let mut counts: HashMap<i64, i64> = user_ids.iter().map(|&id| (id, 0)).collect();
        let keys: Vec<String> = user_ids.iter().map(|&id| online_key(id)).collect();
        match self.store.get_counts(&keys).await {
            Ok(values) => {
                for (id, value) in user_ids.iter().zip(values) {
                    counts.insert(*id, value.unwrap_or(0).max(0));
                }
            }
            Err(e) => tracing::error!(?e, users = user_ids.len(), "online batch read failed"),
        }
        counts
    }
}

/// Connection lifecycle hooks: maintain the counter and announce 0 <-> 1
/// transitions on the `user_events` channel.
#[derive(Clone)]
pub struct ConnectionHooks {
    counter: OnlinePresenceCounter,
    publisher: EventPublisher,
    config: OnlineConfig,
}

impl ConnectionHooks {
    pub fn new(
        counter: OnlinePresenceCounter,
        publisher: EventPublisher,
        config: OnlineConfig,
    ) -> Self {
        Self {
            counter,
            publisher,
            config,
        }
    }

    pub fn counter(&self) -> &OnlinePresenceCounter {
        &self.counter
    }

    pub async fn on_connect(&self, user_id: i64) {
        if self.counter.put_online(user_id, self.config.ttl).await == Some(1) {
            self.announce(user_id, true).await;
        }
    }

    pub async fn on_disconnect(&self, user_id: i64) {
        if self.counter.remove_online(user_id).await == Some(0) {
            self.announce(user_id, false).await;
        }
    }

    pub async fn on_keep_alive(&self, user_id: i64) {
        self.counter.refresh_online(user_id, self.config.ttl).await;
    }

    async fn announce(&self, user_id: i64, online: bool) {
        let envelope = Envelope::new(
            user_id,
            NotificationEvent::UserOnlineChanged(UserOnlineChanged { user_id, online }),
        );
        if let Err(e) = self.publisher.publish(&envelope).await {
            tracing::warn!(?e, user_id, online, "failed to announce online change");
        }
    }
}
