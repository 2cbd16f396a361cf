#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use redis::aio::ConnectionManager;
use serde_json::Value;
use tokio::sync::broadcast;

use parley_notify::db::context::{ChatContextStore, MemberState, MemoryChatContext};
use parley_notify::db::pool::DbPool;
use parley_notify::error::{StorageError, TransportError};
use parley_notify::gateway::fanout::{FanoutConfig, FanoutDispatcher, MessageMutation, Mutation};
use parley_notify::gateway::presence::PresenceFilter;
use parley_notify::gateway::publisher::EventPublisher;
use parley_notify::gateway::transport::{BroadcastTransport, Published, RealtimeTransport};
use parley_notify::models::{Chat, ChatRules, Message, Participant};

pub const CHAT_ID: i64 = 10;

/// Dispatcher wired to an in-process transport, plus a subscriber on it.
pub struct Harness {
    pub transport: Arc<BroadcastTransport>,
    pub dispatcher: FanoutDispatcher,
    pub rx: broadcast::Receiver<Arc<Published>>,
}

impl Harness {
    pub fn new(page_size: i64) -> Self {
        let transport = Arc::new(BroadcastTransport::new());
        let rx = transport.subscribe();
        let dispatcher = dispatcher_over(transport.clone(), page_size);
        Self {
            transport,
            dispatcher,
            rx,
        }
    }

    /// Mark `user_ids` as viewing `chat:<CHAT_ID>`.
    pub fn viewing(self, user_ids: &[i64]) -> Self {
        for id in user_ids {
            self.transport.join(&format!("chat:{CHAT_ID}"), *id);
        }
        self
    }

    /// Everything published so far, as (channel, envelope JSON).
    pub fn drain(&mut self) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        while let Ok(p) = self.rx.try_recv() {
            let json: Value = serde_json::from_str(&p.payload).expect("envelope is JSON");
            out.push((p.channel.clone(), json));
        }
        out
    }
}

pub fn dispatcher_over(transport: Arc<dyn RealtimeTransport>, page_size: i64) -> FanoutDispatcher {
    FanoutDispatcher::new(
        PresenceFilter::new(transport.clone(), Duration::from_millis(200)),
        EventPublisher::new(transport),
        FanoutConfig { page_size },
    )
}

/// Envelopes published on `channel`.
pub fn on_channel<'a>(published: &'a [(String, Value)], channel: &str) -> Vec<&'a Value> {
    published
        .iter()
        .filter(|(c, _)| c == channel)
        .map(|(_, v)| v)
        .collect()
}

pub fn ts() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub fn group_chat(participants: &[(i64, &str)]) -> Chat {
    Chat {
        id: CHAT_ID,
        title: "team".to_string(),
        avatar: None,
        participant_ids: participants.iter().map(|(id, _)| *id).collect(),
        participants: participants
            .iter()
            .map(|(id, login)| Participant::new(*id, *login))
            .collect(),
        tet_a_tet: false,
        rules: ChatRules {
            regular_participant_can_write_message: true,
            ..ChatRules::default()
        },
        blog: false,
        last_update_time: ts(),
    }
}

pub fn tet_a_tet(a: (i64, &str), b: (i64, &str)) -> Chat {
    let mut chat = group_chat(&[a, b]);
    chat.title = String::new();
    chat.tet_a_tet = true;
    for p in chat.participants.iter_mut() {
        p.display_name = Some(format!("{} full name", p.login));
    }
    chat
}

pub fn message(id: i64, owner_id: i64, text: &str) -> Message {
    Message {
        id,
        chat_id: CHAT_ID,
        owner_id,
        owner: Some(Participant::new(owner_id, format!("user{owner_id}"))),
        text: text.to_string(),
        create_time: ts(),
        edit_time: None,
        pinned: false,
        published: false,
        blog_post: false,
        embed: None,
    }
}

pub fn message_created(id: i64, owner_id: i64, text: &str) -> Mutation {
    Mutation::MessageCreated(MessageMutation {
        message: message(id, owner_id, text),
        rules: ChatRules::default(),
    })
}

/// Store with the given members of `CHAT_ID`.
pub fn store(members: &[(i64, MemberState)]) -> MemoryChatContext {
    members
        .iter()
        .fold(MemoryChatContext::new(), |s, (id, state)| {
            s.with_member(CHAT_ID, *id, *state)
        })
}

pub fn member() -> MemberState {
    MemberState::default()
}

pub fn admin() -> MemberState {
    MemberState {
        admin: true,
        ..MemberState::default()
    }
}

pub fn unread(count: i64) -> MemberState {
    MemberState {
        unread: count,
        ..MemberState::default()
    }
}

/// Store whose batch reads fail, as if the database went away mid-fan-out.
pub struct DownStore;

#[async_trait]
impl ChatContextStore for DownStore {
    async fn participant_ids(&mut self, _: i64) -> Result<Vec<i64>, StorageError> {
        Err(StorageError::Unavailable("connection reset".into()))
    }

    async fn participant_ids_page(
        &mut self,
        _: i64,
        _: i64,
        _: Option<i64>,
    ) -> Result<Vec<i64>, StorageError> {
        Err(StorageError::Unavailable("connection reset".into()))
    }

    async fn admin_flags(
        &mut self,
        _: &[i64],
        _: i64,
    ) -> Result<std::collections::HashMap<i64, bool>, StorageError> {
        Err(StorageError::Unavailable("connection reset".into()))
    }

    async fn unread_counts(
        &mut self,
        _: &[i64],
        _: i64,
    ) -> Result<std::collections::HashMap<i64, i64>, StorageError> {
        Err(StorageError::Unavailable("connection reset".into()))
    }

    async fn pinned_flags(
        &mut self,
        _: &[i64],
        _: i64,
    ) -> Result<std::collections::HashMap<i64, bool>, StorageError> {
        Err(StorageError::Unavailable("connection reset".into()))
    }
}

/// Transport that refuses to publish on one channel.
pub struct FlakyTransport {
    pub inner: Arc<BroadcastTransport>,
    pub broken_channel: String,
}

#[async_trait]
impl RealtimeTransport for FlakyTransport {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), TransportError> {
        if channel == self.broken_channel {
            return Err(TransportError::Reconnecting);
        }
        self.inner.publish(channel, payload).await
    }

    async fn presence(&self, channel: &str) -> Result<HashSet<i64>, TransportError> {
        self.inner.presence(channel).await
    }
}

// ---------------------------------------------------------------------------
// Live infrastructure
// ---------------------------------------------------------------------------

/// How long a live test waits for redis/postgres before skipping.
const CONNECT_WAIT: Duration = Duration::from_secs(3);

/// Load `.env` from the crate root so tests work from any cwd.
fn load_env() {
    let env_path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    let _ = dotenvy::from_path(env_path);
}

/// Connection to the redis named by `REDIS_URL`. `None` (the test skips)
/// when no server answers.
pub async fn live_redis() -> Option<ConnectionManager> {
    load_env();
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379/0".to_string());
    let client = match redis::Client::open(url.as_str()) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("skipping: invalid REDIS_URL: {e}");
            return None;
        }
    };
    match tokio::time::timeout(CONNECT_WAIT, ConnectionManager::new(client)).await {
        Ok(Ok(conn)) => Some(conn),
        Ok(Err(e)) => {
            eprintln!("skipping: redis unavailable: {e}");
            None
        }
        Err(_) => {
            eprintln!("skipping: redis did not answer");
            None
        }
    }
}

/// Pool on the `_test` twin of `DATABASE_URL`. `None` (the test skips) when
/// the variable is unset or the database does not answer.
pub async fn live_pg() -> Option<DbPool> {
    load_env();
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("skipping: DATABASE_URL not set");
        return None;
    };
    let pool = parley_notify::db::pool::connect(&with_test_db_suffix(&url)).ok()?;
    match tokio::time::timeout(CONNECT_WAIT, pool.get()).await {
        Ok(Ok(_)) => Some(pool),
        Ok(Err(e)) => {
            eprintln!("skipping: postgres unavailable: {e}");
            None
        }
        Err(_) => {
            eprintln!("skipping: postgres did not answer");
            None
        }
    }
}

fn with_test_db_suffix(database_url: &str) -> String {
    let mut parts = database_url.splitn(2, '?');
    let base = parts.next().unwrap_or(database_url);
    let query = parts.next();

    let mut base_parts = base.rsplitn(2, '/');
    let db_name = base_parts.next().unwrap_or("");
    let prefix = base_parts.next().unwrap_or("");

    if db_name.is_empty() || db_name.ends_with("_test") {
        return database_url.to_string();
    }

    let mut updated = format!("{prefix}/{db_name}_test");
    if let Some(query) = query {
        updated.push('?');
        updated.push_str(query);
    }
    updated
}

/// Key namespace unique to one test run, so parallel tests never collide.
pub fn unique_key(prefix: &str) -> String {
    format!("test:{}", parley_common::id::prefixed_ulid(prefix))
}
