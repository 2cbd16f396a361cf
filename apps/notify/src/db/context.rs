//! Batched reads of the per-recipient facts personalization needs.
//!
//! Implementations are scoped to one connection (usually the transaction that
//! produced the mutation) so every read sees the same snapshot. Every batch
//! method returns an entry for each requested id, zero-filled.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use diesel::prelude::*;
use diesel::sql_types::{Array, BigInt};
use diesel_async::AsyncPgConnection;

use crate::db::schema::chat_participant;
use crate::error::StorageError;

#[async_trait]
pub trait ChatContextStore: Send {
    /// All participant ids of a chat, ascending.
    async fn participant_ids(&mut self, chat_id: i64) -> Result<Vec<i64>, StorageError>;

    /// Up to `page_size` participant ids strictly greater than `after`, ascending.
    async fn participant_ids_page(
        &mut self,
        chat_id: i64,
        page_size: i64,
        after: Option<i64>,
    ) -> Result<Vec<i64>, StorageError>;

    async fn admin_flags(
        &mut self,
        user_ids: &[i64],
        chat_id: i64,
    ) -> Result<HashMap<i64, bool>, StorageError>;

    async fn unread_counts(
        &mut self,
        user_ids: &[i64],
        chat_id: i64,
    ) -> Result<HashMap<i64, i64>, StorageError>;

    async fn pinned_flags(
        &mut self,
        user_ids: &[i64],
        chat_id: i64,
    ) -> Result<HashMap<i64, bool>, StorageError>;
}

fn zero_filled<V: Copy + Default>(user_ids: &[i64], found: Vec<(i64, V)>) -> HashMap<i64, V> {
    let mut map: HashMap<i64, V> = user_ids.iter().map(|&id| (id, V::default())).collect();
    for (id, value) in found {
        if let Some(slot) = map.get_mut(&id) {
            *slot = value;
        }
    }
    map
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

#[derive(Debug, QueryableByName)]
struct UnreadRow {
    #[diesel(sql_type = BigInt)]
    user_id: i64,
    #[diesel(sql_type = BigInt)]
    unread_count: i64,
}

/// Context reads over a borrowed connection. Pass the transaction's
/// connection to read the mutation's own snapshot.
pub struct PgChatContext<'c> {
    conn: &'c mut AsyncPgConnection,
}

impl<'c> PgChatContext<'c> {
    pub fn new(conn: &'c mut AsyncPgConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl<'c> ChatContextStore for PgChatContext<'c> {
    async fn participant_ids(&mut self, chat_id: i64) -> Result<Vec<i64>, StorageError> {
        let ids: Vec<i64> = diesel_async::RunQueryDsl::load(
            chat_participant::table
                .filter(chat_participant::chat_id.eq(chat_id))
                .order(chat_participant::user_id.asc())
                .select(chat_participant::user_id),
            &mut *self.conn,
        )
        .await?;
        Ok(ids)
    }

    async fn participant_ids_page(
        &mut self,
        chat_id: i64,
        page_size: i64,
        after: Option<i64>,
    ) -> Result<Vec<i64>, StorageError> {
        let ids: Vec<i64> = diesel_async::RunQueryDsl::load(
            chat_participant::table
                .filter(chat_participant::chat_id.eq(chat_id))
                .filter(chat_participant::user_id.gt(after.unwrap_or(i64::MIN)))
                .order(chat_participant::user_id.asc())
                .limit(page_size)
                .select(chat_participant::user_id),
            &mut *self.conn,
        )
        .await?;
        Ok(ids)
    }

    async fn admin_flags(
        &mut self,
        user_ids: &[i64],
        chat_id: i64,
    ) -> Result<HashMap<i64, bool>, StorageError> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<(i64, bool)> = diesel_async::RunQueryDsl::load(
            chat_participant::table
                .filter(chat_participant::chat_id.eq(chat_id))
                .filter(chat_participant::user_id.eq_any(user_ids))
                .select((chat_participant::user_id, chat_participant::admin)),
            &mut *self.conn,
        )
        .await?;
        Ok(zero_filled(user_ids, rows))
    }

    async fn unread_counts(
        &mut self,
        user_ids: &[i64],
        chat_id: i64,
    ) -> Result<HashMap<i64, i64>, StorageError> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<UnreadRow> = diesel_async::RunQueryDsl::load(
            diesel::sql_query(
                "SELECT \
                    cp.user_id AS user_id, \
                    COUNT(m.id) AS unread_count \
                FROM chat_participant cp \
                LEFT JOIN message_read mr \
                    ON mr.chat_id = cp.chat_id AND mr.user_id = cp.user_id \
                LEFT JOIN message m \
                    ON m.chat_id = cp.chat_id \
                    AND m.id > COALESCE(mr.last_message_id, 0) \
                    AND m.owner_id <> cp.user_id \
                WHERE cp.chat_id = $1 AND cp.user_id = ANY($2) \
                GROUP BY cp.user_id",
            )
            .bind::<BigInt, _>(chat_id)
            .bind::<Array<BigInt>, _>(user_ids.to_vec()),
            &mut *self.conn,
        )
        .await?;
        Ok(zero_filled(
            user_ids,
            rows.into_iter().map(|r| (r.user_id, r.unread_count)).collect(),
        ))
    }

    async fn pinned_flags(
        &mut self,
        user_ids: &[i64],
        chat_id: i64,
    ) -> Result<HashMap<i64, bool>, StorageError> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<(i64, bool)> = diesel_async::RunQueryDsl::load(
            chat_participant::table
                .filter(chat_participant::chat_id.eq(chat_id))
                .filter(chat_participant::user_id.eq_any(user_ids))
                .select((chat_participant::user_id, chat_participant::pinned)),
            &mut *self.conn,
        )
        .await?;
        Ok(zero_filled(user_ids, rows))
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (for tests)
// ---------------------------------------------------------------------------

/// Per-participant facts held by [`MemoryChatContext`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MemberState {
    pub admin: bool,
    pub unread: i64,
    pub pinned: bool,
}

#[derive(Default)]
pub struct MemoryChatContext {
    /// chat id -> user id -> state; BTreeMap keeps ids ascending for paging.
    chats: HashMap<i64, BTreeMap<i64, MemberState>>,
    round_trips: usize,
}

impl MemoryChatContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_member(mut self, chat_id: i64, user_id: i64, state: MemberState) -> Self {
        self.chats.entry(chat_id).or_default().insert(user_id, state);
        self
    }

    /// Number of store calls made so far. One call stands for one round trip.
    pub fn round_trips(&self) -> usize {
        self.round_trips
    }

    fn member(&self, chat_id: i64, user_id: i64) -> Option<&MemberState> {
        self.chats.get(&chat_id).and_then(|m| m.get(&user_id))
    }

    fn batch<V>(
        &mut self,
        user_ids: &[i64],
        chat_id: i64,
        pick: impl Fn(&MemberState) -> V,
    ) -> Vec<(i64, V)> {
        self.round_trips += 1;
        user_ids
            .iter()
            .filter_map(|&id| self.member(chat_id, id).map(|s| (id, pick(s))))
            .collect()
    }
}

#[async_trait]
impl ChatContextStore for MemoryChatContext {
    async fn participant_ids(&mut self, chat_id: i64) -> Result<Vec<i64>, StorageError> {
        self.round_trips += 1;
        Ok(self
            .chats
            .get(&chat_id)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn participant_ids_page(
        &mut self,
        chat_id: i64,
        page_size: i64,
        after: Option<i64>,
    ) -> Result<Vec<i64>, StorageError> {
        self.round_trips += 1;
        let Some(members) = self.chats.get(&chat_id) else {
            return Ok(Vec::new());
        };
        let lower = after.map_or(i64::MIN, |a| a.saturating_add(1));
        Ok(members
            .range(lower..)
            .take(page_size.max(0) as usize)
            .map(|(id, _)| *id)
            .collect())
    }

    async fn admin_flags(
        &mut self,
        user_ids: &[i64],
        chat_id: i64,
    ) -> Result<HashMap<i64, bool>, StorageError> {
        let found = self.batch(user_ids, chat_id, |s| s.admin);
        Ok(zero_filled(user_ids, found))
    }

    async fn unread_counts(
        &mut self,
        user_ids: &[i64],
        chat_id: i64,
    ) -> Result<HashMap<i64, i64>, StorageError> {
        let found = self.batch(user_ids, chat_id, |s| s.unread);
        Ok(zero_filled(user_ids, found))
    }

    async fn pinned_flags(
        &mut self,
        user_ids: &[i64],
        chat_id: i64,
    ) -> Result<HashMap<i64, bool>, StorageError> {
        let found = self.batch(user_ids, chat_id, |s| s.pinned);
        Ok(zero_filled(user_ids, found))
    }
}

// ---------------------------------------------------------------------------
// Paging
// ---------------------------------------------------------------------------

/// Keyset cursor over a chat's participant ids.
#[derive(Debug)]
pub struct ParticipantPages {
    chat_id: i64,
    page_size: i64,
    after: Option<i64>,
    done: bool,
}

impl ParticipantPages {
    pub fn new(chat_id: i64, page_size: i64) -> Self {
        Self {
            chat_id,
            page_size: page_size.max(1),
            after: None,
            done: false,
        }
    }

    /// The next non-empty page, or `None` once the chat is exhausted.
    pub async fn next_page<S>(&mut self, store: &mut S) -> Result<Option<Vec<i64>>, StorageError>
    where
        S: ChatContextStore + ?Sized,
    {
        if self.done {
            return Ok(None);
        }
        let page = store
            .participant_ids_page(self.chat_id, self.page_size, self.after)
            .await?;
        if (page.len() as i64) < self.page_size {
            self.done = true;
        }
        match page.last() {
            Some(&last) => {
                self.after = Some(last);
                Ok(Some(page))
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }
}
