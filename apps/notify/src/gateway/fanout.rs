//! Turns one committed mutation into per-recipient envelopes.
//!
//! The pipeline for a mutation is:
//!
//! 1. batch-fetch recipient context (three queries, whatever the recipient
//!    count) when the payload is personalized,
//! 2. take one presence snapshot of `chat:<chatId>` when delivery is
//!    presence-gated,
//! 3. walk recipients in order, personalize, and wrap each payload in an
//!    [`Envelope`],
//! 4. publish, directly or later from an [`Outbox`] once the surrounding
//!    transaction has committed.
//!
//! Nothing here reports back to the write that caused the mutation: a
//! failed context read aborts the fan-out with a log line, a failed publish
//! skips one envelope.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::context::{ChatContextStore, ParticipantPages};
use crate::error::{FanoutError, StorageError};
use crate::models::{Chat, ChatRules, DeepClone, Message};

use super::events::{
    chat_channel, ChatDeleted, Envelope, MentionNotification, MessageDeleted, NotificationEvent,
    ParticipantsChanged, PinnedMessageChanged, ReactionChanged, ReplyNotification,
    UnreadMessagesChanged, UserProfileChanged, UserTyping,
};
use super::personalize::{personalize_chat, personalize_message, RecipientContext};
use super::presence::PresenceFilter;
use super::publisher::EventPublisher;

#[derive(Debug, Clone, Copy)]
pub struct FanoutConfig {
    /// Participants fetched per page when fanning out to a whole chat.
    pub page_size: i64,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self { page_size: 500 }
    }
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

/// A new or edited message together with the rules of its chat.
#[derive(Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMutation {
    pub message: Message,
    #[serde(default)]
    pub rules: ChatRules,
}

/// A committed change that clients have to hear about.
#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "kind", content = "entity", rename_all = "snake_case")]
pub enum Mutation {
    ChatCreated(Chat),
    ChatEdited(Chat),
    ChatDeleted(ChatDeleted),
    MessageCreated(MessageMutation),
    MessageEdited(MessageMutation),
    MessageDeleted(MessageDeleted),
    ParticipantsChanged(ParticipantsChanged),
    ReactionChanged(ReactionChanged),
    MentionAdded(MentionNotification),
    MentionRemoved(MentionNotification),
    ReplyAdded(ReplyNotification),
    ReplyRemoved(ReplyNotification),
    PinnedMessagePromoted(PinnedMessageChanged),
    PinnedMessageUnpromoted(PinnedMessageChanged),
    UserTyping(UserTyping),
    UserProfileChanged(UserProfileChanged),
}

impl Mutation {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChatCreated(_) => "chat_created",
            Self::ChatEdited(_) => "chat_edited",
            Self::ChatDeleted(_) => "chat_deleted",
            Self::MessageCreated(_) => "message_created",
            Self::MessageEdited(_) => "message_edited",
            Self::MessageDeleted(_) => "message_deleted",
            Self::ParticipantsChanged(_) => "participants_changed",
            Self::ReactionChanged(_) => "reaction_changed",
            Self::MentionAdded(_) => "mention_added",
            Self::MentionRemoved(_) => "mention_removed",
            Self::ReplyAdded(_) => "reply_added",
            Self::ReplyRemoved(_) => "reply_removed",
            Self::PinnedMessagePromoted(_) => "pinned_message_promoted",
            Self::PinnedMessageUnpromoted(_) => "pinned_message_unpromoted",
            Self::UserTyping(_) => "user_typing",
            Self::UserProfileChanged(_) => "user_profile_changed",
        }
    }

    pub fn chat_id(&self) -> Option<i64> {
        match self {
            Self::ChatCreated(chat) | Self::ChatEdited(chat) => Some(chat.id),
            Self::ChatDeleted(p) => Some(p.id),
            Self::MessageCreated(m) | Self::MessageEdited(m) => Some(m.message.chat_id),
            Self::MessageDeleted(p) => Some(p.chat_id),
            Self::ParticipantsChanged(p) => Some(p.chat_id),
            Self::ReactionChanged(p) => Some(p.chat_id),
            Self::MentionAdded(p) | Self::MentionRemoved(p) => Some(p.chat_id),
            Self::ReplyAdded(p) | Self::ReplyRemoved(p) => Some(p.chat_id),
            Self::PinnedMessagePromoted(p) | Self::PinnedMessageUnpromoted(p) => Some(p.chat_id),
            Self::UserTyping(p) => Some(p.chat_id),
            Self::UserProfileChanged(_) => None,
        }
    }

    /// Whether the payload is personalized and so needs recipient context.
    pub fn needs_context(&self) -> bool {
        matches!(
            self,
            Self::ChatCreated(_)
                | Self::ChatEdited(_)
                | Self::MessageCreated(_)
                | Self::MessageEdited(_)
        )
    }

    /// Whether recipients not viewing the chat get the unread counter
    /// instead of the full payload.
    pub fn is_presence_gated(&self) -> bool {
        matches!(self, Self::MessageCreated(_))
    }

    /// The user who caused the mutation, when they must not be notified of it.
    pub fn actor(&self) -> Option<i64> {
        match self {
            Self::MessageCreated(m) => Some(m.message.owner_id),
            Self::UserTyping(p) => Some(p.participant_id),
            _ => None,
        }
    }

    /// Broadcast mutations produce a single envelope on a shared channel
    /// instead of one per recipient. Returns the user id it is stamped with.
    fn broadcast_user(&self) -> Option<i64> {
        match self {
            Self::UserTyping(p) => Some(p.participant_id),
            Self::UserProfileChanged(p) => Some(p.user.id),
            _ => None,
        }
    }

    /// The payload `recipient` receives. `ctx` is present whenever
    /// [`Mutation::needs_context`] holds; `viewing` is whether the recipient
    /// is in the chat's presence snapshot.
    fn event_for(
        &self,
        recipient: i64,
        ctx: &RecipientContext,
        viewing: bool,
    ) -> NotificationEvent {
        match self {
            Self::ChatCreated(chat) => {
                NotificationEvent::ChatCreated(personalize_chat(chat, recipient, ctx))
            }
            Self::ChatEdited(chat) => {
                NotificationEvent::ChatEdited(personalize_chat(chat, recipient, ctx))
            }
            Self::ChatDeleted(p) => NotificationEvent::ChatDeleted(p.clone()),
            Self::MessageCreated(m) if viewing => NotificationEvent::MessageCreated(
                personalize_message(&m.message, recipient, ctx, &m.rules),
            ),
            Self::MessageCreated(m) => {
                NotificationEvent::UnreadMessagesChanged(UnreadMessagesChanged {
                    chat_id: m.message.chat_id,
                    unread_messages: ctx.unread_count,
                    last_update_time: m.message.create_time,
                })
            }
            Self::MessageEdited(m) => NotificationEvent::MessageEdited(personalize_message(
                &m.message, recipient, ctx, &m.rules,
            )),
            Self::MessageDeleted(p) => NotificationEvent::MessageDeleted(p.clone()),
            Self::ParticipantsChanged(p) => NotificationEvent::ParticipantsChanged(p.deep_clone()),
            Self::ReactionChanged(p) => NotificationEvent::ReactionChanged(p.clone()),
            Self::MentionAdded(p) => NotificationEvent::MentionAdded(p.clone()),
            Self::MentionRemoved(p) => NotificationEvent::MentionRemoved(p.clone()),
            Self::ReplyAdded(p) => NotificationEvent::ReplyAdded(p.clone()),
            Self::ReplyRemoved(p) => NotificationEvent::ReplyRemoved(p.clone()),
            Self::PinnedMessagePromoted(p) => NotificationEvent::PinnedMessagePromoted(p.clone()),
            Self::PinnedMessageUnpromoted(p) => {
                NotificationEvent::PinnedMessageUnpromoted(p.clone())
            }
            Self::UserTyping(p) => NotificationEvent::UserTyping(p.clone()),
            Self::UserProfileChanged(p) => NotificationEvent::UserProfileChanged(p.deep_clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Recipient contexts for one chat, assembled from the three batch reads.
#[derive(Debug, Default)]
pub struct FanoutContext {
    entries: HashMap<i64, RecipientContext>,
}

impl FanoutContext {
    pub async fn fetch<S>(
        store: &mut S,
        chat_id: i64,
        recipients: &[i64],
    ) -> Result<Self, StorageError>
    where
        S: ChatContextStore + ?Sized,
    {
        let admin = store.admin_flags(recipients, chat_id).await?;
        let unread = store.unread_counts(recipients, chat_id).await?;
        let pinned = store.pinned_flags(recipients, chat_id).await?;

        let entries = recipients
            .iter()
            .filter_map(|id| {
                Some((
                    *id,
                    RecipientContext {
                        is_admin: *admin.get(id)?,
                        unread_count: *unread.get(id)?,
                        pinned: *pinned.get(id)?,
                    },
                ))
            })
            .collect();
        Ok(Self { entries })
    }

    pub fn get(&self, user_id: i64) -> Option<&RecipientContext> {
        self.entries.get(&user_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// What happened to one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Envelopes handed to the transport.
    pub published: usize,
    /// Envelopes the publisher rejected.
    pub failed: usize,
    /// Recipients dropped before an envelope was built.
    pub skipped: usize,
    /// Envelopes left unpublished because the flush was cancelled.
    pub cancelled: usize,
    /// The fan-out never started: the context read failed.
    pub aborted: bool,
}

impl DeliveryReport {
    pub fn aborted() -> Self {
        Self {
            aborted: true,
            ..Self::default()
        }
    }

    pub fn merge(&mut self, other: DeliveryReport) {
        self.published += other.published;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.cancelled += other.cancelled;
        self.aborted |= other.aborted;
    }
}

/// Envelopes prepared inside a transaction, published only once it commits.
///
/// Return the outbox from the transaction closure and flush it after the
/// commit. Dropping it (rollback, early return) publishes nothing.
#[must_use = "an outbox publishes nothing until it is flushed"]
#[derive(Debug, Default)]
pub struct Outbox {
    envelopes: Vec<Envelope>,
    skipped: usize,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, envelope: Envelope) {
        self.envelopes.push(envelope);
    }

    pub fn extend(&mut self, other: Outbox) {
        self.envelopes.extend(other.envelopes);
        self.skipped += other.skipped;
    }

    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    pub fn envelopes(&self) -> &[Envelope] {
        &self.envelopes
    }

    /// Publish every envelope in order. Failures are logged and skipped.
    pub async fn flush(self, publisher: &EventPublisher) -> DeliveryReport {
        self.flush_until(publisher, &CancellationToken::new()).await
    }

    /// Like [`Outbox::flush`], but stops at the first envelope boundary after
    /// `shutdown` fires. Unsent envelopes are counted as cancelled.
    pub async fn flush_until(
        self,
        publisher: &EventPublisher,
        shutdown: &CancellationToken,
    ) -> DeliveryReport {
        let mut report = DeliveryReport {
            skipped: self.skipped,
            ..DeliveryReport::default()
        };
        let total = self.envelopes.len();

        for (sent, envelope) in self.envelopes.into_iter().enumerate() {
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    report.cancelled = total - sent;
                    tracing::warn!(unsent = report.cancelled, "outbox flush cancelled");
                    break;
                }
                result = publisher.publish(&envelope) => result,
            };
            match result {
                Ok(()) => report.published += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        ?e,
                        envelope_id = envelope.id(),
                        user_id = envelope.user_id(),
                        event_type = envelope.event_type(),
                        "envelope publish failed, skipping"
                    );
                }
            }
        }

        report
    }

    /// Flush on a detached task, so a caller that goes away after commit
    /// cannot interrupt delivery midway.
    pub fn spawn_flush(self, publisher: EventPublisher) -> JoinHandle<DeliveryReport> {
        tokio::spawn(async move { self.flush(&publisher).await })
    }

    /// Drop every prepared envelope without publishing. Returns how many.
    pub fn discard(self) -> usize {
        let dropped = self.envelopes.len();
        if dropped > 0 {
            tracing::debug!(dropped, "outbox discarded");
        }
        dropped
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct FanoutDispatcher {
    presence: PresenceFilter,
    publisher: EventPublisher,
    config: FanoutConfig,
}

impl FanoutDispatcher {
    pub fn new(presence: PresenceFilter, publisher: EventPublisher, config: FanoutConfig) -> Self {
        Self {
            presence,
            publisher,
            config,
        }
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    /// Build the envelopes for `mutation` delivered to `recipients` without
    /// publishing them.
    pub async fn prepare<S>(
        &self,
        store: &mut S,
        mutation: &Mutation,
        recipients: &[i64],
    ) -> Result<Outbox, FanoutError>
    where
        S: ChatContextStore + ?Sized,
    {
        if let Some(outbox) = broadcast_outbox(mutation) {
            return Ok(outbox);
        }
        let viewers = self.viewers(mutation).await;
        build_outbox(store, mutation, recipients, &viewers).await
    }

    /// Like [`FanoutDispatcher::prepare`], for every participant of the
    /// mutation's chat, read page by page.
    pub async fn prepare_chat<S>(&self, store: &mut S, mutation: &Mutation) -> Result<Outbox, FanoutError>
    where
        S: ChatContextStore + ?Sized,
    {
        if let Some(outbox) = broadcast_outbox(mutation) {
            return Ok(outbox);
        }
        let Some(chat_id) = mutation.chat_id() else {
            return Ok(Outbox::new());
        };
        let viewers = self.viewers(mutation).await;
        let mut pages = ParticipantPages::new(chat_id, self.config.page_size);
        let mut outbox = Outbox::new();

        while let Some(page) = next_page(&mut pages, store, chat_id).await? {
            outbox.extend(build_outbox(store, mutation, &page, &viewers).await?);
        }
        Ok(outbox)
    }

    /// Prepare and publish. Never fails: problems are logged and reported.
    pub async fn fanout<S>(&self, store: &mut S, mutation: &Mutation, recipients: &[i64]) -> DeliveryReport
    where
        S: ChatContextStore + ?Sized,
    {
        match self.prepare(store, mutation, recipients).await {
            Ok(outbox) => outbox.flush(&self.publisher).await,
            Err(e) => {
                log_abort(mutation, &e);
                DeliveryReport::aborted()
            }
        }
    }

    /// Fan out to a whole chat, publishing each page before reading the next.
    pub async fn fanout_chat<S>(&self, store: &mut S, mutation: &Mutation) -> DeliveryReport
    where
        S: ChatContextStore + ?Sized,
    {
        if let Some(outbox) = broadcast_outbox(mutation) {
            return outbox.flush(&self.publisher).await;
        }
        let Some(chat_id) = mutation.chat_id() else {
            return DeliveryReport::default();
        };
        let viewers = self.viewers(mutation).await;
        let mut pages = ParticipantPages::new(chat_id, self.config.page_size);
        let mut report = DeliveryReport::default();

        loop {
            let page = match next_page(&mut pages, store, chat_id).await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(e) => {
                    log_abort(mutation, &e);
                    report.aborted = true;
                    break;
                }
            };
            match build_outbox(store, mutation, &page, &viewers).await {
                Ok(outbox) => report.merge(outbox.flush(&self.publisher).await),
                Err(e) => {
                    log_abort(mutation, &e);
                    report.aborted = true;
                    break;
                }
            }
        }
        report
    }

    async fn viewers(&self, mutation: &Mutation) -> HashSet<i64> {
        match mutation.chat_id() {
            Some(chat_id) if mutation.is_presence_gated() => {
                self.presence.active_viewers(&chat_channel(chat_id)).await
            }
            _ => HashSet::new(),
        }
    }
}

fn log_abort(mutation: &Mutation, e: &FanoutError) {
    tracing::error!(
        ?e,
        kind = mutation.kind(),
        chat_id = ?mutation.chat_id(),
        "notification fan-out aborted"
    );
}

async fn next_page<S>(
    pages: &mut ParticipantPages,
    store: &mut S,
    chat_id: i64,
) -> Result<Option<Vec<i64>>, FanoutError>
where
    S: ChatContextStore + ?Sized,
{
    pages
        .next_page(store)
        .await
        .map_err(|source| FanoutError::Context { chat_id, source })
}

fn broadcast_outbox(mutation: &Mutation) -> Option<Outbox> {
    let user_id = mutation.broadcast_user()?;
    let mut outbox = Outbox::new();
    outbox.push(Envelope::new(
        user_id,
        mutation.event_for(user_id, &RecipientContext::default(), true),
    ));
    Some(outbox)
}

/// Order-preserving dedup, minus the actor.
fn distinct_recipients(recipients: &[i64], actor: Option<i64>) -> Vec<i64> {
    let mut seen = HashSet::with_capacity(recipients.len());
    recipients
        .iter()
        .copied()
        .filter(|id| Some(*id) != actor && seen.insert(*id))
        .collect()
}

async fn build_outbox<S>(
    store: &mut S,
    mutation: &Mutation,
    recipients: &[i64],
    viewers: &HashSet<i64>,
) -> Result<Outbox, FanoutError>
where
    S: ChatContextStore + ?Sized,
{
    let recipients = distinct_recipients(recipients, mutation.actor());
    let mut outbox = Outbox::new();
    if recipients.is_empty() {
        return Ok(outbox);
    }

    let context = match mutation.chat_id() {
        Some(chat_id) if mutation.needs_context() => Some(
            FanoutContext::fetch(store, chat_id, &recipients)
                .await
                .map_err(|source| FanoutError::Context { chat_id, source })?,
        ),
        _ => None,
    };
    let gated = mutation.is_presence_gated();
    let no_context = RecipientContext::default();

    for recipient in recipients {
        let ctx = match &context {
            Some(context) => match context.get(recipient) {
                Some(ctx) => ctx,
                None => {
                    let e = FanoutError::MissingRecipientContext {
                        user_id: recipient,
                        chat_id: mutation.chat_id().unwrap_or_default(),
                    };
                    tracing::warn!(?e, "skipping recipient");
                    outbox.skipped += 1;
                    continue;
                }
            },
            None => &no_context,
        };
        let viewing = !gated || viewers.contains(&recipient);
        outbox.push(Envelope::new(recipient, mutation.event_for(recipient, ctx, viewing)));
    }

    Ok(outbox)
}
