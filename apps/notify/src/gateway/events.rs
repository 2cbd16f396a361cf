//! Notification envelopes, their payloads, and the channels they travel on.

use chrono::{DateTime, Utc};
use parley_common::id::prefix;
use parley_common::PrefixedId;
use serde::{Deserialize, Serialize};

use crate::models::{DeepClone, Participant};

use super::personalize::{ChatView, MessageView};

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

/// `eventType` discriminators sent to clients.
pub struct EventName;

impl EventName {
    pub const CHAT_CREATED: &'static str = "chat_created";
    pub const CHAT_EDITED: &'static str = "chat_edited";
    pub const CHAT_DELETED: &'static str = "chat_deleted";
    pub const MESSAGE_CREATED: &'static str = "message_created";
    pub const MESSAGE_EDITED: &'static str = "message_edited";
    pub const MESSAGE_DELETED: &'static str = "message_deleted";
    pub const UNREAD_MESSAGES_CHANGED: &'static str = "unread_messages_changed";
    pub const PARTICIPANTS_CHANGED: &'static str = "participants_changed";
    pub const REACTION_CHANGED: &'static str = "reaction_changed";
    pub const MENTION_ADDED: &'static str = "mention_added";
    pub const MENTION_REMOVED: &'static str = "mention_removed";
    pub const REPLY_ADDED: &'static str = "reply_added";
    pub const REPLY_REMOVED: &'static str = "reply_removed";
    pub const PINNED_MESSAGE_PROMOTED: &'static str = "pinned_message_promoted";
    pub const PINNED_MESSAGE_UNPROMOTED: &'static str = "pinned_message_unpromoted";
    pub const USER_TYPING: &'static str = "user_typing";
    pub const USER_ONLINE_CHANGED: &'static str = "user_online_changed";
    pub const USER_PROFILE_CHANGED: &'static str = "user_profile_changed";
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

pub const USER_EVENTS_CHANNEL: &str = "user_events";

/// Per-recipient channel for chat, message, counter and pin events.
pub fn personal_channel(user_id: i64) -> String {
    format!("personal:{user_id}")
}

/// Per-chat broadcast channel. Its presence set is "who is viewing the chat".
pub fn chat_channel(chat_id: i64) -> String {
    format!("chat:{chat_id}")
}

/// Per-recipient channel for mentions, replies and reactions.
pub fn notification_channel(user_id: i64) -> String {
    format!("notifications:{user_id}")
}

/// Which logical channel an event family is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFamily {
    Personal,
    ChatBroadcast,
    UserEvents,
    Notifications,
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatDeleted {
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
    pub id: i64,
    pub chat_id: i64,
}

/// The lighter payload sent instead of a full message to users not viewing
/// the chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadMessagesChanged {
    pub chat_id: i64,
    pub unread_messages: i64,
    pub last_update_time: DateTime<Utc>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantsChanged {
    pub chat_id: i64,
    pub participants: Vec<Participant>,
    pub participants_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionChanged {
    pub chat_id: i64,
    pub message_id: i64,
    pub reaction: String,
    pub count: i64,
    pub by_user_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MentionNotification {
    pub chat_id: i64,
    pub message_id: i64,
    pub chat_title: String,
    pub preview: String,
    pub by_user_id: i64,
    pub by_login: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyNotification {
    pub chat_id: i64,
    pub message_id: i64,
    pub reply_to_message_id: i64,
    pub chat_title: String,
    pub preview: String,
    pub by_user_id: i64,
    pub by_login: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinnedMessageChanged {
    pub chat_id: i64,
    pub message_id: i64,
    pub preview: String,
    pub total_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTyping {
    pub chat_id: i64,
    pub participant_id: i64,
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOnlineChanged {
    pub user_id: i64,
    pub online: bool,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfileChanged {
    pub user: Participant,
}

impl DeepClone for ParticipantsChanged {
    fn deep_clone(&self) -> Self {
        Self {
            chat_id: self.chat_id,
            participants: self.participants.deep_clone(),
            participants_count: self.participants_count,
        }
    }
}

impl DeepClone for UserProfileChanged {
    fn deep_clone(&self) -> Self {
        Self {
            user: self.user.deep_clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Event sum type
// ---------------------------------------------------------------------------

/// The one payload an envelope carries. The variant determines `eventType`,
/// the chat it belongs to and the channel it is published on.
#[derive(Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NotificationEvent {
    ChatCreated(ChatView),
    ChatEdited(ChatView),
    ChatDeleted(ChatDeleted),
    MessageCreated(MessageView),
    MessageEdited(MessageView),
    MessageDeleted(MessageDeleted),
    UnreadMessagesChanged(UnreadMessagesChanged),
    ParticipantsChanged(ParticipantsChanged),
    ReactionChanged(ReactionChanged),
    MentionAdded(MentionNotification),
    MentionRemoved(MentionNotification),
    ReplyAdded(ReplyNotification),
    ReplyRemoved(ReplyNotification),
    PinnedMessagePromoted(PinnedMessageChanged),
    PinnedMessageUnpromoted(PinnedMessageChanged),
    UserTyping(UserTyping),
    UserOnlineChanged(UserOnlineChanged),
    UserProfileChanged(UserProfileChanged),
}

impl NotificationEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ChatCreated(_) => EventName::CHAT_CREATED,
            Self::ChatEdited(_) => EventName::CHAT_EDITED,
            Self::ChatDeleted(_) => EventName::CHAT_DELETED,
            Self::MessageCreated(_) => EventName::MESSAGE_CREATED,
            Self::MessageEdited(_) => EventName::MESSAGE_EDITED,
            Self::MessageDeleted(_) => EventName::MESSAGE_DELETED,
            Self::UnreadMessagesChanged(_) => EventName::UNREAD_MESSAGES_CHANGED,
            Self::ParticipantsChanged(_) => EventName::PARTICIPANTS_CHANGED,
            Self::ReactionChanged(_) => EventName::REACTION_CHANGED,
            Self::MentionAdded(_) => EventName::MENTION_ADDED,
            Self::MentionRemoved(_) => EventName::MENTION_REMOVED,
            Self::ReplyAdded(_) => EventName::REPLY_ADDED,
            Self::ReplyRemoved(_) => EventName::REPLY_REMOVED,
            Self::PinnedMessagePromoted(_) => EventName::PINNED_MESSAGE_PROMOTED,
            Self::PinnedMessageUnpromoted(_) => EventName::PINNED_MESSAGE_UNPROMOTED,
            Self::UserTyping(_) => EventName::USER_TYPING,
            Self::UserOnlineChanged(_) => EventName::USER_ONLINE_CHANGED,
            Self::UserProfileChanged(_) => EventName::USER_PROFILE_CHANGED,
        }
    }

    pub fn chat_id(&self) -> Option<i64> {
        match self {
            Self::ChatCreated(view) | Self::ChatEdited(view) => Some(view.entity.id),
            Self::ChatDeleted(p) => Some(p.id),
            Self::MessageCreated(view) | Self::MessageEdited(view) => Some(view.entity.chat_id),
            Self::MessageDeleted(p) => Some(p.chat_id),
            Self::UnreadMessagesChanged(p) => Some(p.chat_id),
            Self::ParticipantsChanged(p) => Some(p.chat_id),
            Self::ReactionChanged(p) => Some(p.chat_id),
            Self::MentionAdded(p) | Self::MentionRemoved(p) => Some(p.chat_id),
            Self::ReplyAdded(p) | Self::ReplyRemoved(p) => Some(p.chat_id),
            Self::PinnedMessagePromoted(p) | Self::PinnedMessageUnpromoted(p) => Some(p.chat_id),
            Self::UserTyping(p) => Some(p.chat_id),
            Self::UserOnlineChanged(_) | Self::UserProfileChanged(_) => None,
        }
    }

    pub fn family(&self) -> EventFamily {
        match self {
            Self::UserTyping(_) => EventFamily::ChatBroadcast,
            Self::UserOnlineChanged(_) | Self::UserProfileChanged(_) => EventFamily::UserEvents,
            Self::ReactionChanged(_)
            | Self::MentionAdded(_)
            | Self::MentionRemoved(_)
            | Self::ReplyAdded(_)
            | Self::ReplyRemoved(_) => EventFamily::Notifications,
            _ => EventFamily::Personal,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The unit handed to the transport: one event for one recipient.
///
/// Fields are private so `eventType`, `chatId` and the channel can only be
/// derived from the payload, never set out of step with it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    chat_id: Option<i64>,
    user_id: i64,
    payload: NotificationEvent,
    #[serde(skip)]
    channel: String,
}

impl PrefixedId for Envelope {
    const PREFIX: &'static str = prefix::ENVELOPE;
}

impl Envelope {
    /// Wrap `event` for `user_id`. For broadcast families `user_id` is the
    /// acting user rather than a recipient.
    pub fn new(user_id: i64, event: NotificationEvent) -> Self {
        let chat_id = event.chat_id();
        let channel = match event.family() {
            EventFamily::Personal => personal_channel(user_id),
            EventFamily::Notifications => notification_channel(user_id),
            EventFamily::UserEvents => USER_EVENTS_CHANNEL.to_string(),
            // Every broadcast payload carries its chat.
            EventFamily::ChatBroadcast => chat_channel(chat_id.unwrap_or_default()),
        };
        Self {
            id: Self::generate(),
            event_type: event.event_type(),
            chat_id,
            user_id,
            payload: event,
            channel,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_type(&self) -> &'static str {
        self.event_type
    }

    pub fn chat_id(&self) -> Option<i64> {
        self.chat_id
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn payload(&self) -> &NotificationEvent {
        &self.payload
    }
}
