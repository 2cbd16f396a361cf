//! Recipient-specific views of chats and messages.
//!
//! Everything here is pure: the same base entity and context always produce
//! the same view, and the base entity is never modified. Each call starts
//! from a fresh [`DeepClone`] of the base, so a view handed to one recipient
//! shares no nested data with the view built for the next.

use serde::Serialize;

use crate::models::{Chat, ChatRules, DeepClone, Message};

/// What the storage layer knows about one recipient in one chat.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecipientContext {
    pub is_admin: bool,
    pub unread_count: i64,
    pub pinned: bool,
}

/// An independently owned copy of `T` plus the fields derived for one viewer.
#[derive(Debug, PartialEq, Serialize)]
pub struct PersonalizedView<T, F> {
    #[serde(flatten)]
    pub entity: T,
    #[serde(flatten)]
    pub fields: F,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatFields {
    pub can_edit: bool,
    pub can_delete: bool,
    pub can_leave: bool,
    pub can_write_message: bool,
    pub can_pin_message: bool,
    pub can_publish_message: bool,
    pub unread_messages: i64,
    pub pinned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFields {
    pub can_edit: bool,
    pub can_delete: bool,
    pub can_pin: bool,
    pub can_publish: bool,
}

pub type ChatView = PersonalizedView<Chat, ChatFields>;
pub type MessageView = PersonalizedView<Message, MessageFields>;

/// Derive the permission and counter fields of a chat for `recipient`.
pub fn chat_fields(chat: &Chat, recipient: i64, ctx: &RecipientContext) -> ChatFields {
    let admin = ctx.is_admin;
    ChatFields {
        can_edit: admin && !chat.tet_a_tet,
        can_delete: admin,
        can_leave: !admin && !chat.tet_a_tet && chat.is_participant(recipient),
        can_write_message: chat.rules.regular_participant_can_write_message || admin,
        can_pin_message: chat.rules.regular_participant_can_pin_message || admin,
        can_publish_message: chat.rules.regular_participant_can_publish_message || admin,
        unread_messages: ctx.unread_count,
        pinned: ctx.pinned,
    }
}

/// Build the view of `base` that `recipient` receives.
///
/// In a tet-a-tet every participant other than the recipient is shown by
/// login, and the chat takes the counterpart's login and avatar as its name
/// and avatar.
pub fn personalize_chat(base: &Chat, recipient: i64, ctx: &RecipientContext) -> ChatView {
    let mut chat = base.deep_clone();

    if chat.tet_a_tet {
        for participant in chat.participants.iter_mut().filter(|p| p.id != recipient) {
            participant.display_name = Some(participant.login.clone());
        }
        if let Some(counterpart) = base.counterpart(recipient) {
            chat.title = counterpart.login.clone();
            chat.avatar = counterpart.avatar.clone();
        }
    }

    let fields = chat_fields(base, recipient, ctx);
    PersonalizedView {
        entity: chat,
        fields,
    }
}

/// Derive the permission fields of a message for `recipient`.
pub fn message_fields(
    message: &Message,
    recipient: i64,
    ctx: &RecipientContext,
    rules: &ChatRules,
) -> MessageFields {
    let own = message.owner_id == recipient;
    MessageFields {
        can_edit: own && !message.is_resend(),
        can_delete: own,
        can_pin: ctx.is_admin || rules.regular_participant_can_pin_message,
        can_publish: ctx.is_admin || rules.regular_participant_can_publish_message,
    }
}

pub fn personalize_message(
    base: &Message,
    recipient: i64,
    ctx: &RecipientContext,
    rules: &ChatRules,
) -> MessageView {
    PersonalizedView {
        entity: base.deep_clone(),
        fields: message_fields(base, recipient, ctx, rules),
    }
}
