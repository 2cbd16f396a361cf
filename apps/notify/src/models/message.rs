use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DeepClone, Participant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedKind {
    Reply,
    Resend,
}

/// A message quoted by (reply) or forwarded into (resend) another message.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Embed {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_name: Option<String>,
    #[serde(rename = "embedType")]
    pub kind: EmbedKind,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Participant>,
}

impl DeepClone for Embed {
    fn deep_clone(&self) -> Self {
        Self {
            id: self.id,
            chat_id: self.chat_id,
            chat_name: self.chat_name.clone(),
            kind: self.kind,
            text: self.text.clone(),
            owner: self.owner.deep_clone(),
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub chat_id: i64,
    pub owner_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Participant>,
    pub text: String,
    pub create_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub published: bool,
    #[serde(default)]
    pub blog_post: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed: Option<Embed>,
}

impl Message {
    pub fn is_resend(&self) -> bool {
        matches!(&self.embed, Some(embed) if embed.kind == EmbedKind::Resend)
    }
}

impl DeepClone for Message {
    fn deep_clone(&self) -> Self {
        Self {
            id: self.id,
            chat_id: self.chat_id,
            owner_id: self.owner_id,
            owner: self.owner.deep_clone(),
            text: self.text.clone(),
            create_time: self.create_time,
            edit_time: self.edit_time,
            pinned: self.pinned,
            published: self.published,
            blog_post: self.blog_post,
            embed: self.embed.deep_clone(),
        }
    }
}
