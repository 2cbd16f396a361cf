use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DeepClone, Participant};

/// Permission switches a chat applies to its non-admin participants.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRules {
    #[serde(default)]
    pub regular_participant_can_write_message: bool,
    #[serde(default)]
    pub regular_participant_can_publish_message: bool,
    #[serde(default)]
    pub regular_participant_can_pin_message: bool,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "name")]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Every current participant, not only the rendered ones.
    pub participant_ids: Vec<i64>,
    /// The participants rendered alongside the chat (usually the first page).
    #[serde(default)]
    pub participants: Vec<Participant>,
    pub tet_a_tet: bool,
    #[serde(flatten)]
    pub rules: ChatRules,
    #[serde(default)]
    pub blog: bool,
    pub last_update_time: DateTime<Utc>,
}

impl Chat {
    pub fn is_participant(&self, user_id: i64) -> bool {
        self.participant_ids.contains(&user_id)
    }

    /// The other side of a tet-a-tet as seen by `viewer`.
    pub fn counterpart(&self, viewer: i64) -> Option<&Participant> {
        if !self.tet_a_tet {
            return None;
        }
        self.participants.iter().find(|p| p.id != viewer)
    }
}

impl DeepClone for Chat {
    fn deep_clone(&self) -> Self {
        Self {
            id: self.id,
            title: self.title.clone(),
            avatar: self.avatar.clone(),
            participant_ids: self.participant_ids.clone(),
            participants: self.participants.deep_clone(),
            tet_a_tet: self.tet_a_tet,
            rules: self.rules,
            blog: self.blog,
            last_update_time: self.last_update_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tet_a_tet() -> Chat {
        Chat {
            id: 1,
            title: "alice, bob".to_string(),
            avatar: None,
            participant_ids: vec![42, 99],
            participants: vec![Participant::new(42, "alice"), Participant::new(99, "bob")],
            tet_a_tet: true,
            rules: ChatRules::default(),
            blog: false,
            last_update_time: Utc::now(),
        }
    }

    #[test]
    fn counterpart_is_the_other_participant() {
        let chat = tet_a_tet();
        assert_eq!(chat.counterpart(42).unwrap().login, "bob");
        assert_eq!(chat.counterpart(99).unwrap().login, "alice");
    }

    #[test]
    fn group_chat_has_no_counterpart() {
        let mut chat = tet_a_tet();
        chat.tet_a_tet = false;
        assert!(chat.counterpart(42).is_none());
    }

    #[test]
    fn deep_clone_owns_nested_participants() {
        let chat = tet_a_tet();
        let mut copy = chat.deep_clone();
        copy.participants[0].display_name = Some("changed".to_string());
        assert_eq!(chat.participants[0].display_name, None);
        assert_eq!(copy.id, chat.id);
    }

    #[test]
    fn rules_serialize_flat() {
        let mut chat = tet_a_tet();
        chat.rules.regular_participant_can_write_message = true;
        let json = serde_json::to_value(&chat).unwrap();
        assert_eq!(json["regularParticipantCanWriteMessage"], true);
        assert_eq!(json["name"], "alice, bob");
        assert_eq!(json["tetATet"], true);
    }
}
