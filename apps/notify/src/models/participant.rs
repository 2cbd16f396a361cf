use serde::{Deserialize, Serialize};

use super::DeepClone;

/// A user as rendered inside a chat, a message owner or an embed.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: i64,
    pub login: String,
    /// Name shown to the viewer. Defaults to the login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl Participant {
    pub fn new(id: i64, login: impl Into<String>) -> Self {
        Self {
            id,
            login: login.into(),
            display_name: None,
            avatar: None,
        }
    }

    /// The name a viewer sees for this participant.
    pub fn shown_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.login)
    }
}

impl DeepClone for Participant {
    fn deep_clone(&self) -> Self {
        Self {
            id: self.id,
            login: self.login.clone(),
            display_name: self.display_name.clone(),
            avatar: self.avatar.clone(),
        }
    }
}
