use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::employee::EmployeeId;

const TITLE_MAX_CHARS: usize = 60;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// One message in a session. Immutable once appended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub tokens_used: Option<u32>,
    pub data_sources: Vec<String>,
    pub is_proactive: bool,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn user(content: impl Into<String>, is_proactive: bool) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            tokens_used: None,
            data_sources: Vec::new(),
            is_proactive,
            created_at: Utc::now(),
        }
    }

    pub fn assistant(
        content: impl Into<String>,
        tokens_used: u32,
        data_sources: Vec<String>,
    ) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
            tokens_used: Some(tokens_used),
            data_sources,
            is_proactive: false,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSession {
    pub id: ConversationId,
    pub owner: EmployeeId,
    pub title: String,
    pub turns: Vec<Turn>,
    pub message_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub archived: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: ConversationId,
    pub title: String,
    pub last_active_at: DateTime<Utc>,
    pub message_count: u32,
}

/// A personalization hint written by the feedback pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub key: String,
    pub value: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl MemoryItem {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|expires_at| expires_at > now).unwrap_or(true)
    }
}

/// Session title derived from the opening message.
pub fn title_from_message(message: &str) -> String {
    let collapsed = message.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= TITLE_MAX_CHARS {
        return collapsed;
    }
    let truncated: String = collapsed.chars().take(TITLE_MAX_CHARS - 1).collect();
    format!("{}…", truncated.trim_end())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{title_from_message, MemoryItem};

    #[test]
    fn long_messages_are_truncated_into_titles() {
        let title = title_from_message(&"how did my team do ".repeat(10));
        assert!(title.chars().count() <= 60);
        assert!(title.ends_with('…'));
        assert_eq!(title_from_message("  what's my\n total  "), "what's my total");
    }

    #[test]
    fn expired_memory_items_are_not_live() {
        let now = Utc::now();
        let expired = MemoryItem {
            key: "tone".to_string(),
            value: "brief".to_string(),
            expires_at: Some(now - Duration::minutes(1)),
        };
        let permanent = MemoryItem { expires_at: None, ..expired.clone() };
        assert!(!expired.is_live(now));
        assert!(permanent.is_live(now));
    }
}
