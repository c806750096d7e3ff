//! Session (conversation) identity and derived attributes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{ChatMessage, MessagePart};

/// Maximum length, in characters, of a derived session title.
pub const TITLE_MAX_CHARS: usize = 16;

/// A conversation. Created lazily on first message write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Derived from the first user turn; never overwritten once set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Optional workspace binding. Only overwritten by non-empty values.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    /// Optional project binding. Only overwritten by non-empty values.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Sticky error: the last turn's failure text, shown until the next
    /// successful turn clears it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a fresh session row.
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: None,
            workspace_id: None,
            project_id: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Derive a session title from a message's text, capped at
/// [`TITLE_MAX_CHARS`] characters. Returns `None` for blank content.
pub fn derive_title(message: &ChatMessage) -> Option<String> {
    let text = message.parts.iter().find_map(|p| match p {
        MessagePart::Text { text } if !text.trim().is_empty() => Some(text.trim()),
        _ => None,
    })?;
    Some(text.chars().take(TITLE_MAX_CHARS).collect())
}
