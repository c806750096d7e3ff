//! Message and content-part types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::metadata::MessageMetadata;

/// Message role.
///
/// Unknown roles on the wire deserialize to `User` — the store never
/// rejects a message because a client sent a role it does not know.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    #[default]
    User,
    Assistant,
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Role::normalize(&raw))
    }
}

impl Role {
    /// Parse a role string; anything unrecognized falls back to `User`.
    pub fn normalize(raw: &str) -> Self {
        match raw {
            "system" => Role::System,
            "assistant" => Role::Assistant,
            _ => Role::User,
        }
    }

    /// Returns `true` for roles whose nodes may be merge-updated in place
    /// (assistant/system continuation writes). User nodes are immutable.
    pub fn is_mergeable(&self) -> bool {
        !matches!(self, Role::User)
    }
}

/// One content part of a message.
///
/// The store treats parts as opaque except for `StepThinking`, which is a
/// transient UI signal and is never persisted. Unrecognized part shapes
/// are carried through the `Opaque` variant so persistence code can
/// filter and sanitize without knowing every part kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    /// Plain text content.
    Text { text: String },

    /// Reference to a stored file (image, attachment).
    File {
        url: String,
        #[serde(rename = "mediaType")]
        media_type: String,
    },

    /// A tool call made by the assistant.
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },

    /// The result of a tool call.
    ToolResult { id: String, output: Value },

    /// History-compaction marker: "summarize everything before me".
    ///
    /// The chain loader hides all ancestors preceding the most recent
    /// marker from the model context; the tree itself keeps full history.
    Compaction { text: String },

    /// Transient inter-step idle indicator. Wire-only, never persisted.
    StepThinking { active: bool },

    /// Error text recorded on a failed turn.
    ErrorText { text: String },

    /// Unrecognized extension part, carried through untouched.
    #[serde(untagged)]
    Opaque(Value),
}

impl MessagePart {
    /// Create a text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create a file reference part.
    pub fn file(url: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self::File {
            url: url.into(),
            media_type: media_type.into(),
        }
    }

    /// Create an error-text part.
    pub fn error_text(text: impl Into<String>) -> Self {
        Self::ErrorText { text: text.into() }
    }

    /// Create a compaction marker part.
    pub fn compaction(text: impl Into<String>) -> Self {
        Self::Compaction { text: text.into() }
    }

    /// Returns `true` for part kinds that must never be persisted.
    pub fn is_transient(&self) -> bool {
        matches!(self, MessagePart::StepThinking { .. })
    }

    /// Returns `true` when this part carries no content on its own
    /// (whitespace-only text).
    pub fn is_blank(&self) -> bool {
        match self {
            MessagePart::Text { text } => text.trim().is_empty(),
            _ => false,
        }
    }
}

/// Generate a time-ordered UUID v7 message identifier.
pub fn gen_message_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// A message in the conversation tree.
///
/// Tree position (session, parent, path) is owned by the store; this is
/// the caller-facing unit of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Stable, caller-supplied identifier (globally unique).
    pub id: String,
    pub role: Role,
    /// Ordered content parts.
    #[serde(default)]
    pub parts: Vec<MessagePart>,
    /// Optional metadata (usage, timing, agent identity, extensions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl ChatMessage {
    /// Create a user message with a single text part.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: gen_message_id(),
            role: Role::User,
            parts: vec![MessagePart::text(text)],
            metadata: None,
        }
    }

    /// Create an assistant message from parts.
    pub fn assistant(parts: Vec<MessagePart>) -> Self {
        Self {
            id: gen_message_id(),
            role: Role::Assistant,
            parts,
            metadata: None,
        }
    }

    /// Create a system message with a single text part.
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            id: gen_message_id(),
            role: Role::System,
            parts: vec![MessagePart::text(text)],
            metadata: None,
        }
    }

    /// Replace the generated id with a caller-supplied one.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Returns `true` when the message carries no persistable content:
    /// every part is transient or whitespace-only text.
    pub fn is_content_empty(&self) -> bool {
        self.parts
            .iter()
            .all(|p| p.is_transient() || p.is_blank())
    }

    /// Returns `true` when this message is a history-compaction marker.
    pub fn is_compaction_marker(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, MessagePart::Compaction { .. }))
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let MessagePart::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_role_deserializes_to_user() {
        let role: Role = serde_json::from_str("\"tool\"").unwrap();
        assert_eq!(role, Role::User);
        let role: Role = serde_json::from_str("\"assistant\"").unwrap();
        assert_eq!(role, Role::Assistant);
    }

    #[test]
    fn parts_round_trip_and_opaque_catch_all() {
        let json = serde_json::json!([
            {"type": "text", "text": "hi"},
            {"type": "file", "url": "blob:1", "mediaType": "image/png"},
            {"type": "data-custom-widget", "data": {"x": 1}},
        ]);
        let parts: Vec<MessagePart> = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(parts[0], MessagePart::text("hi"));
        assert!(matches!(parts[2], MessagePart::Opaque(_)));
        assert_eq!(serde_json::to_value(&parts).unwrap(), json);
    }

    #[test]
    fn content_emptiness() {
        let mut msg = ChatMessage::assistant(vec![]);
        assert!(msg.is_content_empty());

        msg.parts = vec![
            MessagePart::text("   "),
            MessagePart::StepThinking { active: true },
        ];
        assert!(msg.is_content_empty());

        msg.parts.push(MessagePart::text("hello"));
        assert!(!msg.is_content_empty());

        let file_only = ChatMessage::assistant(vec![MessagePart::file("u", "image/png")]);
        assert!(!file_only.is_content_empty());
    }

    #[test]
    fn compaction_marker_detection() {
        let marker = ChatMessage {
            id: gen_message_id(),
            role: Role::User,
            parts: vec![MessagePart::compaction("summarize the above")],
            metadata: None,
        };
        assert!(marker.is_compaction_marker());
        assert!(!ChatMessage::user("plain").is_compaction_marker());
    }

    #[test]
    fn generated_ids_are_uuid_v7() {
        let id = gen_message_id();
        assert_eq!(id.len(), 36);
        assert_eq!(&id[14..15], "7");
    }
}
