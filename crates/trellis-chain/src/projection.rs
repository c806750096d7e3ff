//! Projection of a reconstructed chain into model input.
//!
//! Stored parts and model content are different vocabularies: error
//! annotations and unknown extension parts have no model-facing shape,
//! and file references may need resolving (signed URLs, inlined data)
//! before an upstream provider will accept them. Every part the
//! projection cannot carry is reported, never silently lost.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use trellis_chat::{MessagePart, Role};
use trellis_tree_store::StoredMessage;

/// One model-facing message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelMessage {
    pub role: Role,
    pub content: Vec<ModelContent>,
}

/// Model-facing content.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ModelContent {
    Text { text: String },
    File { url: String, media_type: String },
    ToolCall { id: String, name: String, arguments: Value },
    ToolResult { id: String, output: Value },
}

/// A resolved file reference, ready for the provider.
#[derive(Debug, Clone)]
pub struct ResolvedFile {
    pub url: String,
    pub media_type: String,
}

/// Resolves stored file references into provider-acceptable ones.
///
/// Returning `None` drops the part from the model input (and records it
/// in the projection's dropped list).
#[async_trait]
pub trait AttachmentResolver: Send + Sync {
    async fn resolve(&self, url: &str, media_type: &str) -> Option<ResolvedFile>;
}

/// Passes file references through untouched.
pub struct NoopResolver;

#[async_trait]
impl AttachmentResolver for NoopResolver {
    async fn resolve(&self, url: &str, media_type: &str) -> Option<ResolvedFile> {
        Some(ResolvedFile {
            url: url.to_string(),
            media_type: media_type.to_string(),
        })
    }
}

/// A part that could not be carried into model input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DroppedPart {
    pub message_id: String,
    pub reason: String,
}

/// Project a chain into model messages.
///
/// Compaction markers become plain text (their summary stands in for the
/// spliced-out history). Messages whose every part drops are omitted
/// entirely.
pub async fn project_for_model(
    chain: &[StoredMessage],
    resolver: &dyn AttachmentResolver,
) -> (Vec<ModelMessage>, Vec<DroppedPart>) {
    let mut messages = Vec::with_capacity(chain.len());
    let mut dropped = Vec::new();

    for node in chain {
        let mut content = Vec::new();
        for part in &node.message.parts {
            match part {
                MessagePart::Text { text } => {
                    content.push(ModelContent::Text { text: text.clone() });
                }
                MessagePart::Compaction { text } => {
                    content.push(ModelContent::Text { text: text.clone() });
                }
                MessagePart::File { url, media_type } => {
                    match resolver.resolve(url, media_type).await {
                        Some(resolved) => content.push(ModelContent::File {
                            url: resolved.url,
                            media_type: resolved.media_type,
                        }),
                        None => dropped.push(DroppedPart {
                            message_id: node.message.id.clone(),
                            reason: format!("unresolvable file {url}"),
                        }),
                    }
                }
                MessagePart::ToolCall { id, name, arguments } => {
                    content.push(ModelContent::ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: arguments.clone(),
                    });
                }
                MessagePart::ToolResult { id, output } => {
                    content.push(ModelContent::ToolResult {
                        id: id.clone(),
                        output: output.clone(),
                    });
                }
                MessagePart::ErrorText { .. } => dropped.push(DroppedPart {
                    message_id: node.message.id.clone(),
                    reason: "error annotation".to_string(),
                }),
                MessagePart::StepThinking { .. } => {
                    // Transient; never reaches storage, but tolerate it.
                }
                MessagePart::Opaque(_) => dropped.push(DroppedPart {
                    message_id: node.message.id.clone(),
                    reason: "unrecognized part kind".to_string(),
                }),
            }
        }
        if !content.is_empty() {
            messages.push(ModelMessage {
                role: node.message.role,
                content,
            });
        }
    }
    (messages, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use trellis_chat::ChatMessage;

    fn stored(message: ChatMessage) -> StoredMessage {
        StoredMessage {
            session_id: "s1".to_string(),
            parent_message_id: None,
            path: "01".to_string(),
            created_at: Utc::now(),
            message,
        }
    }

    struct RejectAll;

    #[async_trait]
    impl AttachmentResolver for RejectAll {
        async fn resolve(&self, _url: &str, _media_type: &str) -> Option<ResolvedFile> {
            None
        }
    }

    #[tokio::test]
    async fn text_and_tools_project_directly() {
        let chain = vec![stored(ChatMessage::assistant(vec![
            MessagePart::text("answer"),
            MessagePart::ToolCall {
                id: "t1".to_string(),
                name: "search".to_string(),
                arguments: json!({"q": "rust"}),
            },
        ]))];
        let (messages, dropped) = project_for_model(&chain, &NoopResolver).await;
        assert!(dropped.is_empty());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[0].content.len(), 2);
    }

    #[tokio::test]
    async fn compaction_marker_becomes_text() {
        let chain = vec![stored(ChatMessage {
            id: "m".to_string(),
            role: Role::User,
            parts: vec![MessagePart::compaction("earlier: user asked about trees")],
            metadata: None,
        })];
        let (messages, _) = project_for_model(&chain, &NoopResolver).await;
        assert_eq!(
            messages[0].content,
            vec![ModelContent::Text {
                text: "earlier: user asked about trees".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn unresolvable_files_and_error_parts_are_accounted() {
        let msg = ChatMessage::assistant(vec![
            MessagePart::file("blob:abc", "image/png"),
            MessagePart::error_text("upstream failed"),
            MessagePart::text("kept"),
        ])
        .with_id("a1");
        let (messages, dropped) = project_for_model(&[stored(msg)], &RejectAll).await;

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content.len(), 1);
        assert_eq!(dropped.len(), 2);
        assert!(dropped.iter().all(|d| d.message_id == "a1"));
        assert!(dropped[0].reason.contains("blob:abc"));
    }

    #[tokio::test]
    async fn fully_dropped_message_is_omitted() {
        let msg = ChatMessage::assistant(vec![MessagePart::error_text("boom")]).with_id("a1");
        let (messages, dropped) = project_for_model(&[stored(msg)], &NoopResolver).await;
        assert!(messages.is_empty());
        assert_eq!(dropped.len(), 1);
    }
}
