//! Stream event types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use trellis_chat::MessageMetadata;

/// Why a turn finished, in the client's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Error,
    Other,
    Unknown,
}

/// Payload of a `data-step-thinking` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepThinkingData {
    pub active: bool,
}

/// Payload of text-carrying data events (`data-revised-prompt`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSnippetData {
    pub text: String,
}

/// One event of the UI message stream.
///
/// Tag strings follow the AI SDK wire protocol; the untagged [`Opaque`]
/// variant carries any event shape this crate does not model, so
/// provider-specific extensions survive a round trip.
///
/// [`Opaque`]: UIStreamEvent::Opaque
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UIStreamEvent {
    /// Opens a turn and names the assistant message being built.
    Start {
        #[serde(rename = "messageId")]
        message_id: String,
    },

    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },

    /// A generated or referenced file.
    File {
        url: String,
        #[serde(rename = "mediaType")]
        media_type: String,
    },

    /// Inter-step idle indicator shown between tool rounds.
    DataStepThinking {
        data: StepThinkingData,
    },

    /// The prompt rewrite an image model actually used.
    DataRevisedPrompt {
        data: TextSnippetData,
    },

    /// Closes a turn.
    Finish {
        #[serde(rename = "finishReason")]
        finish_reason: FinishReason,
        #[serde(rename = "messageMetadata", skip_serializing_if = "Option::is_none")]
        message_metadata: Option<MessageMetadata>,
    },

    /// Stream-level error notice.
    Error {
        #[serde(rename = "errorText")]
        error_text: String,
    },

    /// Any event shape not modeled above, passed through untouched.
    #[serde(untagged)]
    Opaque(Value),
}

impl UIStreamEvent {
    pub fn start(message_id: impl Into<String>) -> Self {
        Self::Start {
            message_id: message_id.into(),
        }
    }

    pub fn text_start(id: impl Into<String>) -> Self {
        Self::TextStart { id: id.into() }
    }

    pub fn text_delta(id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self::TextDelta {
            id: id.into(),
            delta: delta.into(),
        }
    }

    pub fn text_end(id: impl Into<String>) -> Self {
        Self::TextEnd { id: id.into() }
    }

    pub fn file(url: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self::File {
            url: url.into(),
            media_type: media_type.into(),
        }
    }

    pub fn step_thinking(active: bool) -> Self {
        Self::DataStepThinking {
            data: StepThinkingData { active },
        }
    }

    pub fn revised_prompt(text: impl Into<String>) -> Self {
        Self::DataRevisedPrompt {
            data: TextSnippetData { text: text.into() },
        }
    }

    pub fn finish(finish_reason: FinishReason) -> Self {
        Self::Finish {
            finish_reason,
            message_metadata: None,
        }
    }

    pub fn finish_with_metadata(
        finish_reason: FinishReason,
        message_metadata: MessageMetadata,
    ) -> Self {
        Self::Finish {
            finish_reason,
            message_metadata: Some(message_metadata),
        }
    }

    pub fn error(error_text: impl Into<String>) -> Self {
        Self::Error {
            error_text: error_text.into(),
        }
    }
}
