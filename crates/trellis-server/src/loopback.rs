//! Local development collaborators.
//!
//! The real agent and image backends live outside this repository; these
//! stand-ins make the server runnable (and the turn pipeline observable)
//! without any upstream configured.

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use trellis_chain::ModelContent;
use trellis_chat::gen_message_id;
use trellis_protocol_ai_sdk::FinishReason;
use trellis_stream::{
    AgentEvent, AgentEventStream, AgentRunner, AgentTurnInput, GeneratedImages, ImageGenerator,
    StreamError,
};

/// Echoes the latest user text back as a streamed turn.
pub struct LoopbackAgent;

#[async_trait]
impl AgentRunner for LoopbackAgent {
    async fn run(
        &self,
        input: AgentTurnInput,
        _cancel: CancellationToken,
    ) -> Result<AgentEventStream, StreamError> {
        let prompt = input
            .messages
            .last()
            .map(|m| {
                m.content
                    .iter()
                    .filter_map(|c| match c {
                        ModelContent::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();

        let text_id = gen_message_id();
        let mut events = vec![
            AgentEvent::StepStart,
            AgentEvent::TextStart {
                id: text_id.clone(),
            },
            AgentEvent::TextDelta {
                id: text_id.clone(),
                text: format!("You said: {prompt}"),
            },
            AgentEvent::TextEnd { id: text_id },
        ];
        events.push(AgentEvent::Finish {
            finish_reason: FinishReason::Stop,
            usage: None,
        });
        Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
    }
}

/// Image generator used when no backend is configured; every call fails
/// through the normal error-turn path.
pub struct UnconfiguredImages;

#[async_trait]
impl ImageGenerator for UnconfiguredImages {
    async fn generate(
        &self,
        _prompt: &str,
        _cancel: CancellationToken,
    ) -> Result<GeneratedImages, StreamError> {
        Err(StreamError::Upstream(
            "no image backend configured".to_string(),
        ))
    }
}
