//! Collaborator interfaces consumed by the orchestrator.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use trellis_chain::{ChainError, ModelMessage};
use trellis_chat::Usage;
use trellis_tree_store::TreeStoreError;

use crate::event::AgentEvent;
use crate::frame::AgentFrame;

/// Turn orchestration errors.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The external agent or model call failed.
    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error(transparent)]
    Store(#[from] TreeStoreError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    /// Cooperative abort observed. A terminal state, not a failure.
    #[error("cancelled")]
    Cancelled,
}

/// Event stream of one agent run.
pub type AgentEventStream = BoxStream<'static, Result<AgentEvent, StreamError>>;

/// Everything an agent needs to produce a turn.
#[derive(Debug, Clone)]
pub struct AgentTurnInput {
    pub session_id: String,
    /// Model-ready conversation, oldest first.
    pub messages: Vec<ModelMessage>,
    pub frame: AgentFrame,
}

/// Opaque async event source driving a streaming turn.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        input: AgentTurnInput,
        cancel: CancellationToken,
    ) -> Result<AgentEventStream, StreamError>;
}

/// One produced image artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFile {
    pub url: String,
    pub media_type: String,
}

/// Complete result of a synchronous image-generation call.
#[derive(Debug, Clone, Default)]
pub struct GeneratedImages {
    pub files: Vec<GeneratedFile>,
    /// The prompt rewrite the image model actually used, if reported.
    pub revised_prompt: Option<String>,
    pub usage: Option<Usage>,
}

/// Synchronous image generation; no multi-step streaming.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<GeneratedImages, StreamError>;
}

/// Called once per session before the first real turn; must be
/// idempotent, so calling it every turn is safe.
#[async_trait]
pub trait PrefaceEnsurer: Send + Sync {
    async fn ensure(&self, session_id: &str) -> Result<(), StreamError>;
}

/// Preface ensurer that does nothing.
pub struct NoopPreface;

#[async_trait]
impl PrefaceEnsurer for NoopPreface {
    async fn ensure(&self, _session_id: &str) -> Result<(), StreamError> {
        Ok(())
    }
}
