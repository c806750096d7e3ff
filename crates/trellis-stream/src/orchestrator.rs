//! Turn orchestration.
//!
//! `stream_turn` drives one streaming chat turn end to end: persist the
//! user node, rebuild the model context, run the agent, pass its events
//! to the wire, and persist the assistant node. The persisted node and
//! the wire stream must agree even when the turn aborts or fails, so
//! every terminal path persists before it flushes its finish event (the
//! abort path persists inside the same finalization step).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use trellis_chain::{AttachmentResolver, ChainLoader, ChainOptions, NoopResolver, project_for_model};
use trellis_chat::{
    gen_message_id, merge_usage, ChatMessage, MessageMetadata, MessagePart, Role, Timing, Usage,
};
use trellis_protocol_ai_sdk::{error_turn_events, FinishReason, UIStreamEvent};
use trellis_tree_store::{SaveMessage, TreeReader, TreeStore};

use crate::encoder::TurnEncoder;
use crate::event::AgentEvent;
use crate::frame::{AgentFrame, AgentFrameStack};
use crate::traits::{AgentRunner, AgentTurnInput, ImageGenerator, PrefaceEnsurer, StreamError};

/// One streaming chat turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub user_message: ChatMessage,
    /// Explicit branch point. `None` continues the rightmost branch.
    pub parent_message_id: Option<String>,
    /// Context window bound for the model call.
    pub max_messages: Option<usize>,
    pub frame: AgentFrame,
    pub workspace_id: Option<String>,
    pub project_id: Option<String>,
}

/// One image-generation turn.
#[derive(Debug, Clone)]
pub struct ImageTurnRequest {
    pub session_id: String,
    pub user_message: ChatMessage,
    pub parent_message_id: Option<String>,
    pub frame: AgentFrame,
    pub workspace_id: Option<String>,
    pub project_id: Option<String>,
}

/// Result of a completed image turn.
#[derive(Debug, Clone)]
pub struct ImageTurn {
    pub message: ChatMessage,
    /// The wire replay of the turn (start, artifacts, finish). Already
    /// persisted; emission failures cannot un-persist it.
    pub events: Vec<UIStreamEvent>,
}

struct PreparedTurn {
    /// Parent for the assistant node: the user node persisted at turn
    /// start, never a leaf recomputed mid-stream.
    assistant_parent: String,
    input: AgentTurnInput,
}

/// Drives streaming and image turns against the store and the agent.
#[derive(Clone)]
pub struct TurnOrchestrator {
    store: Arc<dyn TreeStore>,
    reader: Arc<dyn TreeReader>,
    runner: Arc<dyn AgentRunner>,
    preface: Arc<dyn PrefaceEnsurer>,
    resolver: Arc<dyn AttachmentResolver>,
}

impl TurnOrchestrator {
    pub fn new<S>(store: Arc<S>, runner: Arc<dyn AgentRunner>) -> Self
    where
        S: TreeStore + 'static,
    {
        Self {
            reader: store.clone(),
            store,
            runner,
            preface: Arc::new(crate::traits::NoopPreface),
            resolver: Arc::new(NoopResolver),
        }
    }

    #[must_use]
    pub fn with_preface(mut self, preface: Arc<dyn PrefaceEnsurer>) -> Self {
        self.preface = preface;
        self
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn AttachmentResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Run one streaming turn. The returned stream is the wire payload;
    /// it always terminates with a `finish` event.
    pub fn stream_turn(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> impl Stream<Item = UIStreamEvent> + Send + 'static {
        let this = self.clone();
        stream! {
            let prepared = match this.prepare_turn(
                &request.session_id,
                request.user_message.clone(),
                request.parent_message_id.clone(),
                request.max_messages,
                &request.frame,
                request.workspace_id.clone(),
                request.project_id.clone(),
            ).await {
                Ok(prepared) => prepared,
                Err(err) => {
                    tracing::error!(session_id = %request.session_id, error = %err, "turn setup failed");
                    let text = err.to_string();
                    if let Err(e) = this.store.set_session_error(&request.session_id, Some(&text)).await {
                        tracing::warn!(error = %e, "failed to record session error");
                    }
                    for event in error_turn_events(gen_message_id(), gen_message_id(), &text) {
                        yield event;
                    }
                    return;
                }
            };

            let assistant_id = gen_message_id();
            yield UIStreamEvent::start(assistant_id.clone());

            let stack = AgentFrameStack::new();
            let guard = stack.push(request.frame.clone());
            let started = Instant::now();
            let mut encoder = TurnEncoder::new();
            let mut collector = PartCollector::default();
            let mut usage: Option<Usage> = None;
            let mut finish_reason: Option<FinishReason> = None;

            let mut events = match this.runner.run(prepared.input, cancel.child_token()).await {
                Ok(events) => events,
                Err(err) => {
                    for event in this.fail_turn(
                        &request.session_id,
                        &assistant_id,
                        &prepared.assistant_parent,
                        &request.frame,
                        started,
                        &mut encoder,
                        &err,
                    ).await {
                        yield event;
                    }
                    guard.release();
                    return;
                }
            };

            let mut aborted = false;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        aborted = true;
                        break;
                    }
                    next = events.next() => match next {
                        None => break,
                        Some(Ok(event)) => {
                            collector.collect(&event);
                            if let AgentEvent::UsageReport(u) = &event {
                                usage = merge_usage(usage.as_ref(), Some(u));
                            }
                            let done = if let AgentEvent::Finish { finish_reason: reason, usage: final_usage } = &event {
                                finish_reason = Some(*reason);
                                usage = merge_usage(usage.as_ref(), final_usage.as_ref());
                                true
                            } else {
                                false
                            };
                            for wire in encoder.on_event(&event) {
                                yield wire;
                            }
                            if done {
                                break;
                            }
                        }
                        Some(Err(err)) => {
                            for event in this.fail_turn(
                                &request.session_id,
                                &assistant_id,
                                &prepared.assistant_parent,
                                &request.frame,
                                started,
                                &mut encoder,
                                &err,
                            ).await {
                                yield event;
                            }
                            guard.release();
                            return;
                        }
                    }
                }
            }

            let elapsed_ms = started.elapsed().as_millis() as u64;
            for event in encoder.close() {
                yield event;
            }

            if aborted {
                tracing::info!(session_id = %request.session_id, message_id = %assistant_id, "turn aborted");
                let mut metadata = build_metadata(&request.frame, usage, elapsed_ms);
                metadata.extra.insert("isAborted".to_string(), json!(true));
                metadata.extra.insert("abortedAt".to_string(), json!(Utc::now().to_rfc3339()));
                if let Some(reason) = finish_reason {
                    metadata.extra.insert("finishReason".to_string(), json!(reason));
                }
                let message = ChatMessage {
                    id: assistant_id.clone(),
                    role: Role::Assistant,
                    parts: collector.into_parts(),
                    metadata: Some(metadata.clone()),
                };
                let save = SaveMessage::new(request.session_id.clone(), message)
                    .with_parent(prepared.assistant_parent.clone())
                    .allow_empty();
                if let Err(err) = this.store.save_message(save).await {
                    tracing::error!(error = %err, "failed to persist aborted turn");
                }
                // Sticky session error stays untouched on abort.
                guard.release();
                yield UIStreamEvent::finish_with_metadata(
                    finish_reason.unwrap_or(FinishReason::Unknown),
                    metadata,
                );
                return;
            }

            let metadata = build_metadata(&request.frame, usage, elapsed_ms);
            let message = ChatMessage {
                id: assistant_id.clone(),
                role: Role::Assistant,
                parts: collector.into_parts(),
                metadata: Some(metadata.clone()),
            };
            let save = SaveMessage::new(request.session_id.clone(), message)
                .with_parent(prepared.assistant_parent.clone());
            match this.store.save_message(save).await {
                Ok(outcome) => {
                    tracing::debug!(
                        session_id = %request.session_id,
                        message_id = %assistant_id,
                        path = ?outcome.path(),
                        "assistant turn persisted"
                    );
                    if let Err(err) = this.store.set_session_error(&request.session_id, None).await {
                        tracing::warn!(error = %err, "failed to clear session error");
                    }
                    guard.release();
                    yield UIStreamEvent::finish_with_metadata(
                        finish_reason.unwrap_or(FinishReason::Stop),
                        metadata,
                    );
                }
                Err(err) => {
                    let err = StreamError::Store(err);
                    for event in this.fail_turn(
                        &request.session_id,
                        &assistant_id,
                        &prepared.assistant_parent,
                        &request.frame,
                        started,
                        &mut encoder,
                        &err,
                    ).await {
                        yield event;
                    }
                    guard.release();
                }
            }
        }
    }

    /// Run one image turn to completion. The node is persisted before
    /// this returns; the caller decides how to deliver `events`.
    pub async fn image_turn(
        &self,
        generator: &dyn ImageGenerator,
        request: ImageTurnRequest,
        cancel: CancellationToken,
    ) -> Result<ImageTurn, StreamError> {
        let prepared = self
            .prepare_turn(
                &request.session_id,
                request.user_message.clone(),
                request.parent_message_id.clone(),
                None,
                &request.frame,
                request.workspace_id.clone(),
                request.project_id.clone(),
            )
            .await
            .inspect_err(|err| {
                tracing::error!(session_id = %request.session_id, error = %err, "image turn setup failed");
            })?;

        let stack = AgentFrameStack::new();
        let guard = stack.push(request.frame.clone());
        let started = Instant::now();
        let prompt = request.user_message.text();

        let generated = tokio::select! {
            _ = cancel.cancelled() => Err(StreamError::Cancelled),
            result = generator.generate(&prompt, cancel.child_token()) => result,
        };
        let assistant_id = gen_message_id();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let generated = match generated {
            Ok(generated) => generated,
            Err(StreamError::Cancelled) => {
                let mut metadata = build_metadata(&request.frame, None, elapsed_ms);
                metadata.extra.insert("isAborted".to_string(), json!(true));
                metadata
                    .extra
                    .insert("abortedAt".to_string(), json!(Utc::now().to_rfc3339()));
                let message = ChatMessage {
                    id: assistant_id,
                    role: Role::Assistant,
                    parts: Vec::new(),
                    metadata: Some(metadata),
                };
                let save = SaveMessage::new(request.session_id.clone(), message)
                    .with_parent(prepared.assistant_parent)
                    .allow_empty();
                if let Err(err) = self.store.save_message(save).await {
                    tracing::error!(error = %err, "failed to persist aborted image turn");
                }
                guard.release();
                return Err(StreamError::Cancelled);
            }
            Err(err) => {
                tracing::error!(session_id = %request.session_id, error = %err, "image generation failed");
                let text = err.to_string();
                if let Err(e) = self
                    .store
                    .set_session_error(&request.session_id, Some(&text))
                    .await
                {
                    tracing::warn!(error = %e, "failed to record session error");
                }
                let message = ChatMessage {
                    id: assistant_id,
                    role: Role::Assistant,
                    parts: vec![MessagePart::error_text(text.clone())],
                    metadata: Some(build_metadata(&request.frame, None, elapsed_ms)),
                };
                let save = SaveMessage::new(request.session_id.clone(), message)
                    .with_parent(prepared.assistant_parent);
                if let Err(e) = self.store.save_message(save).await {
                    tracing::error!(error = %e, "failed to persist image error turn");
                }
                guard.release();
                return Err(err);
            }
        };

        let mut metadata = build_metadata(&request.frame, generated.usage, elapsed_ms);
        if let Some(revised) = &generated.revised_prompt {
            metadata
                .extra
                .insert("revisedPrompt".to_string(), json!(revised));
        }
        let parts: Vec<MessagePart> = generated
            .files
            .iter()
            .map(|f| MessagePart::file(f.url.clone(), f.media_type.clone()))
            .collect();
        let message = ChatMessage {
            id: assistant_id.clone(),
            role: Role::Assistant,
            parts,
            metadata: Some(metadata.clone()),
        };
        let save = SaveMessage::new(request.session_id.clone(), message.clone())
            .with_parent(prepared.assistant_parent);
        self.store.save_message(save).await?;
        if let Err(err) = self.store.set_session_error(&request.session_id, None).await {
            tracing::warn!(error = %err, "failed to clear session error");
        }
        guard.release();

        let mut events = vec![UIStreamEvent::start(assistant_id)];
        for file in &generated.files {
            events.push(UIStreamEvent::file(
                file.url.clone(),
                file.media_type.clone(),
            ));
        }
        if let Some(revised) = generated.revised_prompt {
            events.push(UIStreamEvent::revised_prompt(revised));
        }
        events.push(UIStreamEvent::finish_with_metadata(
            FinishReason::Stop,
            metadata,
        ));

        Ok(ImageTurn { message, events })
    }

    #[allow(clippy::too_many_arguments)]
    async fn prepare_turn(
        &self,
        session_id: &str,
        user_message: ChatMessage,
        parent_message_id: Option<String>,
        max_messages: Option<usize>,
        frame: &AgentFrame,
        workspace_id: Option<String>,
        project_id: Option<String>,
    ) -> Result<PreparedTurn, StreamError> {
        // Explicit parent wins; otherwise continue the rightmost branch.
        // Resolved once here, never re-derived mid-stream.
        let parent = match parent_message_id {
            Some(parent) => Some(parent),
            None => self.reader.resolve_rightmost_leaf(session_id).await?,
        };

        self.preface.ensure(session_id).await?;

        let mut save = SaveMessage::new(session_id, user_message);
        save.parent_message_id = parent;
        save.workspace_id = workspace_id;
        save.project_id = project_id;
        let outcome = self.store.save_message(save).await?;
        let user_node_id = outcome.id().to_string();

        let loader = ChainLoader::new(self.reader.clone());
        let mut options = ChainOptions::from_leaf(user_node_id.clone());
        options.max_messages = max_messages;
        let chain = loader.load(session_id, &options).await?;
        let (messages, dropped) = project_for_model(&chain, self.resolver.as_ref()).await;
        for drop in &dropped {
            tracing::warn!(
                message_id = %drop.message_id,
                reason = %drop.reason,
                "part dropped from model context"
            );
        }

        Ok(PreparedTurn {
            assistant_parent: user_node_id,
            input: AgentTurnInput {
                session_id: session_id.to_string(),
                messages,
                frame: frame.clone(),
            },
        })
    }

    /// Error path: log once, stick the error on the session, record it
    /// in the tree, and return the closing wire events (which end with a
    /// well-formed error finish).
    #[allow(clippy::too_many_arguments)]
    async fn fail_turn(
        &self,
        session_id: &str,
        assistant_id: &str,
        parent_id: &str,
        frame: &AgentFrame,
        started: Instant,
        encoder: &mut TurnEncoder,
        err: &StreamError,
    ) -> Vec<UIStreamEvent> {
        tracing::error!(session_id, message_id = assistant_id, error = %err, "turn failed");
        let text = err.to_string();

        if let Err(e) = self.store.set_session_error(session_id, Some(&text)).await {
            tracing::warn!(error = %e, "failed to record session error");
        }

        // Attach the error to the in-flight node when it already exists,
        // otherwise record a fresh node so the failure stays visible on
        // reload.
        let appended = self
            .store
            .append_message_part(session_id, assistant_id, MessagePart::error_text(text.clone()))
            .await
            .unwrap_or(false);
        if !appended {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let message = ChatMessage {
                id: assistant_id.to_string(),
                role: Role::Assistant,
                parts: vec![MessagePart::error_text(text.clone())],
                metadata: Some(build_metadata(frame, None, elapsed_ms)),
            };
            let save =
                SaveMessage::new(session_id, message).with_parent(parent_id.to_string());
            if let Err(e) = self.store.save_message(save).await {
                tracing::error!(error = %e, "failed to persist error turn");
            }
        }

        let mut events = encoder.close();
        events.push(UIStreamEvent::error(text.clone()));
        events.push(UIStreamEvent::finish(FinishReason::Error));
        events
    }
}

/// Accumulates the persisted parts of an in-flight assistant node.
#[derive(Default)]
struct PartCollector {
    parts: Vec<MessagePart>,
    text_index: HashMap<String, usize>,
}

impl PartCollector {
    fn collect(&mut self, event: &AgentEvent) {
        match event {
            AgentEvent::TextStart { id } => {
                self.text_slot(id);
            }
            AgentEvent::TextDelta { id, text } => {
                let slot = self.text_slot(id);
                if let Some(MessagePart::Text { text: buffer }) = self.parts.get_mut(slot) {
                    buffer.push_str(text);
                }
            }
            AgentEvent::ToolCall { id, name, arguments } => {
                self.parts.push(MessagePart::ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                });
            }
            AgentEvent::ToolResult { id, output } => {
                self.parts.push(MessagePart::ToolResult {
                    id: id.clone(),
                    output: output.clone(),
                });
            }
            _ => {}
        }
    }

    fn text_slot(&mut self, id: &str) -> usize {
        if let Some(&slot) = self.text_index.get(id) {
            return slot;
        }
        self.parts.push(MessagePart::text(""));
        let slot = self.parts.len() - 1;
        self.text_index.insert(id.to_string(), slot);
        slot
    }

    fn into_parts(self) -> Vec<MessagePart> {
        self.parts
    }
}

fn build_metadata(frame: &AgentFrame, usage: Option<Usage>, elapsed_ms: u64) -> MessageMetadata {
    let mut metadata = MessageMetadata {
        usage: usage.filter(|u| !u.is_empty()),
        timing: Some(Timing {
            elapsed_ms: Some(elapsed_ms),
            extra: Default::default(),
        }),
        extra: Default::default(),
    };
    for (key, value) in frame.metadata_extras() {
        metadata.extra.insert(key, value);
    }
    metadata
}
