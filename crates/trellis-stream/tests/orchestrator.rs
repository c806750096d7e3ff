//! End-to-end orchestrator behavior against the in-memory store.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use trellis_chat::{ChatMessage, MessagePart, Role, Usage};
use trellis_protocol_ai_sdk::UIStreamEvent;
use trellis_stream::{
    AgentEvent, AgentEventStream, AgentFrame, AgentRunner, AgentTurnInput, GeneratedFile,
    GeneratedImages, ImageGenerator, ImageTurnRequest, StreamError, TurnOrchestrator, TurnRequest,
};
use trellis_tree_store::{MemoryStore, SaveMessage, StoredMessage, TreeReader, TreeWriter};

#[derive(Clone)]
enum ScriptItem {
    Event(AgentEvent),
    Error(String),
}

/// Agent that replays a fixed script, optionally hanging afterwards so a
/// test can exercise cancellation.
struct ScriptedAgent {
    script: Vec<ScriptItem>,
    hang_after_script: bool,
}

impl ScriptedAgent {
    fn finishing(events: Vec<AgentEvent>) -> Self {
        Self {
            script: events.into_iter().map(ScriptItem::Event).collect(),
            hang_after_script: false,
        }
    }

    fn hanging(events: Vec<AgentEvent>) -> Self {
        Self {
            script: events.into_iter().map(ScriptItem::Event).collect(),
            hang_after_script: true,
        }
    }

    fn failing(events: Vec<AgentEvent>, error: &str) -> Self {
        let mut script: Vec<ScriptItem> = events.into_iter().map(ScriptItem::Event).collect();
        script.push(ScriptItem::Error(error.to_string()));
        Self {
            script,
            hang_after_script: false,
        }
    }
}

#[async_trait]
impl AgentRunner for ScriptedAgent {
    async fn run(
        &self,
        _input: AgentTurnInput,
        _cancel: CancellationToken,
    ) -> Result<AgentEventStream, StreamError> {
        let items = self.script.clone();
        let script = futures::stream::iter(items.into_iter().map(|item| match item {
            ScriptItem::Event(event) => Ok(event),
            ScriptItem::Error(text) => Err(StreamError::Upstream(text)),
        }));
        if self.hang_after_script {
            Ok(script.chain(futures::stream::pending()).boxed())
        } else {
            Ok(script.boxed())
        }
    }
}

fn frame() -> AgentFrame {
    AgentFrame {
        id: "agent-1".to_string(),
        name: "scout".to_string(),
        kind: "chat".to_string(),
        model: "m-1".to_string(),
    }
}

fn turn(session: &str) -> TurnRequest {
    TurnRequest {
        session_id: session.to_string(),
        user_message: ChatMessage::user("hello there"),
        parent_message_id: None,
        max_messages: None,
        frame: frame(),
        workspace_id: None,
        project_id: None,
    }
}

fn kind(event: &UIStreamEvent) -> String {
    serde_json::to_value(event).unwrap()["type"]
        .as_str()
        .unwrap()
        .to_string()
}

async fn seed_session(store: &MemoryStore, session: &str, error: Option<&str>) {
    store
        .save_message(SaveMessage::new(
            session,
            ChatMessage::user("seed").with_id("seed-root"),
        ))
        .await
        .unwrap();
    store.set_session_error(session, error).await.unwrap();
}

async fn assistant_node(store: &MemoryStore, session: &str) -> StoredMessage {
    store
        .list_messages(session)
        .await
        .unwrap()
        .into_iter()
        .find(|m| m.message.role == Role::Assistant)
        .expect("assistant node persisted")
}

fn text_events() -> Vec<AgentEvent> {
    vec![
        AgentEvent::StepStart,
        AgentEvent::TextStart {
            id: "t1".to_string(),
        },
        AgentEvent::TextDelta {
            id: "t1".to_string(),
            text: "Hel".to_string(),
        },
        AgentEvent::TextDelta {
            id: "t1".to_string(),
            text: "lo".to_string(),
        },
        AgentEvent::TextEnd {
            id: "t1".to_string(),
        },
    ]
}

#[tokio::test]
async fn normal_finish_persists_node_and_clears_sticky_error() {
    let store = Arc::new(MemoryStore::new());
    seed_session(&store, "s1", Some("old failure")).await;

    let mut events = text_events();
    events.push(AgentEvent::UsageReport(Usage {
        input_tokens: Some(10),
        output_tokens: Some(5),
        ..Usage::default()
    }));
    events.push(AgentEvent::Finish {
        finish_reason: trellis_protocol_ai_sdk::FinishReason::Stop,
        usage: Some(Usage {
            output_tokens: Some(7),
            total_tokens: Some(22),
            ..Usage::default()
        }),
    });
    let orchestrator =
        TurnOrchestrator::new(store.clone(), Arc::new(ScriptedAgent::finishing(events)));

    let wire: Vec<UIStreamEvent> = orchestrator
        .stream_turn(turn("s1"), CancellationToken::new())
        .collect()
        .await;

    assert_eq!(kind(&wire[0]), "start");
    assert_eq!(kind(wire.last().unwrap()), "finish");
    let finish = serde_json::to_value(wire.last().unwrap()).unwrap();
    assert_eq!(finish["finishReason"], "stop");
    // Usage summed across the flush and the final report.
    assert_eq!(finish["messageMetadata"]["usage"]["inputTokens"], json!(10));
    assert_eq!(finish["messageMetadata"]["usage"]["outputTokens"], json!(12));
    assert_eq!(finish["messageMetadata"]["usage"]["totalTokens"], json!(22));

    let node = assistant_node(&store, "s1").await;
    assert_eq!(node.message.text(), "Hello");
    let meta = node.message.metadata.clone().unwrap();
    assert_eq!(meta.usage.unwrap().output_tokens, Some(12));
    assert_eq!(meta.extra["agentName"], json!("scout"));
    assert!(meta.timing.unwrap().elapsed_ms.is_some());
    assert!(!meta.extra.contains_key("isAborted"));

    // The assistant hangs off the user node of this turn.
    let parent_id = node.parent_message_id.clone().unwrap();
    let parent = store.get_message("s1", &parent_id).await.unwrap().unwrap();
    assert_eq!(parent.message.role, Role::User);
    assert_eq!(parent.message.text(), "hello there");

    let session = store.load_session("s1").await.unwrap().unwrap();
    assert_eq!(session.error_message, None);
}

#[tokio::test]
async fn abort_persists_partial_node_and_keeps_sticky_error() {
    let store = Arc::new(MemoryStore::new());
    seed_session(&store, "s1", Some("old failure")).await;

    let script = vec![
        AgentEvent::TextStart {
            id: "t1".to_string(),
        },
        AgentEvent::TextDelta {
            id: "t1".to_string(),
            text: "par".to_string(),
        },
    ];
    let orchestrator =
        TurnOrchestrator::new(store.clone(), Arc::new(ScriptedAgent::hanging(script)));

    let cancel = CancellationToken::new();
    let mut stream = Box::pin(orchestrator.stream_turn(turn("s1"), cancel.clone()));
    let mut wire = Vec::new();
    // start, text-start, text-delta; then the agent hangs.
    for _ in 0..3 {
        wire.push(stream.next().await.unwrap());
    }
    cancel.cancel();
    while let Some(event) = stream.next().await {
        wire.push(event);
    }

    assert_eq!(kind(wire.last().unwrap()), "finish");
    // The dangling text block was closed before the finish.
    assert!(wire.iter().any(|e| kind(e) == "text-end"));

    let node = assistant_node(&store, "s1").await;
    assert_eq!(node.message.text(), "par");
    let meta = node.message.metadata.unwrap();
    assert_eq!(meta.extra["isAborted"], json!(true));
    assert!(meta.extra.contains_key("abortedAt"));

    let session = store.load_session("s1").await.unwrap().unwrap();
    assert_eq!(session.error_message.as_deref(), Some("old failure"));
}

#[tokio::test]
async fn abort_with_no_content_still_records_placeholder() {
    let store = Arc::new(MemoryStore::new());
    seed_session(&store, "s1", None).await;

    let orchestrator =
        TurnOrchestrator::new(store.clone(), Arc::new(ScriptedAgent::hanging(Vec::new())));

    let cancel = CancellationToken::new();
    let mut stream = Box::pin(orchestrator.stream_turn(turn("s1"), cancel.clone()));
    let start = stream.next().await.unwrap();
    assert_eq!(kind(&start), "start");
    cancel.cancel();
    let rest: Vec<UIStreamEvent> = stream.collect().await;
    assert_eq!(kind(rest.last().unwrap()), "finish");

    let node = assistant_node(&store, "s1").await;
    assert!(node.message.parts.is_empty());
    assert_eq!(
        node.message.metadata.unwrap().extra["isAborted"],
        json!(true)
    );
}

#[tokio::test]
async fn upstream_failure_ends_stream_well_formed_and_records_error() {
    let store = Arc::new(MemoryStore::new());
    seed_session(&store, "s1", None).await;

    let script = vec![
        AgentEvent::TextStart {
            id: "t1".to_string(),
        },
        AgentEvent::TextDelta {
            id: "t1".to_string(),
            text: "partial".to_string(),
        },
    ];
    let orchestrator = TurnOrchestrator::new(
        store.clone(),
        Arc::new(ScriptedAgent::failing(script, "model exploded")),
    );

    let wire: Vec<UIStreamEvent> = orchestrator
        .stream_turn(turn("s1"), CancellationToken::new())
        .collect()
        .await;

    let finish = serde_json::to_value(wire.last().unwrap()).unwrap();
    assert_eq!(finish["type"], "finish");
    assert_eq!(finish["finishReason"], "error");
    assert!(wire.iter().any(|e| kind(e) == "error"));

    let node = assistant_node(&store, "s1").await;
    assert!(node.message.parts.iter().any(|p| matches!(
        p,
        MessagePart::ErrorText { text } if text.contains("model exploded")
    )));

    let session = store.load_session("s1").await.unwrap().unwrap();
    assert!(session.error_message.unwrap().contains("model exploded"));
}

#[tokio::test]
async fn setup_failure_yields_complete_error_turn() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = TurnOrchestrator::new(
        store.clone(),
        Arc::new(ScriptedAgent::finishing(Vec::new())),
    );

    let mut request = turn("s1");
    request.parent_message_id = Some("ghost".to_string());
    let wire: Vec<UIStreamEvent> = orchestrator
        .stream_turn(request, CancellationToken::new())
        .collect()
        .await;

    let kinds: Vec<String> = wire.iter().map(kind).collect();
    assert_eq!(
        kinds,
        vec!["start", "text-start", "text-delta", "text-end", "finish"]
    );
    let finish = serde_json::to_value(wire.last().unwrap()).unwrap();
    assert_eq!(finish["finishReason"], "error");
    let delta = serde_json::to_value(&wire[2]).unwrap();
    assert!(delta["delta"].as_str().unwrap().contains("not found"));
}

struct FixedImages(GeneratedImages);

#[async_trait]
impl ImageGenerator for FixedImages {
    async fn generate(
        &self,
        _prompt: &str,
        _cancel: CancellationToken,
    ) -> Result<GeneratedImages, StreamError> {
        Ok(self.0.clone())
    }
}

struct BrokenImages;

#[async_trait]
impl ImageGenerator for BrokenImages {
    async fn generate(
        &self,
        _prompt: &str,
        _cancel: CancellationToken,
    ) -> Result<GeneratedImages, StreamError> {
        Err(StreamError::Upstream("quota exceeded".to_string()))
    }
}

fn image_request(session: &str) -> ImageTurnRequest {
    ImageTurnRequest {
        session_id: session.to_string(),
        user_message: ChatMessage::user("paint a trellis"),
        parent_message_id: None,
        frame: frame(),
        workspace_id: None,
        project_id: None,
    }
}

#[tokio::test]
async fn image_turn_persists_then_reports_events() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = TurnOrchestrator::new(
        store.clone(),
        Arc::new(ScriptedAgent::finishing(Vec::new())),
    );
    let generator = FixedImages(GeneratedImages {
        files: vec![GeneratedFile {
            url: "https://files/img-1.png".to_string(),
            media_type: "image/png".to_string(),
        }],
        revised_prompt: Some("a wooden garden trellis".to_string()),
        usage: None,
    });

    let result = orchestrator
        .image_turn(&generator, image_request("s1"), CancellationToken::new())
        .await
        .unwrap();

    let kinds: Vec<String> = result.events.iter().map(kind).collect();
    assert_eq!(kinds, vec!["start", "file", "data-revised-prompt", "finish"]);

    let node = assistant_node(&store, "s1").await;
    assert!(matches!(
        &node.message.parts[0],
        MessagePart::File { url, .. } if url == "https://files/img-1.png"
    ));
    assert_eq!(
        node.message.metadata.unwrap().extra["revisedPrompt"],
        json!("a wooden garden trellis")
    );
}

#[tokio::test]
async fn image_turn_failure_records_error_node() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = TurnOrchestrator::new(
        store.clone(),
        Arc::new(ScriptedAgent::finishing(Vec::new())),
    );

    let err = orchestrator
        .image_turn(&BrokenImages, image_request("s1"), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::Upstream(_)));

    let node = assistant_node(&store, "s1").await;
    assert!(matches!(
        &node.message.parts[0],
        MessagePart::ErrorText { text } if text.contains("quota exceeded")
    ));
    let session = store.load_session("s1").await.unwrap().unwrap();
    assert!(session.error_message.unwrap().contains("quota exceeded"));
}
