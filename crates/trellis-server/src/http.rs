//! HTTP routes.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use trellis_chat::{gen_message_id, ChatMessage, Session};
use trellis_protocol_ai_sdk::{
    error_turn_events, sse_frame, UIStreamEvent, DONE_FRAME, HEADER_STREAM_VERSION, STREAM_VERSION,
};
use trellis_stream::{AgentFrame, ImageTurnRequest, TurnRequest};
use trellis_tree_store::StoredMessage;

use crate::service::{ApiError, AppState};

/// Health endpoint path.
pub const HEALTH_PATH: &str = "/health";
/// Streaming chat turn endpoint path.
pub const CHAT_PATH: &str = "/v1/sessions/:id/chat";
/// Image turn endpoint path.
pub const IMAGES_PATH: &str = "/v1/sessions/:id/images";
/// Session history endpoint path.
pub const MESSAGES_PATH: &str = "/v1/sessions/:id/messages";

/// Build all routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .route(CHAT_PATH, post(chat))
        .route(IMAGES_PATH, post(images))
        .route(MESSAGES_PATH, get(session_messages))
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    routes().with_state(state)
}

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

/// Agent identity supplied by the caller; all fields optional.
#[derive(Debug, Default, Deserialize)]
pub struct AgentSpec {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl AgentSpec {
    fn into_frame(self) -> AgentFrame {
        AgentFrame {
            id: self.id.unwrap_or_else(|| "default".to_string()),
            name: self.name.unwrap_or_else(|| "assistant".to_string()),
            kind: self.kind.unwrap_or_else(|| "chat".to_string()),
            model: self.model.unwrap_or_else(|| "default".to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurnBody {
    pub message: ChatMessage,
    #[serde(default)]
    pub parent_message_id: Option<String>,
    #[serde(default)]
    pub max_messages: Option<usize>,
    #[serde(default)]
    pub agent: Option<AgentSpec>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageTurnBody {
    pub message: ChatMessage,
    #[serde(default)]
    pub parent_message_id: Option<String>,
    #[serde(default)]
    pub agent: Option<AgentSpec>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    /// Stream the turn as SSE instead of returning the JSON envelope.
    #[serde(default)]
    pub stream: bool,
}

async fn chat(
    State(st): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<ChatTurnBody>,
) -> Result<Response, ApiError> {
    if session_id.trim().is_empty() {
        return Err(ApiError::BadRequest("session id cannot be empty".to_string()));
    }
    if body.message.id.trim().is_empty() {
        return Err(ApiError::BadRequest("message id cannot be empty".to_string()));
    }

    let request = TurnRequest {
        session_id,
        user_message: body.message,
        parent_message_id: body.parent_message_id,
        max_messages: body.max_messages,
        frame: body.agent.unwrap_or_default().into_frame(),
        workspace_id: body.workspace_id,
        project_id: body.project_id,
    };
    let cancel = CancellationToken::new();
    let events = st.orchestrator.stream_turn(request, cancel.clone());
    Ok(turn_sse_response(events, cancel))
}

async fn images(
    State(st): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<ImageTurnBody>,
) -> Result<Response, ApiError> {
    if session_id.trim().is_empty() {
        return Err(ApiError::BadRequest("session id cannot be empty".to_string()));
    }

    let request = ImageTurnRequest {
        session_id: session_id.clone(),
        user_message: body.message,
        parent_message_id: body.parent_message_id,
        frame: body.agent.unwrap_or_default().into_frame(),
        workspace_id: body.workspace_id,
        project_id: body.project_id,
    };
    let result = st
        .orchestrator
        .image_turn(st.images.as_ref(), request, CancellationToken::new())
        .await;

    if body.stream {
        let events = match result {
            Ok(turn) => turn.events,
            Err(err) => {
                let api = ApiError::from(err);
                error_turn_events(gen_message_id(), gen_message_id(), &api.to_string())
            }
        };
        return Ok(fixed_sse_response(events));
    }

    match result {
        Ok(turn) => Ok(Json(serde_json::json!({
            "ok": true,
            "response": { "sessionId": session_id, "message": turn.message },
        }))
        .into_response()),
        Err(err) => {
            let api = ApiError::from(err);
            let status = api.status();
            Ok((
                status,
                Json(serde_json::json!({
                    "ok": false,
                    "status": status.as_u16(),
                    "error": api.to_string(),
                })),
            )
                .into_response())
        }
    }
}

/// Session history payload.
#[derive(Debug, Serialize)]
pub struct SessionHistory {
    pub session: Session,
    pub messages: Vec<StoredMessage>,
}

async fn session_messages(
    State(st): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionHistory>, ApiError> {
    let session = st
        .store
        .load_session(&session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("session {session_id} not found")))?;
    let messages = st.store.list_messages(&session_id).await?;
    Ok(Json(SessionHistory { session, messages }))
}

/// Pump a live turn into an SSE body.
///
/// The turn runs in its own task so a client disconnect cannot stop the
/// finalization work; the disconnect just cancels the token and the turn
/// drains to its abort path.
fn turn_sse_response<S>(events: S, cancel: CancellationToken) -> Response
where
    S: Stream<Item = UIStreamEvent> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Bytes>(64);
    tokio::spawn(async move {
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            let frame = match sse_frame(&event) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(error = %err, "failed to serialize stream event");
                    cancel.cancel();
                    continue;
                }
            };
            if tx.send(Bytes::from(frame)).await.is_err() {
                cancel.cancel();
            }
        }
        let _ = tx.send(Bytes::from(DONE_FRAME)).await;
    });

    let body = async_stream::stream! {
        while let Some(chunk) = rx.recv().await {
            yield Ok::<Bytes, Infallible>(chunk);
        }
    };
    ui_stream_response(body)
}

/// Replay an already-complete turn as an SSE body.
fn fixed_sse_response(events: Vec<UIStreamEvent>) -> Response {
    let body = async_stream::stream! {
        for event in events {
            match sse_frame(&event) {
                Ok(frame) => yield Ok::<Bytes, Infallible>(Bytes::from(frame)),
                Err(err) => warn!(error = %err, "failed to serialize stream event"),
            }
        }
        yield Ok::<Bytes, Infallible>(Bytes::from(DONE_FRAME));
    };
    ui_stream_response(body)
}

fn ui_stream_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        header::HeaderName::from_static(HEADER_STREAM_VERSION),
        HeaderValue::from_static(STREAM_VERSION),
    );
    (headers, Body::from_stream(stream)).into_response()
}
