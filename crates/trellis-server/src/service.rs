//! Shared request state and API error mapping.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use trellis_chain::ChainError;
use trellis_stream::{ImageGenerator, StreamError, TurnOrchestrator};
use trellis_tree_store::{TreeStore, TreeStoreError};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: TurnOrchestrator,
    pub store: Arc<dyn TreeStore>,
    pub images: Arc<dyn ImageGenerator>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

impl From<TreeStoreError> for ApiError {
    fn from(e: TreeStoreError) -> Self {
        match e {
            TreeStoreError::InvalidArgument(msg) => ApiError::BadRequest(msg),
            TreeStoreError::Conflict(msg) => ApiError::Conflict(msg),
            TreeStoreError::NotFound(msg) => ApiError::NotFound(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<StreamError> for ApiError {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::Upstream(msg) => ApiError::Upstream(msg),
            StreamError::Store(inner) => inner.into(),
            StreamError::Chain(ChainError::ChainNotFound(msg)) => ApiError::NotFound(msg),
            StreamError::Chain(other) => ApiError::Internal(other.to_string()),
            StreamError::Cancelled => ApiError::BadRequest("request cancelled".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_request_level_statuses() {
        let e: ApiError = TreeStoreError::InvalidArgument("x".to_string()).into();
        assert_eq!(e.status(), StatusCode::BAD_REQUEST);
        let e: ApiError = TreeStoreError::Conflict("x".to_string()).into();
        assert_eq!(e.status(), StatusCode::CONFLICT);
        let e: ApiError = TreeStoreError::NotFound("x".to_string()).into();
        assert_eq!(e.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn upstream_failures_are_bad_gateway() {
        let e: ApiError = StreamError::Upstream("model".to_string()).into();
        assert_eq!(e.status(), StatusCode::BAD_GATEWAY);
    }
}
