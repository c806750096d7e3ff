//! Store contract: inputs, outcomes, errors and the reader/writer traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use trellis_chat::{
    derive_title, ChatMessage, MessagePart, MessageMetadata, Role, Session,
};

/// Storage errors.
#[derive(Debug, Error)]
pub enum TreeStoreError {
    /// Malformed caller input (missing id, bad parent reference shape).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Id reused across sessions, or sibling capacity exhausted.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Parent or node absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// IO / database error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A message together with its tree position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    pub path: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub message: ChatMessage,
}

/// Identity of a persisted (or replayed) node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    pub path: String,
}

/// Result of a `save_message` call.
///
/// An explicit variant type rather than exceptions-for-control-flow:
/// callers can tell a fresh insert from a continuation merge from a
/// deliberate no-op without inspecting return-value shape.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// A new node was inserted.
    Created(MessageRef),
    /// An existing non-user node was merge-updated in place.
    Merged(MessageRef),
    /// An existing user node was replayed; nothing changed.
    Unchanged(MessageRef),
    /// Empty non-user content with `allow_empty = false`; nothing was
    /// persisted. The caller-supplied identity is returned untouched.
    Skipped {
        id: String,
        parent_message_id: Option<String>,
    },
}

impl SaveOutcome {
    /// The node id this outcome refers to.
    pub fn id(&self) -> &str {
        match self {
            SaveOutcome::Created(r) | SaveOutcome::Merged(r) | SaveOutcome::Unchanged(r) => &r.id,
            SaveOutcome::Skipped { id, .. } => id,
        }
    }

    /// The materialized path, when a node exists.
    pub fn path(&self) -> Option<&str> {
        match self {
            SaveOutcome::Created(r) | SaveOutcome::Merged(r) | SaveOutcome::Unchanged(r) => {
                Some(&r.path)
            }
            SaveOutcome::Skipped { .. } => None,
        }
    }

    /// Returns `true` when a node exists in the tree after this call.
    pub fn is_persisted(&self) -> bool {
        !matches!(self, SaveOutcome::Skipped { .. })
    }
}

/// Input to `save_message`.
#[derive(Debug, Clone)]
pub struct SaveMessage {
    pub session_id: String,
    pub message: ChatMessage,
    /// Parent node id; `None` creates a root.
    pub parent_message_id: Option<String>,
    /// Persist an empty non-user node anyway (aborted turns need a
    /// visible placeholder).
    pub allow_empty: bool,
    /// Override the node timestamp; defaults to now.
    pub created_at: Option<DateTime<Utc>>,
    /// Session workspace binding; only non-empty values are applied.
    pub workspace_id: Option<String>,
    /// Session project binding; only non-empty values are applied.
    pub project_id: Option<String>,
}

impl SaveMessage {
    /// Build a save for the given session and message.
    pub fn new(session_id: impl Into<String>, message: ChatMessage) -> Self {
        Self {
            session_id: session_id.into(),
            message,
            parent_message_id: None,
            allow_empty: false,
            created_at: None,
            workspace_id: None,
            project_id: None,
        }
    }

    /// Set the parent node.
    #[must_use]
    pub fn with_parent(mut self, parent_message_id: impl Into<String>) -> Self {
        self.parent_message_id = Some(parent_message_id.into());
        self
    }

    /// Allow persisting an empty non-user node.
    #[must_use]
    pub fn allow_empty(mut self) -> Self {
        self.allow_empty = true;
        self
    }

    /// Bind the session to a workspace.
    #[must_use]
    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }
}

/// A save that passed validation and normalization.
///
/// Shared front half of the save algorithm so every adapter applies the
/// same filtering rules before touching its backend.
#[derive(Debug)]
pub(crate) enum PreparedSave {
    /// Nothing to persist: empty non-user content without `allow_empty`.
    Skip {
        id: String,
        parent_message_id: Option<String>,
    },
    /// Normalized message ready for the transactional half.
    Write(NormalizedSave),
}

#[derive(Debug)]
pub(crate) struct NormalizedSave {
    pub session_id: String,
    pub message: ChatMessage,
    pub parent_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub derived_title: Option<String>,
    pub workspace_id: Option<String>,
    pub project_id: Option<String>,
}

/// Validate and normalize a save input: non-empty id, transient parts
/// dropped, metadata sanitized, empty non-user turns skipped.
pub(crate) fn prepare_save(input: SaveMessage) -> Result<PreparedSave, TreeStoreError> {
    if input.message.id.trim().is_empty() {
        return Err(TreeStoreError::InvalidArgument(
            "message id must not be empty".to_string(),
        ));
    }
    if input.session_id.trim().is_empty() {
        return Err(TreeStoreError::InvalidArgument(
            "session id must not be empty".to_string(),
        ));
    }

    let mut message = input.message;
    message.parts.retain(|p: &MessagePart| !p.is_transient());
    message.metadata = message
        .metadata
        .take()
        .map(MessageMetadata::sanitized)
        .filter(|m| !m.is_empty());

    if message.role.is_mergeable() && message.is_content_empty() && !input.allow_empty {
        return Ok(PreparedSave::Skip {
            id: message.id,
            parent_message_id: input.parent_message_id,
        });
    }

    // Only user turns title the session.
    let derived_title = if message.role == Role::User {
        derive_title(&message)
    } else {
        None
    };
    Ok(PreparedSave::Write(NormalizedSave {
        session_id: input.session_id,
        message,
        parent_message_id: input.parent_message_id,
        created_at: input.created_at.unwrap_or_else(Utc::now),
        derived_title,
        workspace_id: input.workspace_id.filter(|s| !s.trim().is_empty()),
        project_id: input.project_id.filter(|s| !s.trim().is_empty()),
    }))
}

/// Read operations on the message tree.
#[async_trait]
pub trait TreeReader: Send + Sync {
    /// Load a session row.
    async fn load_session(&self, session_id: &str) -> Result<Option<Session>, TreeStoreError>;

    /// Load one node with its tree position.
    async fn get_message(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Option<StoredMessage>, TreeStoreError>;

    /// Id of the node with the lexicographically greatest path (ties
    /// broken by id) — the most recently extended branch. `None` for an
    /// empty or unknown session.
    async fn resolve_rightmost_leaf(
        &self,
        session_id: &str,
    ) -> Result<Option<String>, TreeStoreError>;

    /// All nodes of a session ordered by path, then id.
    async fn list_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>, TreeStoreError>;
}

/// Write operations on the message tree.
#[async_trait]
pub trait TreeWriter: TreeReader {
    /// Idempotent, merging node write. See crate docs for the full
    /// algorithm; all validation/normalization happens up front and the
    /// rest runs in one transaction.
    async fn save_message(&self, input: SaveMessage) -> Result<SaveOutcome, TreeStoreError>;

    /// Best-effort single-part append to an existing node, used for
    /// incremental error-text delivery. Returns `false` (no-op) when the
    /// node is missing or belongs to another session; never creates a
    /// node.
    async fn append_message_part(
        &self,
        session_id: &str,
        message_id: &str,
        part: MessagePart,
    ) -> Result<bool, TreeStoreError>;

    /// Set or clear the session's sticky error message. A no-op when the
    /// session row does not exist.
    async fn set_session_error(
        &self,
        session_id: &str,
        error: Option<&str>,
    ) -> Result<(), TreeStoreError>;
}

/// Full tree store capability (read + write).
pub trait TreeStore: TreeWriter {}

impl<T: TreeWriter + ?Sized> TreeStore for T {}
