//! In-memory tree store for tests and local development.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use trellis_chat::{merge_metadata, MessagePart, Session};

use crate::contract::{
    prepare_save, MessageRef, NormalizedSave, PreparedSave, SaveMessage, SaveOutcome,
    StoredMessage, TreeReader, TreeStoreError, TreeWriter,
};
use crate::path::{child_path, sibling_index};

struct SessionEntry {
    session: Session,
    /// Nodes by message id.
    messages: HashMap<String, StoredMessage>,
}

/// In-memory store. The single write lock per call provides the same
/// serialization the SQL adapters get from their transactions.
#[derive(Default)]
pub struct MemoryStore {
    entries: tokio::sync::RwLock<HashMap<String, SessionEntry>>,
}

impl MemoryStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TreeReader for MemoryStore {
    async fn load_session(&self, session_id: &str) -> Result<Option<Session>, TreeStoreError> {
        let entries = self.entries.read().await;
        Ok(entries.get(session_id).map(|e| e.session.clone()))
    }

    async fn get_message(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Option<StoredMessage>, TreeStoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(session_id)
            .and_then(|e| e.messages.get(message_id))
            .cloned())
    }

    async fn resolve_rightmost_leaf(
        &self,
        session_id: &str,
    ) -> Result<Option<String>, TreeStoreError> {
        let entries = self.entries.read().await;
        let Some(entry) = entries.get(session_id) else {
            return Ok(None);
        };
        Ok(entry
            .messages
            .values()
            .max_by(|a, b| {
                a.path
                    .cmp(&b.path)
                    .then_with(|| a.message.id.cmp(&b.message.id))
            })
            .map(|m| m.message.id.clone()))
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>, TreeStoreError> {
        let entries = self.entries.read().await;
        let Some(entry) = entries.get(session_id) else {
            return Ok(Vec::new());
        };
        let mut messages: Vec<StoredMessage> = entry.messages.values().cloned().collect();
        messages.sort_by(|a, b| {
            a.path
                .cmp(&b.path)
                .then_with(|| a.message.id.cmp(&b.message.id))
        });
        Ok(messages)
    }
}

#[async_trait]
impl TreeWriter for MemoryStore {
    async fn save_message(&self, input: SaveMessage) -> Result<SaveOutcome, TreeStoreError> {
        let save = match prepare_save(input)? {
            PreparedSave::Skip {
                id,
                parent_message_id,
            } => {
                return Ok(SaveOutcome::Skipped {
                    id,
                    parent_message_id,
                })
            }
            PreparedSave::Write(save) => save,
        };

        let mut entries = self.entries.write().await;

        // Reject ids already claimed by another session before touching
        // the target session.
        for (sid, entry) in entries.iter() {
            if sid != &save.session_id && entry.messages.contains_key(&save.message.id) {
                return Err(TreeStoreError::Conflict(format!(
                    "message {} already exists in session {sid}",
                    save.message.id
                )));
            }
        }

        let entry = entries
            .entry(save.session_id.clone())
            .or_insert_with(|| SessionEntry {
                session: Session::new(save.session_id.clone()),
                messages: HashMap::new(),
            });
        upsert_session(&mut entry.session, &save);

        if let Some(existing) = entry.messages.get_mut(&save.message.id) {
            let reference = MessageRef {
                id: existing.message.id.clone(),
                parent_message_id: existing.parent_message_id.clone(),
                path: existing.path.clone(),
            };
            if !save.message.role.is_mergeable() {
                return Ok(SaveOutcome::Unchanged(reference));
            }
            if !save.message.parts.is_empty() {
                existing.message.parts = save.message.parts;
            }
            existing.message.metadata = merge_metadata(
                existing.message.metadata.as_ref(),
                save.message.metadata.as_ref(),
            );
            return Ok(SaveOutcome::Merged(reference));
        }

        let parent_path = match &save.parent_message_id {
            Some(pid) => Some(
                entry
                    .messages
                    .get(pid)
                    .ok_or_else(|| {
                        TreeStoreError::NotFound(format!("parent message {pid} not found"))
                    })?
                    .path
                    .clone(),
            ),
            None => None,
        };

        let next_index = 1 + entry
            .messages
            .values()
            .filter(|m| m.parent_message_id == save.parent_message_id)
            .filter_map(|m| sibling_index(&m.path))
            .max()
            .unwrap_or(0);
        let path = child_path(parent_path.as_deref(), next_index)?;

        let reference = MessageRef {
            id: save.message.id.clone(),
            parent_message_id: save.parent_message_id.clone(),
            path: path.clone(),
        };
        entry.messages.insert(
            save.message.id.clone(),
            StoredMessage {
                session_id: save.session_id,
                parent_message_id: save.parent_message_id,
                path,
                created_at: save.created_at,
                message: save.message,
            },
        );
        Ok(SaveOutcome::Created(reference))
    }

    async fn append_message_part(
        &self,
        session_id: &str,
        message_id: &str,
        part: MessagePart,
    ) -> Result<bool, TreeStoreError> {
        let mut entries = self.entries.write().await;
        let Some(node) = entries
            .get_mut(session_id)
            .and_then(|e| e.messages.get_mut(message_id))
        else {
            return Ok(false);
        };
        node.message.parts.push(part);
        Ok(true)
    }

    async fn set_session_error(
        &self,
        session_id: &str,
        error: Option<&str>,
    ) -> Result<(), TreeStoreError> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(session_id) {
            entry.session.error_message = error.map(str::to_string);
            entry.session.updated_at = Utc::now();
        }
        Ok(())
    }
}

/// Apply the session-row rules shared by every adapter: title only if
/// none exists, binding fields only when non-empty.
fn upsert_session(session: &mut Session, save: &NormalizedSave) {
    if session.title.is_none() {
        session.title = save.derived_title.clone();
    }
    if let Some(ws) = &save.workspace_id {
        session.workspace_id = Some(ws.clone());
    }
    if let Some(proj) = &save.project_id {
        session.project_id = Some(proj.clone());
    }
    session.updated_at = Utc::now();
}
