//! SQLite tree store.
//!
//! Sessions live in `chat_sessions`, nodes in `chat_messages` with their
//! materialized path. The unique `(session_id, path)` index plus the
//! per-call transaction make sibling-index assignment atomic: two
//! concurrent children of one parent can never commit the same path.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use trellis_chat::{merge_metadata, ChatMessage, MessageMetadata, MessagePart, Role, Session};

use crate::contract::{
    prepare_save, MessageRef, NormalizedSave, PreparedSave, SaveMessage, SaveOutcome,
    StoredMessage, TreeReader, TreeStoreError, TreeWriter,
};
use crate::path::{child_path, sibling_index};

/// SQLite-backed tree store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a store over an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `url`.
    ///
    /// The pool is capped at one connection: SQLite serializes writers
    /// anyway, and a single connection avoids `SQLITE_BUSY` churn under
    /// concurrent turns.
    pub async fn connect(url: &str) -> Result<Self, TreeStoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(Self::sql_err)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(Self::sql_err)?;
        let store = Self::new(pool);
        store.ensure_tables().await?;
        Ok(store)
    }

    /// Create the storage tables (idempotent).
    pub async fn ensure_tables(&self) -> Result<(), TreeStoreError> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS chat_sessions (
                id            TEXT PRIMARY KEY,
                title         TEXT,
                workspace_id  TEXT,
                project_id    TEXT,
                error_message TEXT,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS chat_messages (
                id                TEXT PRIMARY KEY,
                session_id        TEXT NOT NULL REFERENCES chat_sessions(id) ON DELETE CASCADE,
                parent_message_id TEXT,
                path              TEXT NOT NULL,
                role              TEXT NOT NULL,
                parts             TEXT NOT NULL,
                metadata          TEXT,
                created_at        TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_chat_messages_session_path
                ON chat_messages (session_id, path);
            CREATE INDEX IF NOT EXISTS idx_chat_messages_session_parent
                ON chat_messages (session_id, parent_message_id);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(Self::sql_err)?;
        Ok(())
    }

    fn sql_err(e: sqlx::Error) -> TreeStoreError {
        TreeStoreError::Io(std::io::Error::other(e.to_string()))
    }

    fn ser_err(e: serde_json::Error) -> TreeStoreError {
        TreeStoreError::Serialization(e.to_string())
    }
}

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, TreeStoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TreeStoreError::Serialization(format!("bad timestamp {raw:?}: {e}")))
}

type MessageRow = (
    String,         // id
    String,         // session_id
    Option<String>, // parent_message_id
    String,         // path
    String,         // role
    String,         // parts (JSON)
    Option<String>, // metadata (JSON)
    String,         // created_at
);

fn row_to_stored(row: MessageRow) -> Result<StoredMessage, TreeStoreError> {
    let (id, session_id, parent_message_id, path, role, parts, metadata, created_at) = row;
    let parts: Vec<MessagePart> =
        serde_json::from_str(&parts).map_err(|e| TreeStoreError::Serialization(e.to_string()))?;
    let metadata: Option<MessageMetadata> = metadata
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| TreeStoreError::Serialization(e.to_string()))?;
    Ok(StoredMessage {
        session_id,
        parent_message_id,
        path,
        created_at: parse_timestamp(&created_at)?,
        message: ChatMessage {
            id,
            role: Role::normalize(&role),
            parts,
            metadata,
        },
    })
}

const SELECT_MESSAGE_COLUMNS: &str =
    "SELECT id, session_id, parent_message_id, path, role, parts, metadata, created_at \
     FROM chat_messages";

#[async_trait]
impl TreeReader for SqliteStore {
    async fn load_session(&self, session_id: &str) -> Result<Option<Session>, TreeStoreError> {
        let row: Option<(
            String,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            String,
            String,
        )> = sqlx::query_as(
            "SELECT id, title, workspace_id, project_id, error_message, created_at, updated_at \
             FROM chat_sessions WHERE id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::sql_err)?;

        let Some((id, title, workspace_id, project_id, error_message, created_at, updated_at)) =
            row
        else {
            return Ok(None);
        };
        Ok(Some(Session {
            id,
            title,
            workspace_id,
            project_id,
            error_message,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        }))
    }

    async fn get_message(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Option<StoredMessage>, TreeStoreError> {
        let row: Option<MessageRow> =
            sqlx::query_as(&format!("{SELECT_MESSAGE_COLUMNS} WHERE session_id = ? AND id = ?"))
                .bind(session_id)
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Self::sql_err)?;
        row.map(row_to_stored).transpose()
    }

    async fn resolve_rightmost_leaf(
        &self,
        session_id: &str,
    ) -> Result<Option<String>, TreeStoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM chat_messages WHERE session_id = ? ORDER BY path DESC, id DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::sql_err)?;
        Ok(row.map(|(id,)| id))
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>, TreeStoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "{SELECT_MESSAGE_COLUMNS} WHERE session_id = ? ORDER BY path ASC, id ASC"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::sql_err)?;
        rows.into_iter().map(row_to_stored).collect()
    }
}

#[async_trait]
impl TreeWriter for SqliteStore {
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

        let mut tx = self.pool.begin().await.map_err(Self::sql_err)?;

        upsert_session(&mut tx, &save).await?;

        // Message ids are globally unique; look the id up across all
        // sessions so cross-session reuse is caught.
        let existing: Option<(String, String, Option<String>, Option<String>, Option<String>)> =
            sqlx::query_as(
                "SELECT session_id, path, parent_message_id, parts, metadata \
                 FROM chat_messages WHERE id = ?",
            )
            .bind(&save.message.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Self::sql_err)?;

        if let Some((owner_session, path, parent_message_id, _parts, metadata_raw)) = existing {
            if owner_session != save.session_id {
                return Err(TreeStoreError::Conflict(format!(
                    "message {} already exists in session {owner_session}",
                    save.message.id
                )));
            }
            let reference = MessageRef {
                id: save.message.id.clone(),
                parent_message_id,
                path,
            };
            if !save.message.role.is_mergeable() {
                // Idempotent user replay: nothing to update.
                tx.commit().await.map_err(Self::sql_err)?;
                return Ok(SaveOutcome::Unchanged(reference));
            }

            let prev_metadata: Option<MessageMetadata> = metadata_raw
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(Self::ser_err)?;
            let merged = merge_metadata(prev_metadata.as_ref(), save.message.metadata.as_ref());
            let merged_json = merged
                .map(|m| serde_json::to_string(&m))
                .transpose()
                .map_err(Self::ser_err)?;

            if save.message.parts.is_empty() {
                sqlx::query("UPDATE chat_messages SET metadata = ? WHERE id = ?")
                    .bind(&merged_json)
                    .bind(&save.message.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(Self::sql_err)?;
            } else {
                let parts_json =
                    serde_json::to_string(&save.message.parts).map_err(Self::ser_err)?;
                sqlx::query("UPDATE chat_messages SET parts = ?, metadata = ? WHERE id = ?")
                    .bind(&parts_json)
                    .bind(&merged_json)
                    .bind(&save.message.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(Self::sql_err)?;
            }
            tx.commit().await.map_err(Self::sql_err)?;
            return Ok(SaveOutcome::Merged(reference));
        }

        let parent_path = match &save.parent_message_id {
            Some(pid) => {
                let row: Option<(String,)> = sqlx::query_as(
                    "SELECT path FROM chat_messages WHERE session_id = ? AND id = ?",
                )
                .bind(&save.session_id)
                .bind(pid)
                .fetch_optional(&mut *tx)
                .await
                .map_err(Self::sql_err)?;
                let (path,) = row.ok_or_else(|| {
                    TreeStoreError::NotFound(format!("parent message {pid} not found"))
                })?;
                Some(path)
            }
            None => None,
        };

        // Fixed-width segments make MAX(path) the highest sibling index.
        let max_path: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT MAX(path) FROM chat_messages \
             WHERE session_id = ? AND parent_message_id IS ?",
        )
        .bind(&save.session_id)
        .bind(&save.parent_message_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Self::sql_err)?;
        let next_index = 1 + max_path
            .and_then(|(p,)| p)
            .as_deref()
            .and_then(sibling_index)
            .unwrap_or(0);
        let path = child_path(parent_path.as_deref(), next_index)?;

        let parts_json = serde_json::to_string(&save.message.parts).map_err(Self::ser_err)?;
        let metadata_json = save
            .message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(Self::ser_err)?;

        sqlx::query(
            "INSERT INTO chat_messages \
             (id, session_id, parent_message_id, path, role, parts, metadata, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&save.message.id)
        .bind(&save.session_id)
        .bind(&save.parent_message_id)
        .bind(&path)
        .bind(role_to_str(save.message.role))
        .bind(&parts_json)
        .bind(&metadata_json)
        .bind(save.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if e.to_string().contains("UNIQUE constraint") {
                TreeStoreError::Conflict(format!("path {path} already assigned"))
            } else {
                Self::sql_err(e)
            }
        })?;

        tx.commit().await.map_err(Self::sql_err)?;
        tracing::debug!(
            session_id = %save.session_id,
            message_id = %save.message.id,
            %path,
            "message node created"
        );
        Ok(SaveOutcome::Created(MessageRef {
            id: save.message.id,
            parent_message_id: save.parent_message_id,
            path,
        }))
    }

    async fn append_message_part(
        &self,
        session_id: &str,
        message_id: &str,
        part: MessagePart,
    ) -> Result<bool, TreeStoreError> {
        let mut tx = self.pool.begin().await.map_err(Self::sql_err)?;
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT parts FROM chat_messages WHERE session_id = ? AND id = ?",
        )
        .bind(session_id)
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Self::sql_err)?;

        let Some((parts_raw,)) = row else {
            return Ok(false);
        };
        let mut parts: Vec<MessagePart> =
            serde_json::from_str(&parts_raw).map_err(Self::ser_err)?;
        parts.push(part);
        let parts_json = serde_json::to_string(&parts).map_err(Self::ser_err)?;

        sqlx::query("UPDATE chat_messages SET parts = ? WHERE id = ?")
            .bind(&parts_json)
            .bind(message_id)
            .execute(&mut *tx)
            .await
            .map_err(Self::sql_err)?;
        tx.commit().await.map_err(Self::sql_err)?;
        Ok(true)
    }

    async fn set_session_error(
        &self,
        session_id: &str,
        error: Option<&str>,
    ) -> Result<(), TreeStoreError> {
        sqlx::query("UPDATE chat_sessions SET error_message = ?, updated_at = ? WHERE id = ?")
            .bind(error)
            .bind(Utc::now().to_rfc3339())
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(Self::sql_err)?;
        Ok(())
    }
}

async fn upsert_session(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    save: &NormalizedSave,
) -> Result<(), TreeStoreError> {
    let now = Utc::now().to_rfc3339();
    let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM chat_sessions WHERE id = ?")
        .bind(&save.session_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(SqliteStore::sql_err)?;

    if exists.is_some() {
        // Title only if none exists yet; binding fields only when the
        // caller supplied non-empty values.
        sqlx::query(
            "UPDATE chat_sessions SET \
             title = COALESCE(title, ?), \
             workspace_id = COALESCE(?, workspace_id), \
             project_id = COALESCE(?, project_id), \
             updated_at = ? \
             WHERE id = ?",
        )
        .bind(&save.derived_title)
        .bind(&save.workspace_id)
        .bind(&save.project_id)
        .bind(&now)
        .bind(&save.session_id)
        .execute(&mut **tx)
        .await
        .map_err(SqliteStore::sql_err)?;
    } else {
        sqlx::query(
            "INSERT INTO chat_sessions \
             (id, title, workspace_id, project_id, error_message, created_at, updated_at) \
             VALUES (?, ?, ?, ?, NULL, ?, ?)",
        )
        .bind(&save.session_id)
        .bind(&save.derived_title)
        .bind(&save.workspace_id)
        .bind(&save.project_id)
        .bind(&now)
        .bind(&now)
        .execute(&mut **tx)
        .await
        .map_err(SqliteStore::sql_err)?;
    }
    Ok(())
}
