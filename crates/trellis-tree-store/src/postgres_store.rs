//! PostgreSQL tree store.
//!
//! Same schema and save algorithm as the SQLite adapter. Sibling-index
//! assignment takes a `FOR UPDATE` lock on the parent row so concurrent
//! children of one parent serialize on the database instead of racing
//! into the unique `(session_id, path)` index.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use trellis_chat::{merge_metadata, ChatMessage, MessageMetadata, MessagePart, Role, Session};

use crate::contract::{
    prepare_save, MessageRef, NormalizedSave, PreparedSave, SaveMessage, SaveOutcome,
    StoredMessage, TreeReader, TreeStoreError, TreeWriter,
};
use crate::path::{child_path, sibling_index};

/// Postgres-backed tree store.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database at `url` and create the tables.
    pub async fn connect(url: &str) -> Result<Self, TreeStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(url)
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
                created_at    TIMESTAMPTZ NOT NULL,
                updated_at    TIMESTAMPTZ NOT NULL
            );
            CREATE TABLE IF NOT EXISTS chat_messages (
                id                TEXT PRIMARY KEY,
                session_id        TEXT NOT NULL REFERENCES chat_sessions(id) ON DELETE CASCADE,
                parent_message_id TEXT,
                path              TEXT NOT NULL,
                role              TEXT NOT NULL,
                parts             JSONB NOT NULL,
                metadata          JSONB,
                created_at        TIMESTAMPTZ NOT NULL
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

type MessageRow = (
    String,                // id
    String,                // session_id
    Option<String>,        // parent_message_id
    String,                // path
    String,                // role
    serde_json::Value,     // parts
    Option<serde_json::Value>, // metadata
    DateTime<Utc>,         // created_at
);

fn row_to_stored(row: MessageRow) -> Result<StoredMessage, TreeStoreError> {
    let (id, session_id, parent_message_id, path, role, parts, metadata, created_at) = row;
    let parts: Vec<MessagePart> =
        serde_json::from_value(parts).map_err(|e| TreeStoreError::Serialization(e.to_string()))?;
    let metadata: Option<MessageMetadata> = metadata
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| TreeStoreError::Serialization(e.to_string()))?;
    Ok(StoredMessage {
        session_id,
        parent_message_id,
        path,
        created_at,
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

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[async_trait]
impl TreeReader for PostgresStore {
    async fn load_session(&self, session_id: &str) -> Result<Option<Session>, TreeStoreError> {
        let row: Option<(
            String,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            DateTime<Utc>,
            DateTime<Utc>,
        )> = sqlx::query_as(
            "SELECT id, title, workspace_id, project_id, error_message, created_at, updated_at \
             FROM chat_sessions WHERE id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::sql_err)?;

        Ok(row.map(
            |(id, title, workspace_id, project_id, error_message, created_at, updated_at)| {
                Session {
                    id,
                    title,
                    workspace_id,
                    project_id,
                    error_message,
                    created_at,
                    updated_at,
                }
            },
        ))
    }

    async fn get_message(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Option<StoredMessage>, TreeStoreError> {
        let row: Option<MessageRow> =
            sqlx::query_as(&format!("{SELECT_MESSAGE_COLUMNS} WHERE session_id = $1 AND id = $2"))
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
            "SELECT id FROM chat_messages WHERE session_id = $1 \
             ORDER BY path DESC, id DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::sql_err)?;
        Ok(row.map(|(id,)| id))
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>, TreeStoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "{SELECT_MESSAGE_COLUMNS} WHERE session_id = $1 ORDER BY path ASC, id ASC"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::sql_err)?;
        rows.into_iter().map(row_to_stored).collect()
    }
}

#[async_trait]
impl TreeWriter for PostgresStore {
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

        let existing: Option<(String, String, Option<String>, Option<serde_json::Value>)> =
            sqlx::query_as(
                "SELECT session_id, path, parent_message_id, metadata \
                 FROM chat_messages WHERE id = $1 FOR UPDATE",
            )
            .bind(&save.message.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Self::sql_err)?;

        if let Some((owner_session, path, parent_message_id, metadata_raw)) = existing {
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
                tx.commit().await.map_err(Self::sql_err)?;
                return Ok(SaveOutcome::Unchanged(reference));
            }

            let prev_metadata: Option<MessageMetadata> = metadata_raw
                .map(serde_json::from_value)
                .transpose()
                .map_err(Self::ser_err)?;
            let merged = merge_metadata(prev_metadata.as_ref(), save.message.metadata.as_ref());
            let merged_json = merged
                .map(serde_json::to_value)
                .transpose()
                .map_err(Self::ser_err)?;

            if save.message.parts.is_empty() {
                sqlx::query("UPDATE chat_messages SET metadata = $1 WHERE id = $2")
                    .bind(&merged_json)
                    .bind(&save.message.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(Self::sql_err)?;
            } else {
                let parts_json = serde_json::to_value(&save.message.parts).map_err(Self::ser_err)?;
                sqlx::query("UPDATE chat_messages SET parts = $1, metadata = $2 WHERE id = $3")
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
                    "SELECT path FROM chat_messages \
                     WHERE session_id = $1 AND id = $2 FOR UPDATE",
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

        let max_path: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT MAX(path) FROM chat_messages \
             WHERE session_id = $1 AND parent_message_id IS NOT DISTINCT FROM $2",
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

        let parts_json = serde_json::to_value(&save.message.parts).map_err(Self::ser_err)?;
        let metadata_json = save
            .message
            .metadata
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(Self::ser_err)?;

        sqlx::query(
            "INSERT INTO chat_messages \
             (id, session_id, parent_message_id, path, role, parts, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&save.message.id)
        .bind(&save.session_id)
        .bind(&save.parent_message_id)
        .bind(&path)
        .bind(role_to_str(save.message.role))
        .bind(&parts_json)
        .bind(&metadata_json)
        .bind(save.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
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
        let part_json = serde_json::to_value(&part).map_err(Self::ser_err)?;
        let result = sqlx::query(
            "UPDATE chat_messages SET parts = parts || jsonb_build_array($1::jsonb) \
             WHERE session_id = $2 AND id = $3",
        )
        .bind(&part_json)
        .bind(session_id)
        .bind(message_id)
        .execute(&self.pool)
        .await
        .map_err(Self::sql_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_session_error(
        &self,
        session_id: &str,
        error: Option<&str>,
    ) -> Result<(), TreeStoreError> {
        sqlx::query(
            "UPDATE chat_sessions SET error_message = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(error)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(Self::sql_err)?;
        Ok(())
    }
}

async fn upsert_session(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    save: &NormalizedSave,
) -> Result<(), TreeStoreError> {
    sqlx::query(
        "INSERT INTO chat_sessions \
         (id, title, workspace_id, project_id, error_message, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, NULL, NOW(), NOW()) \
         ON CONFLICT (id) DO UPDATE SET \
         title = COALESCE(chat_sessions.title, EXCLUDED.title), \
         workspace_id = COALESCE(EXCLUDED.workspace_id, chat_sessions.workspace_id), \
         project_id = COALESCE(EXCLUDED.project_id, chat_sessions.project_id), \
         updated_at = NOW()",
    )
    .bind(&save.session_id)
    .bind(&save.derived_title)
    .bind(&save.workspace_id)
    .bind(&save.project_id)
    .execute(&mut **tx)
    .await
    .map_err(PostgresStore::sql_err)?;
    Ok(())
}
