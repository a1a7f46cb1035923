use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tokio::sync::Mutex;

use pulse_core::domain::conversation::{
    ConversationId, ConversationSession, SessionSummary, Turn, TurnRole,
};
use pulse_core::domain::employee::EmployeeId;
use pulse_core::errors::StoreError;
use pulse_core::ports::ConversationStore;

use super::{decode_err, parse_timestamp, RepositoryError};
use crate::DbPool;

const TURN_COLUMNS: &str =
    "role, content, tokens_used, data_sources, is_proactive, created_at";

/// Conversation sessions and their append-only turns.
///
/// Appends to one session are serialized through a per-session lock so `turn_index` and
/// `message_count` advance together; appends to different sessions proceed independently.
pub struct SqlConversationRepository {
    pool: DbPool,
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool, session_locks: Mutex::new(HashMap::new()) }
    }

    async fn session_lock(&self, id: &ConversationId) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks.entry(id.0.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    async fn open_session(
        &self,
        owner: EmployeeId,
        id: Option<&ConversationId>,
        title: &str,
    ) -> Result<ConversationId, RepositoryError> {
        if let Some(id) = id {
            let existing: Option<(i64, i64)> =
                sqlx::query_as("SELECT owner_id, archived FROM conversations WHERE id = ?")
                    .bind(&id.0)
                    .fetch_optional(&self.pool)
                    .await?;
            if existing == Some((owner.0, 0)) {
                return Ok(id.clone());
            }
        }

        let created = ConversationId::generate();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO conversations (id, owner_id, title, message_count, archived,
                                        created_at, last_active_at)
             VALUES (?, ?, ?, 0, 0, ?, ?)",
        )
        .bind(&created.0)
        .bind(owner.0)
        .bind(title)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(created)
    }

    /// Drops the session's lock entry once no other append holds or awaits it.
    async fn release_session_lock(&self, id: &ConversationId, lock: Arc<Mutex<()>>) {
        let mut locks = self.session_locks.lock().await;
        // one reference in the map, one here
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&id.0);
        }
    }

    async fn insert_turn(&self, id: &ConversationId, turn: Turn) -> Result<u32, RepositoryError> {
        let lock = self.session_lock(id).await;
        let appended = {
            let _guard = lock.lock().await;
            self.write_turn(id, turn).await
        };
        self.release_session_lock(id, lock).await;
        appended
    }

    async fn write_turn(&self, id: &ConversationId, turn: Turn) -> Result<u32, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let count: Option<i64> =
            sqlx::query_scalar("SELECT message_count FROM conversations WHERE id = ?")
                .bind(&id.0)
                .fetch_optional(&mut *tx)
                .await?;
        let count = count
            .ok_or_else(|| RepositoryError::NotFound(format!("conversation `{id}` not found")))?;
        let data_sources = serde_json::to_string(&turn.data_sources).map_err(decode_err)?;

        sqlx::query(
            "INSERT INTO conversation_turns (conversation_id, turn_index, role, content,
                                             tokens_used, data_sources, is_proactive, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id.0)
        .bind(count)
        .bind(turn.role.as_str())
        .bind(&turn.content)
        .bind(turn.tokens_used.map(i64::from))
        .bind(&data_sources)
        .bind(i64::from(turn.is_proactive))
        .bind(turn.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE conversations SET message_count = message_count + 1, last_active_at = ?
             WHERE id = ?",
        )
        .bind(turn.created_at.to_rfc3339())
        .bind(&id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        u32::try_from(count + 1).map_err(decode_err)
    }

    async fn recent_turns(
        &self,
        id: &ConversationId,
        limit: u32,
    ) -> Result<Vec<Turn>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {TURN_COLUMNS} FROM conversation_turns
             WHERE conversation_id = ?
             ORDER BY turn_index DESC
             LIMIT ?"
        ))
        .bind(&id.0)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut turns = rows.iter().map(row_to_turn).collect::<Result<Vec<_>, _>>()?;
        turns.reverse();
        Ok(turns)
    }

    async fn full_session(
        &self,
        owner: EmployeeId,
        id: &ConversationId,
    ) -> Result<Option<ConversationSession>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, owner_id, title, message_count, archived, created_at, last_active_at
             FROM conversations WHERE id = ? AND owner_id = ?",
        )
        .bind(&id.0)
        .bind(owner.0)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let turn_rows = sqlx::query(&format!(
            "SELECT {TURN_COLUMNS} FROM conversation_turns
             WHERE conversation_id = ? ORDER BY turn_index ASC"
        ))
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;
        let turns = turn_rows.iter().map(row_to_turn).collect::<Result<Vec<_>, _>>()?;

        let created_at: String = row.try_get("created_at").map_err(decode_err)?;
        let last_active_at: String = row.try_get("last_active_at").map_err(decode_err)?;
        let message_count: i64 = row.try_get("message_count").map_err(decode_err)?;
        let archived: i64 = row.try_get("archived").map_err(decode_err)?;

        Ok(Some(ConversationSession {
            id: ConversationId(row.try_get("id").map_err(decode_err)?),
            owner,
            title: row.try_get("title").map_err(decode_err)?,
            turns,
            message_count: u32::try_from(message_count).map_err(decode_err)?,
            created_at: parse_timestamp(&created_at)?,
            last_active_at: parse_timestamp(&last_active_at)?,
            archived: archived != 0,
        }))
    }

    async fn summaries(
        &self,
        owner: EmployeeId,
        limit: u32,
    ) -> Result<Vec<SessionSummary>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, title, message_count, last_active_at FROM conversations
             WHERE owner_id = ? AND archived = 0
             ORDER BY last_active_at DESC
             LIMIT ?",
        )
        .bind(owner.0)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let last_active_at: String = row.try_get("last_active_at").map_err(decode_err)?;
                let message_count: i64 = row.try_get("message_count").map_err(decode_err)?;
                Ok(SessionSummary {
                    id: ConversationId(row.try_get("id").map_err(decode_err)?),
                    title: row.try_get("title").map_err(decode_err)?,
                    last_active_at: parse_timestamp(&last_active_at)?,
                    message_count: u32::try_from(message_count).map_err(decode_err)?,
                })
            })
            .collect()
    }

    async fn mark_archived(
        &self,
        owner: EmployeeId,
        id: &ConversationId,
    ) -> Result<bool, RepositoryError> {
        let result =
            sqlx::query("UPDATE conversations SET archived = 1 WHERE id = ? AND owner_id = ?")
                .bind(&id.0)
                .bind(owner.0)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_turn(row: &SqliteRow) -> Result<Turn, RepositoryError> {
    let role_str: String = row.try_get("role").map_err(decode_err)?;
    let role = TurnRole::parse(&role_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown turn role `{role_str}`")))?;
    let tokens_used: Option<i64> = row.try_get("tokens_used").map_err(decode_err)?;
    let data_sources: String = row.try_get("data_sources").map_err(decode_err)?;
    let is_proactive: i64 = row.try_get("is_proactive").map_err(decode_err)?;
    let created_at: String = row.try_get("created_at").map_err(decode_err)?;

    Ok(Turn {
        role,
        content: row.try_get("content").map_err(decode_err)?,
        tokens_used: tokens_used.map(u32::try_from).transpose().map_err(decode_err)?,
        data_sources: serde_json::from_str(&data_sources).map_err(decode_err)?,
        is_proactive: is_proactive != 0,
        created_at: parse_timestamp(&created_at)?,
    })
}

#[async_trait]
impl ConversationStore for SqlConversationRepository {
    async fn get_or_create(
        &self,
        owner: EmployeeId,
        id: Option<&ConversationId>,
        title: &str,
    ) -> Result<ConversationId, StoreError> {
        Ok(self.open_session(owner, id, title).await?)
    }

    async fn append_turn(&self, id: &ConversationId, turn: Turn) -> Result<u32, StoreError> {
        Ok(self.insert_turn(id, turn).await?)
    }

    async fn load_recent_turns(
        &self,
        id: &ConversationId,
        limit: u32,
    ) -> Result<Vec<Turn>, StoreError> {
        Ok(self.recent_turns(id, limit).await?)
    }

    async fn session(
        &self,
        owner: EmployeeId,
        id: &ConversationId,
    ) -> Result<Option<ConversationSession>, StoreError> {
        Ok(self.full_session(owner, id).await?)
    }

    async fn recent_sessions(
        &self,
        owner: EmployeeId,
        limit: u32,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        Ok(self.summaries(owner, limit).await?)
    }

    async fn archive(&self, owner: EmployeeId, id: &ConversationId) -> Result<bool, StoreError> {
        Ok(self.mark_archived(owner, id).await?)
    }
}
