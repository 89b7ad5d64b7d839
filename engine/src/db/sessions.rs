/// Session persistence operations
///
/// Every mutation runs in its own transaction under a per-conversation lock,
/// so concurrent appends for one conversation are serialized while other
/// conversations proceed in parallel. All queries are parameterized.
use crate::locks::KeyedLocks;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sdk::errors::EngineError;
use sdk::types::{ConversationId, ConversationSession, Turn, TurnRole};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Rows removed by a reset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub turns_removed: u64,
    pub facts_removed: u64,
}

/// One line of `brief session list`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub turn_count: i64,
    pub fact_count: i64,
    pub updated_at: DateTime<Utc>,
}

/// Durable conversation state.
///
/// Failures are reported as `EngineError::Storage`; a caller that sees one
/// must not continue from the state it had in memory.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Full session for `id`, or an empty one if it has never been seen
    async fn load(&self, id: &ConversationId) -> Result<ConversationSession, EngineError>;

    /// Append one turn at the end of the history
    async fn append_turn(
        &self,
        id: &ConversationId,
        role: TurnRole,
        content: &str,
    ) -> Result<Turn, EngineError>;

    /// Append `turns` in order and upsert `facts` in one transaction.
    /// Either all of it is stored or none of it.
    async fn commit_turn(
        &self,
        id: &ConversationId,
        turns: &[Turn],
        facts: &BTreeMap<String, String>,
    ) -> Result<(), EngineError>;

    /// Upsert an agreed fact; the last write for a key wins
    async fn set_fact(&self, id: &ConversationId, key: &str, value: &str)
        -> Result<(), EngineError>;

    async fn get_facts(&self, id: &ConversationId) -> Result<BTreeMap<String, String>, EngineError>;

    /// Explicitly clear history, and facts too when `include_facts` is set
    async fn reset(&self, id: &ConversationId, include_facts: bool)
        -> Result<ResetReport, EngineError>;

    /// Known conversations, most recently active first
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, EngineError>;
}

/// SQLite-backed [`SessionStore`]
pub struct SqliteSessionStore {
    pool: SqlitePool,
    locks: Arc<KeyedLocks>,
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: Arc::new(KeyedLocks::new()),
        }
    }
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, EngineError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| EngineError::Storage(format!("invalid timestamp {micros}")))
}

/// Create the session row or bump its activity time.
///
/// Always the first statement of a mutating transaction, so the write lock is
/// taken up front.
async fn touch_session(
    conn: &mut sqlx::SqliteConnection,
    id: &ConversationId,
    now: i64,
) -> Result<(), EngineError> {
    sqlx::query(
        "INSERT INTO sessions (id, created_at, updated_at) VALUES (?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
    )
    .bind(id.as_str())
    .bind(now)
    .bind(now)
    .execute(conn)
    .await
    .map_err(EngineError::storage)?;
    Ok(())
}

/// Next `seq` for the conversation is allocated inside the same statement
async fn insert_turn(
    conn: &mut sqlx::SqliteConnection,
    id: &ConversationId,
    role: TurnRole,
    content: &str,
    created_at: i64,
) -> Result<(), EngineError> {
    sqlx::query(
        "INSERT INTO turns (conversation_id, seq, role, content, created_at)
         SELECT ?, COALESCE(MAX(seq), 0) + 1, ?, ?, ? FROM turns WHERE conversation_id = ?",
    )
    .bind(id.as_str())
    .bind(role.as_str())
    .bind(content)
    .bind(created_at)
    .bind(id.as_str())
    .execute(conn)
    .await
    .map_err(EngineError::storage)?;
    Ok(())
}

async fn upsert_fact(
    conn: &mut sqlx::SqliteConnection,
    id: &ConversationId,
    key: &str,
    value: &str,
    now: i64,
) -> Result<(), EngineError> {
    sqlx::query(
        "INSERT INTO facts (conversation_id, key, value, updated_at) VALUES (?, ?, ?, ?)
         ON CONFLICT(conversation_id, key) DO UPDATE
         SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(id.as_str())
    .bind(key)
    .bind(value)
    .bind(now)
    .execute(conn)
    .await
    .map_err(EngineError::storage)?;
    Ok(())
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, id: &ConversationId) -> Result<ConversationSession, EngineError> {
        // One read transaction so turns and facts come from the same snapshot.
        let mut tx = self.pool.begin().await.map_err(EngineError::storage)?;

        let turn_rows = sqlx::query(
            "SELECT role, content, created_at FROM turns WHERE conversation_id = ? ORDER BY seq ASC",
        )
        .bind(id.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(EngineError::storage)?;

        let fact_rows = sqlx::query("SELECT key, value FROM facts WHERE conversation_id = ?")
            .bind(id.as_str())
            .fetch_all(&mut *tx)
            .await
            .map_err(EngineError::storage)?;

        tx.commit().await.map_err(EngineError::storage)?;

        let mut turns = Vec::with_capacity(turn_rows.len());
        for row in turn_rows {
            let role: String = row.get("role");
            let role = TurnRole::parse(&role)
                .ok_or_else(|| EngineError::Storage(format!("unknown turn role '{role}'")))?;
            turns.push(Turn {
                role,
                content: row.get("content"),
                created_at: from_micros(row.get("created_at"))?,
            });
        }

        let facts = fact_rows
            .into_iter()
            .map(|row| (row.get("key"), row.get("value")))
            .collect();

        Ok(ConversationSession {
            id: id.clone(),
            turns,
            facts,
        })
    }

    async fn append_turn(
        &self,
        id: &ConversationId,
        role: TurnRole,
        content: &str,
    ) -> Result<Turn, EngineError> {
        let _guard = self.locks.lock(id.as_str()).await;

        let created_at = from_micros(Utc::now().timestamp_micros())?;
        let now = created_at.timestamp_micros();

        let mut tx = self.pool.begin().await.map_err(EngineError::storage)?;
        touch_session(&mut tx, id, now).await?;
        insert_turn(&mut tx, id, role, content, now).await?;
        tx.commit().await.map_err(EngineError::storage)?;

        tracing::trace!(conversation_id = %id, role = %role, "Turn appended");

        Ok(Turn {
            role,
            content: content.to_string(),
            created_at,
        })
    }

    async fn commit_turn(
        &self,
        id: &ConversationId,
        turns: &[Turn],
        facts: &BTreeMap<String, String>,
    ) -> Result<(), EngineError> {
        let _guard = self.locks.lock(id.as_str()).await;
        let now = Utc::now().timestamp_micros();

        let mut tx = self.pool.begin().await.map_err(EngineError::storage)?;
        touch_session(&mut tx, id, now).await?;
        for turn in turns {
            insert_turn(&mut tx, id, turn.role, &turn.content, turn.created_at.timestamp_micros())
                .await?;
        }
        for (key, value) in facts {
            upsert_fact(&mut tx, id, key, value, now).await?;
        }
        tx.commit().await.map_err(EngineError::storage)?;

        tracing::debug!(
            conversation_id = %id,
            turns = turns.len(),
            facts = facts.len(),
            "Turn committed"
        );
        Ok(())
    }

    async fn set_fact(
        &self,
        id: &ConversationId,
        key: &str,
        value: &str,
    ) -> Result<(), EngineError> {
        let _guard = self.locks.lock(id.as_str()).await;
        let now = Utc::now().timestamp_micros();

        let mut tx = self.pool.begin().await.map_err(EngineError::storage)?;
        touch_session(&mut tx, id, now).await?;
        upsert_fact(&mut tx, id, key, value, now).await?;
        tx.commit().await.map_err(EngineError::storage)?;

        tracing::debug!(conversation_id = %id, key, "Fact recorded");
        Ok(())
    }

    async fn get_facts(&self, id: &ConversationId) -> Result<BTreeMap<String, String>, EngineError> {
        let rows = sqlx::query("SELECT key, value FROM facts WHERE conversation_id = ?")
            .bind(id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(EngineError::storage)?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("key"), row.get("value")))
            .collect())
    }

    async fn reset(
        &self,
        id: &ConversationId,
        include_facts: bool,
    ) -> Result<ResetReport, EngineError> {
        let _guard = self.locks.lock(id.as_str()).await;
        let now = Utc::now().timestamp_micros();

        let mut tx = self.pool.begin().await.map_err(EngineError::storage)?;
        touch_session(&mut tx, id, now).await?;

        let turns_removed = sqlx::query("DELETE FROM turns WHERE conversation_id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(EngineError::storage)?
            .rows_affected();

        let facts_removed = if include_facts {
            sqlx::query("DELETE FROM facts WHERE conversation_id = ?")
                .bind(id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(EngineError::storage)?
                .rows_affected()
        } else {
            0
        };

        tx.commit().await.map_err(EngineError::storage)?;

        tracing::info!(
            conversation_id = %id,
            turns_removed,
            facts_removed,
            "Session reset"
        );

        Ok(ResetReport {
            turns_removed,
            facts_removed,
        })
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, EngineError> {
        let rows = sqlx::query(
            "SELECT s.id, s.updated_at,
                    (SELECT COUNT(*) FROM turns t WHERE t.conversation_id = s.id) AS turn_count,
                    (SELECT COUNT(*) FROM facts f WHERE f.conversation_id = s.id) AS fact_count
             FROM sessions s
             ORDER BY s.updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(EngineError::storage)?;

        rows.into_iter()
            .map(|row| {
                Ok(ConversationSummary {
                    id: ConversationId::new(row.get::<String, _>("id")),
                    turn_count: row.get("turn_count"),
                    fact_count: row.get("fact_count"),
                    updated_at: from_micros(row.get("updated_at"))?,
                })
            })
            .collect()
    }
}
