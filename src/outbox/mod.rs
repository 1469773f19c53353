// src/outbox/mod.rs
// Outbox & delivery coordinator (C10), per spec §4.10: the single place
// allowed to hand messages to the gateway. Grounded on the teacher's
// cache/session_state_store.rs sqlx idiom (same table-per-aggregate,
// `Row::get` mapping) generalized from a cache-state table to a durable
// per-turn message queue, and on api/ws/chat/connection.rs for the
// one-send-in-flight-per-peer discipline that becomes the per-conversation
// delivery serialization here.

pub mod delivery;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::workflow::OutboxEntryDraft;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxState {
    Planned,
    Ready,
    InFlight,
    Delivered,
    Failed,
    Dropped,
}

impl OutboxState {
    fn as_str(self) -> &'static str {
        match self {
            OutboxState::Planned => "planned",
            OutboxState::Ready => "ready",
            OutboxState::InFlight => "in_flight",
            OutboxState::Delivered => "delivered",
            OutboxState::Failed => "failed",
            OutboxState::Dropped => "dropped",
        }
    }

    fn parse(s: &str) -> Result<Self, OutboxError> {
        match s {
            "planned" => Ok(OutboxState::Planned),
            "ready" => Ok(OutboxState::Ready),
            "in_flight" => Ok(OutboxState::InFlight),
            "delivered" => Ok(OutboxState::Delivered),
            "failed" => Ok(OutboxState::Failed),
            "dropped" => Ok(OutboxState::Dropped),
            other => Err(OutboxError::StorageUnavailable(format!(
                "unknown outbox state in storage: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: String,
    pub conversation_id: String,
    pub turn_id: String,
    pub seq: u32,
    pub kind: String,
    pub payload: String,
    pub state: OutboxState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub gateway_msg_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox storage unavailable: {0}")]
    StorageUnavailable(String),
    /// Per spec §4.10, a second admission attempt for a `turn_id` is
    /// rejected rather than silently accepted; the metric must stay zero
    /// in normal operation.
    #[error("turn already handed off")]
    AlreadyHandedOff,
    #[error("instance '{0}' is not in the allow-list")]
    InstanceNotAllowed(String),
    #[error("transient delivery error: {0}")]
    Transient(String),
    #[error("delivery failed: {0}")]
    Fatal(String),
}

pub struct OutboxStore {
    db: SqlitePool,
}

impl OutboxStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn migrate(db: &SqlitePool) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_entries (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                turn_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                last_error TEXT,
                gateway_msg_id TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(db)
        .await
        .map_err(|e| OutboxError::StorageUnavailable(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_outbox_turn ON outbox_entries (conversation_id, turn_id)")
            .execute(db)
            .await
            .map_err(|e| OutboxError::StorageUnavailable(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_handoffs (
                turn_id TEXT PRIMARY KEY,
                admitted_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(db)
        .await
        .map_err(|e| OutboxError::StorageUnavailable(e.to_string()))?;

        Ok(())
    }

    /// Writes `entries` as `Planned` in one atomic batch keyed by
    /// `(conversation_id, turn_id)`. Re-planning the same turn is a no-op:
    /// returns the previously-planned rows and `is_new = false`.
    pub async fn plan_turn(
        &self,
        conversation_id: &str,
        turn_id: &str,
        entries: &[OutboxEntryDraft],
    ) -> Result<(Vec<OutboxEntry>, bool), OutboxError> {
        let existing = self.list_for_turn(conversation_id, turn_id).await?;
        if !existing.is_empty() {
            return Ok((existing, false));
        }

        let mut tx = self
            .db
            .begin()
            .await
            .map_err(|e| OutboxError::StorageUnavailable(e.to_string()))?;
        let now = Utc::now().timestamp();
        let mut planned = Vec::with_capacity(entries.len());

        for draft in entries {
            let id = format!("{turn_id}:{}", draft.seq);
            sqlx::query(
                r#"
                INSERT INTO outbox_entries
                    (id, conversation_id, turn_id, seq, kind, payload, state, attempts, last_error, gateway_msg_id, created_at)
                VALUES (?, ?, ?, ?, 'text', ?, 'planned', 0, NULL, NULL, ?)
                "#,
            )
            .bind(&id)
            .bind(conversation_id)
            .bind(turn_id)
            .bind(draft.seq as i64)
            .bind(&draft.text)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| OutboxError::StorageUnavailable(e.to_string()))?;

            planned.push(OutboxEntry {
                id,
                conversation_id: conversation_id.to_string(),
                turn_id: turn_id.to_string(),
                seq: draft.seq,
                kind: "text".to_string(),
                payload: draft.text.clone(),
                state: OutboxState::Planned,
                attempts: 0,
                last_error: None,
                gateway_msg_id: None,
            });
        }

        tx.commit()
            .await
            .map_err(|e| OutboxError::StorageUnavailable(e.to_string()))?;

        Ok((planned, true))
    }

    /// The handoff gate: admits exactly one `Planned -> Ready` transition
    /// per `turn_id`. The `INSERT ... ON CONFLICT DO NOTHING` is the
    /// compare-and-swap; losing it means someone already admitted this turn.
    pub async fn admit_handoff(&self, turn_id: &str) -> Result<(), OutboxError> {
        let result = sqlx::query(
            "INSERT INTO outbox_handoffs (turn_id, admitted_at) VALUES (?, ?) ON CONFLICT(turn_id) DO NOTHING",
        )
        .bind(turn_id)
        .bind(Utc::now().timestamp())
        .execute(&self.db)
        .await
        .map_err(|e| OutboxError::StorageUnavailable(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::AlreadyHandedOff);
        }

        sqlx::query("UPDATE outbox_entries SET state = 'ready' WHERE turn_id = ? AND state = 'planned'")
            .bind(turn_id)
            .execute(&self.db)
            .await
            .map_err(|e| OutboxError::StorageUnavailable(e.to_string()))?;

        Ok(())
    }

    pub async fn list_for_turn(
        &self,
        conversation_id: &str,
        turn_id: &str,
    ) -> Result<Vec<OutboxEntry>, OutboxError> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, turn_id, seq, kind, payload, state, attempts, last_error, gateway_msg_id
            FROM outbox_entries
            WHERE conversation_id = ? AND turn_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(conversation_id)
        .bind(turn_id)
        .fetch_all(&self.db)
        .await
        .map_err(|e| OutboxError::StorageUnavailable(e.to_string()))?;

        rows.into_iter().map(row_to_entry).collect()
    }

    async fn set_state(
        &self,
        id: &str,
        from: OutboxState,
        to: OutboxState,
        bump_attempts: bool,
        last_error: Option<&str>,
        gateway_msg_id: Option<&str>,
    ) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_entries
            SET state = ?,
                attempts = attempts + ?,
                last_error = ?,
                gateway_msg_id = COALESCE(?, gateway_msg_id)
            WHERE id = ? AND state = ?
            "#,
        )
        .bind(to.as_str())
        .bind(if bump_attempts { 1_i64 } else { 0_i64 })
        .bind(last_error)
        .bind(gateway_msg_id)
        .bind(id)
        .bind(from.as_str())
        .execute(&self.db)
        .await
        .map_err(|e| OutboxError::StorageUnavailable(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::StorageUnavailable(format!(
                "entry {id} was not in expected state {from:?}"
            )));
        }
        Ok(())
    }

    /// The one state transition that represents an actual delivery attempt;
    /// `attempts` is bumped here only.
    pub async fn mark_in_flight(&self, id: &str) -> Result<(), OutboxError> {
        self.set_state(id, OutboxState::Ready, OutboxState::InFlight, true, None, None).await
    }

    pub async fn mark_delivered(&self, id: &str, gateway_msg_id: &str) -> Result<(), OutboxError> {
        self.set_state(id, OutboxState::InFlight, OutboxState::Delivered, false, None, Some(gateway_msg_id))
            .await
    }

    /// A failed delivery lands in `Failed`, never silently retried by a
    /// later turn (spec §4.10 Failure semantics).
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<(), OutboxError> {
        self.set_state(id, OutboxState::InFlight, OutboxState::Failed, false, Some(error), None)
            .await
    }
}

fn row_to_entry(row: sqlx::sqlite::SqliteRow) -> Result<OutboxEntry, OutboxError> {
    let state_str: String = row.get("state");
    Ok(OutboxEntry {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        turn_id: row.get("turn_id"),
        seq: row.get::<i64, _>("seq") as u32,
        kind: row.get("kind"),
        payload: row.get("payload"),
        state: OutboxState::parse(&state_str)?,
        attempts: row.get::<i64, _>("attempts") as u32,
        last_error: row.get("last_error"),
        gateway_msg_id: row.get("gateway_msg_id"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> OutboxStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        OutboxStore::migrate(&pool).await.unwrap();
        OutboxStore::new(pool)
    }

    fn drafts() -> Vec<OutboxEntryDraft> {
        vec![
            OutboxEntryDraft { seq: 1, text: "oi!".into() },
            OutboxEntryDraft { seq: 2, text: "tudo bem?".into() },
        ]
    }

    #[tokio::test]
    async fn plan_turn_is_idempotent_on_turn_id() {
        let store = store().await;
        let (first, is_new) = store.plan_turn("c1", "t1", &drafts()).await.unwrap();
        assert!(is_new);
        assert_eq!(first.len(), 2);

        let (second, is_new) = store.plan_turn("c1", "t1", &drafts()).await.unwrap();
        assert!(!is_new);
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn admit_handoff_is_single_shot_per_turn() {
        let store = store().await;
        store.plan_turn("c1", "t1", &drafts()).await.unwrap();
        store.admit_handoff("t1").await.unwrap();

        let err = store.admit_handoff("t1").await.unwrap_err();
        assert!(matches!(err, OutboxError::AlreadyHandedOff));

        let entries = store.list_for_turn("c1", "t1").await.unwrap();
        assert!(entries.iter().all(|e| e.state == OutboxState::Ready));
    }

    #[tokio::test]
    async fn delivery_lifecycle_transitions_in_order() {
        let store = store().await;
        let (entries, _) = store.plan_turn("c1", "t1", &drafts()).await.unwrap();
        store.admit_handoff("t1").await.unwrap();

        let first = &entries[0];
        store.mark_in_flight(&first.id).await.unwrap();
        store.mark_delivered(&first.id, "gw-msg-1").await.unwrap();

        let refreshed = store.list_for_turn("c1", "t1").await.unwrap();
        let delivered = refreshed.iter().find(|e| e.id == first.id).unwrap();
        assert_eq!(delivered.state, OutboxState::Delivered);
        assert_eq!(delivered.gateway_msg_id.as_deref(), Some("gw-msg-1"));
    }
}
