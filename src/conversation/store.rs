// src/conversation/store.rs
// The state + checkpoint store (C1): write-ahead, optimistic-concurrency
// persistence of Conversation + Checkpoint. Grounded on the teacher's
// checkpoint/mod.rs sqlx idiom (same-transaction writes, `?`-bound queries,
// `sqlite::memory:` test pools).

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::checkpoint::{Checkpoint, CheckpointSummary};
use super::{Conversation, ConversationError, Message, Stage};

pub struct ConversationStore {
    db: SqlitePool,
}

impl ConversationStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn migrate(db: &SqlitePool) -> Result<(), ConversationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                conversation_id TEXT PRIMARY KEY,
                peer_id TEXT NOT NULL,
                instance TEXT NOT NULL,
                version INTEGER NOT NULL,
                state_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(db)
        .await
        .map_err(|e| ConversationError::StorageUnavailable(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                checkpoint_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                stage TEXT NOT NULL,
                payload TEXT NOT NULL,
                reason TEXT NOT NULL,
                PRIMARY KEY (conversation_id, checkpoint_id)
            )
            "#,
        )
        .execute(db)
        .await
        .map_err(|e| ConversationError::StorageUnavailable(e.to_string()))?;

        Ok(())
    }

    pub async fn load(&self, conversation_id: &str) -> Result<Option<Conversation>, ConversationError> {
        let row = sqlx::query("SELECT state_json FROM conversations WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_optional(&self.db)
            .await
            .map_err(|e| ConversationError::StorageUnavailable(e.to_string()))?;

        match row {
            Some(row) => {
                let json: String = row.get("state_json");
                let conv: Conversation = serde_json::from_str(&json)
                    .map_err(|e| ConversationError::StorageUnavailable(e.to_string()))?;
                Ok(Some(conv))
            }
            None => Ok(None),
        }
    }

    /// Inserts a brand-new conversation (version 1) and writes its first checkpoint.
    pub async fn create(&self, mut conv: Conversation) -> Result<Conversation, ConversationError> {
        conv.check_invariants()?;
        conv.version = 1;
        let json = serde_json::to_string(&conv)
            .map_err(|e| ConversationError::StorageUnavailable(e.to_string()))?;

        let mut tx = self
            .db
            .begin()
            .await
            .map_err(|e| ConversationError::StorageUnavailable(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO conversations (conversation_id, peer_id, instance, version, state_json, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&conv.conversation_id)
        .bind(&conv.peer_id)
        .bind(&conv.instance)
        .bind(conv.version)
        .bind(&json)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await
        .map_err(|e| ConversationError::StorageUnavailable(e.to_string()))?;

        write_checkpoint(&mut tx, &conv, &json, "created").await?;

        tx.commit()
            .await
            .map_err(|e| ConversationError::StorageUnavailable(e.to_string()))?;

        Ok(conv)
    }

    pub async fn append_message(
        &self,
        conversation_id: &str,
        msg: Message,
        reason: &str,
    ) -> Result<Conversation, ConversationError> {
        self.mutate(conversation_id, reason, |conv| conv.append_message(msg))
            .await
    }

    /// All mutations go through here: invariant check, version bump, and a
    /// durable checkpoint written in the same transaction (spec §4.1: the
    /// checkpoint is durable before any outside-visible side effect proceeds).
    /// Concurrent mutation on the same conversation is serialized by the
    /// compare-and-swap on `version`; the loser gets `StaleVersion`.
    pub async fn mutate<F>(
        &self,
        conversation_id: &str,
        reason: &str,
        f: F,
    ) -> Result<Conversation, ConversationError>
    where
        F: FnOnce(&mut Conversation) -> Result<(), ConversationError>,
    {
        let mut conv = self
            .load(conversation_id)
            .await?
            .ok_or_else(|| ConversationError::NotFound(conversation_id.to_string()))?;

        if conv.pending_deletion {
            return Err(ConversationError::PendingDeletion(conversation_id.to_string()));
        }

        let old_version = conv.version;
        f(&mut conv)?;
        conv.check_invariants()?;
        conv.version = old_version + 1;

        let json = serde_json::to_string(&conv)
            .map_err(|e| ConversationError::StorageUnavailable(e.to_string()))?;

        let mut tx = self
            .db
            .begin()
            .await
            .map_err(|e| ConversationError::StorageUnavailable(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE conversations SET state_json = ?, version = ?, updated_at = ?
            WHERE conversation_id = ? AND version = ?
            "#,
        )
        .bind(&json)
        .bind(conv.version)
        .bind(Utc::now().timestamp())
        .bind(conversation_id)
        .bind(old_version)
        .execute(&mut *tx)
        .await
        .map_err(|e| ConversationError::StorageUnavailable(e.to_string()))?;

        if result.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(ConversationError::StaleVersion(conversation_id.to_string()));
        }

        write_checkpoint(&mut tx, &conv, &json, reason).await?;

        tx.commit()
            .await
            .map_err(|e| ConversationError::StorageUnavailable(e.to_string()))?;

        Ok(conv)
    }

    pub async fn list_checkpoints(
        &self,
        conversation_id: &str,
        limit: i64,
    ) -> Result<Vec<CheckpointSummary>, ConversationError> {
        let rows = sqlx::query(
            r#"
            SELECT checkpoint_id, conversation_id, created_at, stage, reason
            FROM checkpoints
            WHERE conversation_id = ?
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.db)
        .await
        .map_err(|e| ConversationError::StorageUnavailable(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let stage_str: String = row.get("stage");
                let stage = parse_stage(&stage_str)?;
                let ts: i64 = row.get("created_at");
                Ok(CheckpointSummary {
                    checkpoint_id: row.get("checkpoint_id"),
                    conversation_id: row.get("conversation_id"),
                    created_at: chrono::DateTime::from_timestamp(ts, 0).unwrap_or_else(Utc::now),
                    stage,
                    reason: row.get("reason"),
                })
            })
            .collect()
    }

    pub async fn get_checkpoint(
        &self,
        conversation_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>, ConversationError> {
        let row = sqlx::query(
            r#"
            SELECT checkpoint_id, conversation_id, created_at, stage, payload, reason
            FROM checkpoints WHERE conversation_id = ? AND checkpoint_id = ?
            "#,
        )
        .bind(conversation_id)
        .bind(checkpoint_id)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| ConversationError::StorageUnavailable(e.to_string()))?;

        match row {
            None => Ok(None),
            Some(row) => {
                let stage_str: String = row.get("stage");
                let payload_json: String = row.get("payload");
                let payload: Conversation = serde_json::from_str(&payload_json)
                    .map_err(|e| ConversationError::StorageUnavailable(e.to_string()))?;
                let ts: i64 = row.get("created_at");
                Ok(Some(Checkpoint {
                    checkpoint_id: row.get("checkpoint_id"),
                    conversation_id: row.get("conversation_id"),
                    created_at: chrono::DateTime::from_timestamp(ts, 0).unwrap_or_else(Utc::now),
                    stage: parse_stage(&stage_str)?,
                    payload,
                    reason: row.get("reason"),
                }))
            }
        }
    }

    /// Restores a conversation's live state to a prior checkpoint's payload
    /// (crash recovery / replay, spec §4.1). Writes a new checkpoint marking
    /// the restore so the round-trip law in spec §8 holds for subsequent replays.
    pub async fn restore(
        &self,
        conversation_id: &str,
        checkpoint_id: &str,
    ) -> Result<Conversation, ConversationError> {
        let checkpoint = self
            .get_checkpoint(conversation_id, checkpoint_id)
            .await?
            .ok_or_else(|| ConversationError::NotFound(checkpoint_id.to_string()))?;

        let current = self
            .load(conversation_id)
            .await?
            .ok_or_else(|| ConversationError::NotFound(conversation_id.to_string()))?;

        let mut restored = checkpoint.payload;
        restored.version = current.version + 1;

        let json = serde_json::to_string(&restored)
            .map_err(|e| ConversationError::StorageUnavailable(e.to_string()))?;

        let mut tx = self
            .db
            .begin()
            .await
            .map_err(|e| ConversationError::StorageUnavailable(e.to_string()))?;

        let result = sqlx::query(
            "UPDATE conversations SET state_json = ?, version = ?, updated_at = ? WHERE conversation_id = ? AND version = ?",
        )
        .bind(&json)
        .bind(restored.version)
        .bind(Utc::now().timestamp())
        .bind(conversation_id)
        .bind(current.version)
        .execute(&mut *tx)
        .await
        .map_err(|e| ConversationError::StorageUnavailable(e.to_string()))?;

        if result.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(ConversationError::StaleVersion(conversation_id.to_string()));
        }

        write_checkpoint(&mut tx, &restored, &json, "restored").await?;

        tx.commit()
            .await
            .map_err(|e| ConversationError::StorageUnavailable(e.to_string()))?;

        Ok(restored)
    }

    /// Prunes checkpoints beyond the retention policy (spec §3: "pruned by age/retention policy").
    pub async fn prune_checkpoints(
        &self,
        conversation_id: &str,
        keep: i64,
    ) -> Result<u64, ConversationError> {
        let result = sqlx::query(
            r#"
            DELETE FROM checkpoints
            WHERE conversation_id = ? AND checkpoint_id NOT IN (
                SELECT checkpoint_id FROM checkpoints
                WHERE conversation_id = ?
                ORDER BY created_at DESC
                LIMIT ?
            )
            "#,
        )
        .bind(conversation_id)
        .bind(conversation_id)
        .bind(keep)
        .execute(&self.db)
        .await
        .map_err(|e| ConversationError::StorageUnavailable(e.to_string()))?;

        Ok(result.rows_affected())
    }
}

async fn write_checkpoint(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    conv: &Conversation,
    payload_json: &str,
    reason: &str,
) -> Result<(), ConversationError> {
    let checkpoint_id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO checkpoints (checkpoint_id, conversation_id, created_at, stage, payload, reason)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&checkpoint_id)
    .bind(&conv.conversation_id)
    .bind(Utc::now().timestamp())
    .bind(conv.stage.as_str())
    .bind(payload_json)
    .bind(reason)
    .execute(&mut **tx)
    .await
    .map_err(|e| ConversationError::StorageUnavailable(e.to_string()))?;
    Ok(())
}

fn parse_stage(s: &str) -> Result<Stage, ConversationError> {
    match s {
        "greeting" => Ok(Stage::Greeting),
        "qualification" => Ok(Stage::Qualification),
        "information" => Ok(Stage::InformationGathering),
        "scheduling" => Ok(Stage::Scheduling),
        "confirmation" => Ok(Stage::Confirmation),
        "validation" => Ok(Stage::Validation),
        "completed" => Ok(Stage::Completed),
        "handoff" => Ok(Stage::Handoff),
        "fallback" => Ok(Stage::Fallback),
        other => Err(ConversationError::StorageUnavailable(format!(
            "unknown stage in storage: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{Message, Role};

    async fn test_store() -> ConversationStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        ConversationStore::migrate(&pool).await.unwrap();
        ConversationStore::new(pool)
    }

    #[tokio::test]
    async fn create_then_load_round_trips() {
        let store = test_store().await;
        let conv = Conversation::new("c1".into(), "+55".into(), "inst".into());
        store.create(conv.clone()).await.unwrap();

        let loaded = store.load("c1").await.unwrap().unwrap();
        assert_eq!(loaded.conversation_id, "c1");
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn mutate_bumps_version_and_writes_checkpoint() {
        let store = test_store().await;
        let conv = Conversation::new("c1".into(), "+55".into(), "inst".into());
        store.create(conv).await.unwrap();

        let msg = Message {
            role: Role::User,
            text: "Oi".into(),
            ts: Utc::now(),
            message_id: "m1".into(),
        };
        let updated = store.append_message("c1", msg, "user_message").await.unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.metrics.message_count, 1);

        let checkpoints = store.list_checkpoints("c1", 10).await.unwrap();
        assert_eq!(checkpoints.len(), 2); // created + append_message
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let store = test_store().await;
        let conv = Conversation::new("c1".into(), "+55".into(), "inst".into());
        store.create(conv).await.unwrap();

        // Simulate a racing writer by mutating the version out from under us.
        sqlx::query("UPDATE conversations SET version = 99 WHERE conversation_id = 'c1'")
            .execute(&store.db)
            .await
            .unwrap();

        let result = store
            .mutate("c1", "race", |conv| {
                conv.record_success();
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ConversationError::StaleVersion(_))));
    }

    #[tokio::test]
    async fn restore_resets_state_to_checkpoint() {
        let store = test_store().await;
        let conv = Conversation::new("c1".into(), "+55".into(), "inst".into());
        store.create(conv).await.unwrap();

        let checkpoints = store.list_checkpoints("c1", 10).await.unwrap();
        let first_checkpoint = checkpoints.last().unwrap().checkpoint_id.clone();

        store
            .mutate("c1", "advance", |conv| {
                conv.transition(Stage::Qualification, "test");
                Ok(())
            })
            .await
            .unwrap();

        let restored = store.restore("c1", &first_checkpoint).await.unwrap();
        assert_eq!(restored.stage, Stage::Greeting);
    }

    #[tokio::test]
    async fn prune_checkpoints_keeps_most_recent() {
        let store = test_store().await;
        let conv = Conversation::new("c1".into(), "+55".into(), "inst".into());
        store.create(conv).await.unwrap();
        for i in 0..5 {
            store
                .mutate("c1", &format!("step-{i}"), |conv| {
                    conv.record_success();
                    Ok(())
                })
                .await
                .unwrap();
        }
        let deleted = store.prune_checkpoints("c1", 2).await.unwrap();
        assert_eq!(deleted, 4); // 6 total checkpoints - 2 kept
        let remaining = store.list_checkpoints("c1", 100).await.unwrap();
        assert_eq!(remaining.len(), 2);
    }
}
