// src/llm/budget.rs
// Daily LLM spend ceiling (C5, spec §4.5). Adapted from the teacher's
// budget/mod.rs: same sqlx ledger + day-window query shape, narrowed to the
// single daily ceiling this spec calls for (no per-user/monthly tracking).

use chrono::{Datelike, TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use tracing::warn;

use super::error::LlmError;

#[derive(Debug, Clone, Default)]
pub struct BudgetUsage {
    pub total_cost: f64,
    pub total_requests: i64,
    pub tokens_input: i64,
    pub tokens_output: i64,
}

pub struct BudgetTracker {
    db: SqlitePool,
    daily_limit: f64,
}

impl BudgetTracker {
    pub fn new(db: SqlitePool, daily_limit: f64) -> Self {
        Self { db, daily_limit }
    }

    pub async fn migrate(db: &SqlitePool) -> Result<(), LlmError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS llm_usage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                tokens_input INTEGER NOT NULL,
                tokens_output INTEGER NOT NULL,
                cost REAL NOT NULL,
                ts INTEGER NOT NULL
            )
            "#,
        )
        .execute(db)
        .await
        .map_err(|e| LlmError::StorageUnavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn record_request(
        &self,
        provider: &str,
        model: &str,
        tokens_input: i64,
        tokens_output: i64,
        cost: f64,
    ) -> Result<(), LlmError> {
        sqlx::query(
            "INSERT INTO llm_usage (provider, model, tokens_input, tokens_output, cost, ts) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(provider)
        .bind(model)
        .bind(tokens_input)
        .bind(tokens_output)
        .bind(cost)
        .bind(Utc::now().timestamp())
        .execute(&self.db)
        .await
        .map_err(|e| LlmError::StorageUnavailable(e.to_string()))?;
        Ok(())
    }

    fn today_start_ts(&self) -> i64 {
        let now = Utc::now();
        Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
            .single()
            .unwrap_or(now)
            .timestamp()
    }

    pub async fn daily_usage(&self) -> Result<BudgetUsage, LlmError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(cost), 0.0) AS total_cost,
                   COUNT(*) AS total_requests,
                   COALESCE(SUM(tokens_input), 0) AS tokens_input,
                   COALESCE(SUM(tokens_output), 0) AS tokens_output
            FROM llm_usage WHERE ts >= ?
            "#,
        )
        .bind(self.today_start_ts())
        .fetch_one(&self.db)
        .await
        .map_err(|e| LlmError::StorageUnavailable(e.to_string()))?;

        Ok(BudgetUsage {
            total_cost: row.get("total_cost"),
            total_requests: row.get("total_requests"),
            tokens_input: row.get("tokens_input"),
            tokens_output: row.get("tokens_output"),
        })
    }

    /// Rejects with `BudgetExceeded` when projected spend (current usage plus
    /// `estimated_cost`) would exceed the daily ceiling (spec §4.5).
    pub async fn check_budget(&self, estimated_cost: f64) -> Result<(), LlmError> {
        let usage = self.daily_usage().await?;
        if usage.total_cost + estimated_cost > self.daily_limit {
            warn!(
                total_cost = usage.total_cost,
                estimated_cost, daily_limit = self.daily_limit, "daily LLM budget would be exceeded"
            );
            return Err(LlmError::BudgetExceeded);
        }
        Ok(())
    }

    pub fn daily_limit(&self) -> f64 {
        self.daily_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn tracker(limit: f64) -> BudgetTracker {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        BudgetTracker::migrate(&pool).await.unwrap();
        BudgetTracker::new(pool, limit)
    }

    #[tokio::test]
    async fn budget_allows_spend_under_ceiling() {
        let t = tracker(5.0).await;
        assert!(t.check_budget(1.0).await.is_ok());
    }

    #[tokio::test]
    async fn budget_rejects_spend_over_ceiling() {
        let t = tracker(1.0).await;
        t.record_request("primary", "gpt-5.1", 100, 100, 0.9)
            .await
            .unwrap();
        assert!(matches!(t.check_budget(0.5).await, Err(LlmError::BudgetExceeded)));
    }

    #[tokio::test]
    async fn record_request_accumulates_usage() {
        let t = tracker(5.0).await;
        t.record_request("primary", "gpt-5.1", 10, 20, 0.1).await.unwrap();
        t.record_request("primary", "gpt-5.1", 10, 20, 0.1).await.unwrap();
        let usage = t.daily_usage().await.unwrap();
        assert_eq!(usage.total_requests, 2);
        assert!((usage.total_cost - 0.2).abs() < 1e-9);
    }
}
