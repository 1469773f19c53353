// src/llm/mod.rs
// LLM gateway (C5), per spec §4.5: unified facade over provider adapters
// with budgeting, retries, circuit breaking and failover. Grounded on the
// teacher's llm/provider/mod.rs facade shape and budget/mod.rs, enriched
// with the pack's circuit breaker (no equivalent exists in the teacher).

pub mod budget;
pub mod circuit_breaker;
pub mod error;
pub mod provider;

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::llm::{LlmConfig, RetryConfig};
use crate::retry::retry_with_backoff;

pub use error::LlmError;
pub use provider::{ChatMessage, ChunkStream, LlmProvider, LlmRequest, LlmResponse};

use budget::BudgetTracker;
use circuit_breaker::CircuitBreaker;

struct Adapter {
    provider: Arc<dyn LlmProvider>,
    breaker: CircuitBreaker,
}

pub struct LlmGateway {
    adapters: Vec<Adapter>,
    budget: Arc<BudgetTracker>,
    retry: RetryConfig,
}

impl LlmGateway {
    pub fn new(config: &LlmConfig, budget: Arc<BudgetTracker>, providers: Vec<Arc<dyn LlmProvider>>) -> Self {
        let adapters = providers
            .into_iter()
            .map(|provider| Adapter {
                breaker: CircuitBreaker::new(provider.name().to_string(), config.circuit_breaker.clone()),
                provider,
            })
            .collect();
        Self {
            adapters,
            budget,
            retry: config.retry.clone(),
        }
    }

    /// Generates a reply, trying providers in configured order and failing
    /// over when one is open or exhausts its retries (spec §4.5 Failover).
    pub async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.budget.check_budget(request.budget_hint).await?;

        let mut last_err = None;
        for adapter in &self.adapters {
            if adapter.breaker.state().await == circuit_breaker::CircuitState::Open {
                continue;
            }

            let outcome = adapter
                .breaker
                .execute(|| {
                    retry_with_backoff(
                        self.retry.clone(),
                        || adapter.provider.generate(request),
                        |e: &LlmError| matches!(e, LlmError::Transient { .. }),
                    )
                })
                .await;

            match outcome {
                Ok(response) => {
                    self.budget
                        .record_request(
                            adapter.provider.name(),
                            &response.model,
                            response.usage.prompt_tokens as i64,
                            response.usage.completion_tokens as i64,
                            response.usage.cost,
                        )
                        .await?;
                    metrics::counter!("llm_calls_total", "provider" => adapter.provider.name().to_string(), "outcome" => "success")
                        .increment(1);
                    metrics::histogram!("llm_latency_ms", "provider" => adapter.provider.name().to_string())
                        .record(response.latency_ms as f64);
                    return Ok(response);
                }
                Err(e) => {
                    warn!(provider = adapter.provider.name(), error = %e, "provider failed, trying next");
                    metrics::counter!("llm_calls_total", "provider" => adapter.provider.name().to_string(), "outcome" => "error")
                        .increment(1);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(LlmError::NoAdapterAvailable))
    }

    pub async fn stream(&self, request: &LlmRequest) -> Result<ChunkStream, LlmError> {
        for adapter in &self.adapters {
            if adapter.breaker.state().await == circuit_breaker::CircuitState::Open {
                continue;
            }
            self.budget.check_budget(request.budget_hint).await?;
            match adapter.provider.stream(request).await {
                Ok(stream) => {
                    info!(provider = adapter.provider.name(), "streaming response");
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(provider = adapter.provider.name(), error = %e, "stream failed, trying next");
                    continue;
                }
            }
        }
        Err(LlmError::NoAdapterAvailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::llm::CircuitBreakerConfig;
    use crate::conversation::Role;
    use provider::{ChatMessage, EchoProvider, FailingProvider};
    use std::time::Duration;

    fn retry_config() -> RetryConfig {
        RetryConfig {
            base_delay_ms: 1,
            factor: 1.0,
            jitter_pct: 0.0,
            max_attempts: 1,
            max_wall_ms: 1000,
        }
    }

    fn request() -> LlmRequest {
        LlmRequest {
            messages: vec![ChatMessage {
                role: Role::User,
                content: "Oi".into(),
            }],
            system_prompt: None,
            max_tokens: 100,
            temperature: 0.2,
            stop: vec![],
            budget_hint: 0.01,
            deadline: Duration::from_secs(5),
        }
    }

    async fn budget(limit: f64) -> Arc<BudgetTracker> {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        BudgetTracker::migrate(&pool).await.unwrap();
        Arc::new(BudgetTracker::new(pool, limit))
    }

    fn llm_config() -> LlmConfig {
        LlmConfig {
            daily_budget_limit: 5.0,
            retry: retry_config(),
            circuit_breaker: CircuitBreakerConfig::default(),
            providers: vec![],
        }
    }

    #[tokio::test]
    async fn generate_succeeds_with_first_healthy_provider() {
        let gateway = LlmGateway::new(
            &llm_config(),
            budget(5.0).await,
            vec![Arc::new(EchoProvider { label: "primary" })],
        );
        let response = gateway.generate(&request()).await.unwrap();
        assert!(response.text.starts_with("echo:"));
    }

    #[tokio::test]
    async fn generate_fails_over_to_second_provider() {
        let gateway = LlmGateway::new(
            &llm_config(),
            budget(5.0).await,
            vec![
                Arc::new(FailingProvider { label: "primary" }),
                Arc::new(EchoProvider { label: "fallback" }),
            ],
        );
        let response = gateway.generate(&request()).await.unwrap();
        assert!(response.text.starts_with("echo:"));
    }

    #[tokio::test]
    async fn generate_surfaces_last_provider_error_when_all_fail() {
        let gateway = LlmGateway::new(
            &llm_config(),
            budget(5.0).await,
            vec![Arc::new(FailingProvider { label: "only" })],
        );
        let result = gateway.generate(&request()).await;
        assert!(matches!(result, Err(LlmError::Transient { .. })));
    }

    #[tokio::test]
    async fn generate_rejects_over_budget() {
        let gateway = LlmGateway::new(
            &llm_config(),
            budget(0.0).await,
            vec![Arc::new(EchoProvider { label: "primary" })],
        );
        let result = gateway.generate(&request()).await;
        assert!(matches!(result, Err(LlmError::BudgetExceeded)));
    }
}
