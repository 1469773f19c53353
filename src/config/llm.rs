// src/config/llm.rs
// LLM gateway configuration: budget ceiling, retry/backoff, circuit breaker.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub factor: f64,
    pub jitter_pct: f64,
    pub max_attempts: u32,
    pub max_wall_ms: u64,
}

impl RetryConfig {
    pub fn llm_default() -> Self {
        Self {
            base_delay_ms: 250,
            factor: 2.0,
            jitter_pct: 0.20,
            max_attempts: 3,
            max_wall_ms: 8_000,
        }
    }

    pub fn delivery_default() -> Self {
        Self {
            base_delay_ms: 1_000,
            factor: 2.0,
            jitter_pct: 0.20,
            max_attempts: 5,
            max_wall_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub failure_rate_window_secs: u64,
    pub failure_rate_threshold: f64,
    pub open_duration_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_window_secs: 30,
            failure_rate_threshold: 0.5,
            open_duration_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Daily spend ceiling, "R$5/day-equivalent" by default per spec §4.5.
    pub daily_budget_limit: f64,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub providers: Vec<ProviderConfig>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        let mut providers = Vec::new();
        if let Ok(key) = std::env::var("PRIMARY_LLM_API_KEY") {
            providers.push(ProviderConfig {
                name: "primary".into(),
                api_key: key,
                model: super::helpers::env_or("PRIMARY_LLM_MODEL", "gpt-5.1"),
                base_url: super::helpers::env_or(
                    "PRIMARY_LLM_BASE_URL",
                    "https://api.openai.com/v1",
                ),
            });
        }
        if let Ok(key) = std::env::var("FALLBACK_LLM_API_KEY") {
            providers.push(ProviderConfig {
                name: "fallback".into(),
                api_key: key,
                model: super::helpers::env_or("FALLBACK_LLM_MODEL", "gemini-3-pro"),
                base_url: super::helpers::env_or(
                    "FALLBACK_LLM_BASE_URL",
                    "https://generativelanguage.googleapis.com/v1",
                ),
            });
        }

        Self {
            daily_budget_limit: super::helpers::env_f64("RECEPTIONIST_DAILY_BUDGET", 5.0),
            retry: RetryConfig::llm_default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            providers,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.daily_budget_limit <= 0.0 {
            return Err(anyhow::anyhow!(
                "RECEPTIONIST_DAILY_BUDGET must be positive"
            ));
        }
        if self.providers.is_empty() {
            return Err(anyhow::anyhow!(
                "at least one LLM provider (PRIMARY_LLM_API_KEY) must be configured"
            ));
        }
        Ok(())
    }
}
