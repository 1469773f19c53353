// src/llm/error.rs

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("daily LLM budget exceeded")]
    BudgetExceeded,
    #[error("no adapter available: all configured providers are open or unconfigured")]
    NoAdapterAvailable,
    #[error("circuit breaker open for provider {0}")]
    CircuitOpen(String),
    #[error("provider {provider} returned a transient error: {message}")]
    Transient { provider: String, message: String },
    #[error("provider {provider} returned a fatal error: {message}")]
    Fatal { provider: String, message: String },
    #[error("request deadline exceeded")]
    DeadlineExceeded,
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}
