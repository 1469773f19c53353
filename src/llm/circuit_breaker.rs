// src/llm/circuit_breaker.rs
// Per-adapter circuit breaker (spec §4.5, §9: "explicit state machines, not
// ambient globals"). Adapted from the pack's resilience/circuit_breaker.rs:
// same Closed/Open/HalfOpen machine over tokio::sync::RwLock, generalized to
// this crate's LlmError and to a failure-rate-over-a-window open condition
// in addition to the teacher's consecutive-failure threshold.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use super::error::LlmError;
use crate::config::llm::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    /// Outcomes (success=true) in the failure-rate window, oldest first.
    window: VecDeque<(Instant, bool)>,
}

pub struct CircuitBreaker {
    name: String,
    inner: Arc<RwLock<Inner>>,
    config: CircuitBreakerConfig,
    half_open_success_threshold: u32,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(RwLock::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
                window: VecDeque::new(),
            })),
            config,
            half_open_success_threshold: 1,
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    /// Runs `operation` under circuit-breaker protection. Rejects immediately
    /// with `CircuitOpen` while open and the timeout hasn't elapsed; admits
    /// exactly one probe in half-open.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, LlmError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, LlmError>>,
    {
        {
            let mut inner = self.inner.write().await;
            if inner.state == CircuitState::Open {
                let open_duration = Duration::from_secs(self.config.open_duration_secs);
                match inner.opened_at {
                    Some(opened_at) if opened_at.elapsed() >= open_duration => {
                        inner.state = CircuitState::HalfOpen;
                        inner.half_open_successes = 0;
                    }
                    _ => return Err(LlmError::CircuitOpen(self.name.clone())),
                }
            }
        }

        match operation().await {
            Ok(result) => {
                self.record_outcome(true).await;
                Ok(result)
            }
            Err(e) => {
                self.record_outcome(false).await;
                Err(e)
            }
        }
    }

    async fn record_outcome(&self, success: bool) {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        let window = Duration::from_secs(self.config.failure_rate_window_secs);
        inner.window.push_back((now, success));
        while let Some((ts, _)) = inner.window.front() {
            if now.duration_since(*ts) > window {
                inner.window.pop_front();
            } else {
                break;
            }
        }

        if success {
            inner.consecutive_failures = 0;
            if inner.state == CircuitState::HalfOpen {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.half_open_success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.window.clear();
                }
            }
            return;
        }

        inner.consecutive_failures += 1;
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            return;
        }

        let failures_in_window = inner.window.iter().filter(|(_, ok)| !ok).count();
        let failure_rate = failures_in_window as f64 / inner.window.len() as f64;
        let rate_tripped = inner.window.len() >= self.config.failure_threshold as usize
            && failure_rate >= self.config.failure_rate_threshold;

        if inner.consecutive_failures >= self.config.failure_threshold || rate_tripped {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            failure_rate_window_secs: 30,
            failure_rate_threshold: 0.5,
            open_duration_secs: 60,
        }
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let cb = CircuitBreaker::new("test", config());
        for _ in 0..3 {
            let _ = cb
                .execute(|| async {
                    Err::<(), _>(LlmError::Transient {
                        provider: "test".into(),
                        message: "boom".into(),
                    })
                })
                .await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_calling_operation() {
        let cb = CircuitBreaker::new("test", config());
        for _ in 0..3 {
            let _ = cb
                .execute(|| async {
                    Err::<(), _>(LlmError::Transient {
                        provider: "t".into(),
                        message: "x".into(),
                    })
                })
                .await;
        }
        let result = cb.execute(|| async { Ok::<_, LlmError>(42) }).await;
        assert!(matches!(result, Err(LlmError::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn success_resets_consecutive_failure_count() {
        let cb = CircuitBreaker::new("test", config());
        let _ = cb
            .execute(|| async {
                Err::<(), _>(LlmError::Transient {
                    provider: "t".into(),
                    message: "x".into(),
                })
            })
            .await;
        let _ = cb.execute(|| async { Ok::<_, LlmError>(1) }).await;
        let _ = cb
            .execute(|| async {
                Err::<(), _>(LlmError::Transient {
                    provider: "t".into(),
                    message: "x".into(),
                })
            })
            .await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }
}
