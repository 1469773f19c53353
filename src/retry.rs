// src/retry.rs
// Exponential backoff with jitter, shared by C5 (LLM calls) and C10
// (delivery). The teacher leans on governor for inbound throttling but has
// no outbound retry helper, so this is new, grounded directly in the exact
// parameters spec §4.5/§4.10 give: base delay, multiplicative factor,
// +/-jitter_pct, max attempts, max wall clock.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::llm::RetryConfig;

pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
    started_at: Instant,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempt: 0,
            started_at: Instant::now(),
        }
    }

    /// Returns the delay before the next attempt, or `None` if attempts or
    /// wall-clock budget are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts.saturating_sub(1) {
            return None;
        }
        if self.started_at.elapsed() >= Duration::from_millis(self.config.max_wall_ms) {
            return None;
        }

        let base = self.config.base_delay_ms as f64 * self.config.factor.powi(self.attempt as i32);
        let jitter_span = base * self.config.jitter_pct;
        let jittered = rand::thread_rng().gen_range((base - jitter_span).max(0.0)..=(base + jitter_span));
        self.attempt += 1;
        Some(Duration::from_millis(jittered.round() as u64))
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempt
    }
}

/// Runs `operation` under the retry policy, retrying transient failures
/// (`should_retry` returns true) until attempts/deadline are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: RetryConfig,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut backoff = Backoff::new(config);
    loop {
        match operation().await {
            Ok(v) => return Ok(v),
            Err(e) if should_retry(&e) => match backoff.next_delay() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}
