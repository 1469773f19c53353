// src/startup/mod.rs
// Startup / service registry (C12), per spec §4.12. The teacher's
// `AppState::new()` builds every service as one long sequential chain of
// `Arc::new(...)` calls gated by a single `CONFIG.validate()?`; that shape
// has no notion of priority or an overall deadline. This generalizes it
// into phase-ordered initialization under one wall-clock budget, so a
// non-critical dependency (RAG, calendar) can fail without the whole
// process going down with it, while state.rs keeps the teacher's
// sequential-construction style inside each phase.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// State store, webhook auth, config validation. No degraded mode exists.
    Critical,
    /// LLM gateway, template resolver, outbox delivery worker.
    High,
    /// Optional capabilities: RAG retriever, calendar adapter.
    Medium,
    /// Background jobs: analytics export, checkpoint pruning.
    Deferred,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Critical => "critical",
            Phase::High => "high",
            Phase::Medium => "medium",
            Phase::Deferred => "deferred",
        }
    }

    /// Whether a failure in this phase is fatal to startup.
    fn is_fatal(&self) -> bool {
        matches!(self, Phase::Critical | Phase::High)
    }
}

/// Tracks the one startup deadline (`GatewayConfig::startup_deadline_secs`)
/// shared by every phase, and which Medium/Deferred features ended up
/// degraded so `/readyz` can report them.
pub struct StartupClock {
    started: Instant,
    deadline: Duration,
    degraded: Mutex<Vec<&'static str>>,
}

impl StartupClock {
    pub fn start(deadline: Duration) -> Self {
        Self {
            started: Instant::now(),
            deadline,
            degraded: Mutex::new(Vec::new()),
        }
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_sub(self.started.elapsed())
    }

    /// Runs a Critical/High initializer under the remaining deadline.
    /// Any failure — error or timeout — aborts startup.
    pub async fn required<T, F>(&self, phase: Phase, name: &'static str, fut: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        debug_assert!(phase.is_fatal());
        info!(phase = phase.as_str(), task = name, "starting");
        match tokio::time::timeout(self.remaining(), fut).await {
            Ok(Ok(value)) => {
                info!(phase = phase.as_str(), task = name, "ready");
                Ok(value)
            }
            Ok(Err(e)) => {
                error!(phase = phase.as_str(), task = name, error = %e, "fatal startup failure");
                Err(anyhow::anyhow!("startup task '{name}' ({}) failed: {e}", phase.as_str()))
            }
            Err(_) => {
                error!(phase = phase.as_str(), task = name, "startup deadline exceeded");
                Err(anyhow::anyhow!(
                    "startup task '{name}' ({}) exceeded the {:?} startup deadline",
                    phase.as_str(),
                    self.deadline
                ))
            }
        }
    }

    /// Runs a Medium/Deferred initializer. A failure or timeout is logged
    /// and the feature it backs is recorded as degraded rather than
    /// aborting startup; callers fall back to a null/no-op implementation.
    pub async fn optional<T, F>(&self, phase: Phase, name: &'static str, fut: F) -> Option<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        debug_assert!(!phase.is_fatal());
        info!(phase = phase.as_str(), task = name, "starting");
        match tokio::time::timeout(self.remaining(), fut).await {
            Ok(Ok(value)) => {
                info!(phase = phase.as_str(), task = name, "ready");
                Some(value)
            }
            Ok(Err(e)) => {
                warn!(phase = phase.as_str(), task = name, error = %e, "non-critical startup failure, continuing degraded");
                self.degraded.lock().await.push(name);
                None
            }
            Err(_) => {
                warn!(phase = phase.as_str(), task = name, "startup deadline exceeded, continuing degraded");
                self.degraded.lock().await.push(name);
                None
            }
        }
    }

    pub async fn degraded_features(&self) -> Vec<&'static str> {
        self.degraded.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn required_task_propagates_error() {
        let clock = StartupClock::start(Duration::from_secs(5));
        let result: anyhow::Result<()> = clock
            .required(Phase::Critical, "state_store", async { Err(anyhow::anyhow!("db unreachable")) })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn optional_task_degrades_instead_of_failing() {
        let clock = StartupClock::start(Duration::from_secs(5));
        let value: Option<()> = clock
            .optional(Phase::Medium, "rag_retriever", async { Err(anyhow::anyhow!("qdrant unreachable")) })
            .await;
        assert!(value.is_none());
        assert_eq!(clock.degraded_features().await, vec!["rag_retriever"]);
    }

    #[tokio::test]
    async fn required_task_times_out_under_a_tight_deadline() {
        let clock = StartupClock::start(Duration::from_millis(5));
        let result: anyhow::Result<()> = clock
            .required(Phase::Critical, "slow_task", async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;
        assert!(result.is_err());
    }
}
