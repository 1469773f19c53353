// src/rag/mod.rs
// RAG retriever (C6), per spec §4.6. Modeled as a capability interface with
// a null implementation per spec §9 ("optional heavy dependencies... model
// as capability interfaces with null implementations; feature flags at
// startup select real vs. null"). Grounded on the teacher's memory/storage
// read path for the query shape, generalized to this crate's own types.

use async_trait::async_trait;

use crate::conversation::Stage;

#[derive(Debug, Clone)]
pub struct Snippet {
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct RagResult {
    pub snippets: Vec<Snippet>,
    /// Set when the backend was consulted but unavailable; never set by the
    /// null implementation, which has no backend to be unavailable.
    pub degraded: bool,
}

impl RagResult {
    pub fn empty() -> Self {
        Self {
            snippets: Vec::new(),
            degraded: false,
        }
    }
}

#[async_trait]
pub trait RagRetriever: Send + Sync {
    /// Returns up to `k` ranked snippets whose concatenation fits within
    /// `token_budget`. Read-only; fails soft (spec §4.6).
    async fn retrieve(
        &self,
        query: &str,
        stage: Option<Stage>,
        k: usize,
        token_budget: usize,
    ) -> RagResult;
}

/// Selected when RAG is not configured (spec §9 null-object pattern).
pub struct NullRag;

#[async_trait]
impl RagRetriever for NullRag {
    async fn retrieve(&self, _query: &str, _stage: Option<Stage>, _k: usize, _token_budget: usize) -> RagResult {
        RagResult::empty()
    }
}

/// Truncates concatenated snippet text to an approximate token budget using
/// a 4-characters-per-token heuristic, consistent with the estimator used
/// for LLM prompt sizing elsewhere in this crate.
pub fn fit_to_token_budget(snippets: Vec<Snippet>, token_budget: usize) -> Vec<Snippet> {
    let char_budget = token_budget.saturating_mul(4);
    let mut used = 0usize;
    let mut fitted = Vec::new();
    for snippet in snippets {
        let len = snippet.text.chars().count();
        if used + len > char_budget {
            break;
        }
        used += len;
        fitted.push(snippet);
    }
    fitted
}

#[cfg(feature = "rag-qdrant")]
pub mod qdrant;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_rag_always_returns_empty_not_degraded() {
        let rag = NullRag;
        let result = rag.retrieve("como funciona o kumon", Some(Stage::InformationGathering), 3, 500).await;
        assert!(result.snippets.is_empty());
        assert!(!result.degraded);
    }

    #[test]
    fn fit_to_token_budget_stops_before_overflow() {
        let snippets = vec![
            Snippet { text: "a".repeat(100), score: 0.9 },
            Snippet { text: "b".repeat(100), score: 0.8 },
            Snippet { text: "c".repeat(100), score: 0.7 },
        ];
        let fitted = fit_to_token_budget(snippets, 40); // 160 chars budget
        assert_eq!(fitted.len(), 1);
    }
}
