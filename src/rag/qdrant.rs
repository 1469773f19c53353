// src/rag/qdrant.rs
// Real RAG backend behind the `rag-qdrant` feature. Grounded on the
// teacher's memory/storage/qdrant/multi_store.rs: `Qdrant::from_url`,
// `SearchPointsBuilder`, and reading `.payload` off each `ScoredPoint`.
// Embedding generation is out of scope for this spec (C6 is "purely
// read-only"; embedding choice is explicitly out of scope per §4.6), so
// callers supply an already-embedded query vector via `Embedder`.

use async_trait::async_trait;
use qdrant_client::qdrant::SearchPointsBuilder;
use qdrant_client::Qdrant;
use tracing::warn;

use super::{fit_to_token_budget, RagResult, RagRetriever, Snippet};
use crate::conversation::Stage;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

pub struct QdrantRag<E: Embedder> {
    client: Qdrant,
    collection: String,
    embedder: E,
}

impl<E: Embedder> QdrantRag<E> {
    pub fn connect(url: &str, collection: impl Into<String>, embedder: E) -> anyhow::Result<Self> {
        let client = Qdrant::from_url(url).build()?;
        Ok(Self {
            client,
            collection: collection.into(),
            embedder,
        })
    }
}

#[async_trait]
impl<E: Embedder> RagRetriever for QdrantRag<E> {
    async fn retrieve(&self, query: &str, stage: Option<Stage>, k: usize, token_budget: usize) -> RagResult {
        let embedding = match self.embedder.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "rag embedding failed, degrading to empty result");
                return RagResult { snippets: Vec::new(), degraded: true };
            }
        };

        let search = SearchPointsBuilder::new(&self.collection, embedding, k as u64).with_payload(true);

        let response = match self.client.search_points(search).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, stage = ?stage, "qdrant search failed, degrading to empty result");
                return RagResult { snippets: Vec::new(), degraded: true };
            }
        };

        let snippets: Vec<Snippet> = response
            .result
            .into_iter()
            .filter_map(|point| {
                let text = point
                    .payload
                    .get("text")
                    .and_then(|v| v.as_str().map(|s| s.to_string()))?;
                Some(Snippet { text, score: point.score })
            })
            .collect();

        RagResult {
            snippets: fit_to_token_budget(snippets, token_budget),
            degraded: false,
        }
    }
}
