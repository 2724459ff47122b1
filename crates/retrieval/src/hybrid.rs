use crate::error::{Result, RetrievalError};
use crate::fusion::{fuse, SourceHit};
use async_trait::async_trait;
use desk_protocol::config::FusionConfig;
use desk_protocol::RetrievalCandidate;
use std::sync::Arc;
use std::time::Duration;

/// A vector-similarity hit from the external chunk index. `distance` is a
/// raw distance; smaller is closer.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: String,
    pub doc_id: String,
    pub text: String,
    pub distance: f32,
    pub recency_ms: u64,
}

/// A lexical (BM25-style) hit from the external chunk index. `score` is a
/// raw relevance score; larger is better.
#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub chunk_id: String,
    pub doc_id: String,
    pub text: String,
    pub score: f32,
    pub recency_ms: u64,
}

/// The external chunk retrieval backend. Assumed to already exclude content
/// outside the caller's access scope.
#[async_trait]
pub trait ChunkIndex: Send + Sync {
    async fn vector_search(&self, embedding: &[f32], k: usize) -> Result<Vec<VectorHit>>;
    async fn lexical_search(&self, query: &str, k: usize) -> Result<Vec<LexicalHit>>;
}

/// The external embedding backend, used for query embedding.
#[async_trait]
pub trait QueryEmbedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Hybrid retrieval combining vector and lexical sub-searches with
/// weighted-sum fusion.
pub struct HybridRetriever {
    index: Arc<dyn ChunkIndex>,
    embedder: Arc<dyn QueryEmbedder>,
    cfg: FusionConfig,
}

impl HybridRetriever {
    pub fn new(index: Arc<dyn ChunkIndex>, embedder: Arc<dyn QueryEmbedder>, cfg: FusionConfig) -> Self {
        Self { index, embedder, cfg }
    }

    /// Run both sub-searches concurrently and fuse the results.
    ///
    /// Failure of one sub-search degrades gracefully to single-source
    /// ranking. Failure of both raises `RetrievalError::Unavailable`, which
    /// the caller must turn into the web-fallback path.
    pub async fn search(&self, query_text: &str) -> Result<Vec<RetrievalCandidate>> {
        if query_text.trim().is_empty() {
            return Err(RetrievalError::EmptyQuery);
        }

        let pool = self.cfg.candidate_pool.max(self.cfg.top_k);
        let timeout = Duration::from_millis(self.cfg.source_timeout_ms);

        let vector_fut = self.vector_hits(query_text, pool, timeout);
        let lexical_fut = self.lexical_hits(query_text, pool, timeout);
        let (vector, lexical) = tokio::join!(vector_fut, lexical_fut);

        let (vector_hits, lexical_hits) = match (vector, lexical) {
            (Ok(v), Ok(l)) => (v, l),
            (Ok(v), Err(err)) => {
                log::warn!("Lexical search failed, degrading to vector-only ranking: {err}");
                (v, Vec::new())
            }
            (Err(err), Ok(l)) => {
                log::warn!("Vector search failed, degrading to lexical-only ranking: {err}");
                (Vec::new(), l)
            }
            (Err(vector), Err(lexical)) => {
                return Err(RetrievalError::Unavailable {
                    vector: vector.to_string(),
                    lexical: lexical.to_string(),
                });
            }
        };

        let candidates = fuse(&self.cfg, vector_hits, lexical_hits);
        log::debug!(
            "Hybrid retrieval: query='{}', {} fused candidates",
            query_text,
            candidates.len()
        );
        Ok(candidates)
    }

    async fn vector_hits(
        &self,
        query_text: &str,
        pool: usize,
        timeout: Duration,
    ) -> Result<Vec<SourceHit>> {
        let work = async {
            let embedding = self.embedder.embed(query_text).await?;
            self.index.vector_search(&embedding, pool).await
        };
        let hits = tokio::time::timeout(timeout, work)
            .await
            .map_err(|_| RetrievalError::Index("vector search timed out".to_string()))??;
        Ok(hits
            .into_iter()
            .map(|h| SourceHit {
                chunk_id: h.chunk_id,
                doc_id: h.doc_id,
                text: h.text,
                // Distance to similarity; zero distance maps to 1.0.
                score: 1.0 / (1.0 + h.distance.max(0.0)),
                recency_ms: h.recency_ms,
            })
            .collect())
    }

    async fn lexical_hits(
        &self,
        query_text: &str,
        pool: usize,
        timeout: Duration,
    ) -> Result<Vec<SourceHit>> {
        let hits = tokio::time::timeout(timeout, self.index.lexical_search(query_text, pool))
            .await
            .map_err(|_| RetrievalError::Index("lexical search timed out".to_string()))??;
        Ok(hits
            .into_iter()
            .map(|h| SourceHit {
                chunk_id: h.chunk_id,
                doc_id: h.doc_id,
                text: h.text,
                score: h.score,
                recency_ms: h.recency_ms,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubIndex {
        vector_fails: AtomicBool,
        lexical_fails: AtomicBool,
    }

    impl StubIndex {
        fn new(vector_fails: bool, lexical_fails: bool) -> Self {
            Self {
                vector_fails: AtomicBool::new(vector_fails),
                lexical_fails: AtomicBool::new(lexical_fails),
            }
        }
    }

    #[async_trait]
    impl ChunkIndex for StubIndex {
        async fn vector_search(&self, _embedding: &[f32], _k: usize) -> Result<Vec<VectorHit>> {
            if self.vector_fails.load(Ordering::Relaxed) {
                return Err(RetrievalError::Index("vector backend down".to_string()));
            }
            Ok(vec![VectorHit {
                chunk_id: "v1".to_string(),
                doc_id: "doc1".to_string(),
                text: "semantic match".to_string(),
                distance: 0.2,
                recency_ms: 0,
            }])
        }

        async fn lexical_search(&self, _query: &str, _k: usize) -> Result<Vec<LexicalHit>> {
            if self.lexical_fails.load(Ordering::Relaxed) {
                return Err(RetrievalError::Index("lexical backend down".to_string()));
            }
            Ok(vec![LexicalHit {
                chunk_id: "l1".to_string(),
                doc_id: "doc2".to_string(),
                text: "keyword match".to_string(),
                score: 3.5,
                recency_ms: 0,
            }])
        }
    }

    struct StubEmbedder;

    #[async_trait]
    impl QueryEmbedder for StubEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.1, 0.2, 0.3])
        }
    }

    fn retriever(vector_fails: bool, lexical_fails: bool) -> HybridRetriever {
        HybridRetriever::new(
            Arc::new(StubIndex::new(vector_fails, lexical_fails)),
            Arc::new(StubEmbedder),
            FusionConfig::default(),
        )
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let err = retriever(false, false).search("  ").await.unwrap_err();
        assert!(matches!(err, RetrievalError::EmptyQuery));
    }

    #[tokio::test]
    async fn both_sources_contribute() {
        let candidates = retriever(false, false).search("query").await.unwrap();
        assert_eq!(candidates.len(), 2);
    }

    #[tokio::test]
    async fn vector_failure_degrades_to_lexical_only() {
        let candidates = retriever(true, false).search("query").await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].chunk_id, "l1");
        assert!(candidates[0].vector_score.is_none());
    }

    #[tokio::test]
    async fn both_failing_raises_unavailable() {
        let err = retriever(true, true).search("query").await.unwrap_err();
        assert!(matches!(err, RetrievalError::Unavailable { .. }));
    }
}
