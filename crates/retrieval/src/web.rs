use crate::error::Result;
use async_trait::async_trait;
use desk_protocol::RetrievalCandidate;

/// A web search result used on the fallback path.
#[derive(Debug, Clone)]
pub struct WebHit {
    pub title: String,
    pub snippet: String,
    pub url: String,
}

/// External web search collaborator. Invoked only when confidence falls
/// below threshold and web fallback is enabled.
#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<WebHit>>;
}

/// Convert web hits into candidates so the downstream scoring and citation
/// machinery treats them uniformly. The URL rides in `doc_id`; scores rank
/// hits by result order.
#[must_use]
pub fn candidates_from_web(hits: Vec<WebHit>) -> Vec<RetrievalCandidate> {
    let total = hits.len().max(1) as f32;
    hits.into_iter()
        .enumerate()
        .map(|(i, hit)| RetrievalCandidate {
            chunk_id: format!("web:{i}"),
            doc_id: hit.url,
            text: format!("{}: {}", hit.title, hit.snippet),
            vector_score: None,
            lexical_score: None,
            fused_score: 1.0 - i as f32 / total,
            recency_ms: 0,
        })
        .collect()
}
