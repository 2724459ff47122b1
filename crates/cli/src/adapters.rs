//! HTTP adapters for the external collaborators. These are the deployment
//! edge of the abstract traits; the orchestration crates never see HTTP.

use async_trait::async_trait;
use desk_retrieval::{
    ChunkIndex, LexicalHit, QueryEmbedder, Result, RetrievalError, VectorHit, WebHit, WebSearch,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone)]
pub struct HttpChunkIndex {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct VectorSearchRequest<'a> {
    embedding: &'a [f32],
    k: usize,
}

#[derive(Serialize)]
struct LexicalSearchRequest<'a> {
    query: &'a str,
    k: usize,
}

#[derive(Deserialize)]
struct VectorSearchHit {
    chunk_id: String,
    doc_id: String,
    text: String,
    distance: f32,
    #[serde(default)]
    recency_ms: u64,
}

#[derive(Deserialize)]
struct LexicalSearchHit {
    chunk_id: String,
    doc_id: String,
    text: String,
    score: f32,
    #[serde(default)]
    recency_ms: u64,
}

impl HttpChunkIndex {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ChunkIndex for HttpChunkIndex {
    async fn vector_search(&self, embedding: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        let url = format!("{}/vector_search", self.base_url);
        let hits: Vec<VectorSearchHit> = post_json(
            &self.http,
            &url,
            &VectorSearchRequest { embedding, k },
        )
        .await?;
        Ok(hits
            .into_iter()
            .map(|h| VectorHit {
                chunk_id: h.chunk_id,
                doc_id: h.doc_id,
                text: h.text,
                distance: h.distance,
                recency_ms: h.recency_ms,
            })
            .collect())
    }

    async fn lexical_search(&self, query: &str, k: usize) -> Result<Vec<LexicalHit>> {
        let url = format!("{}/lexical_search", self.base_url);
        let hits: Vec<LexicalSearchHit> =
            post_json(&self.http, &url, &LexicalSearchRequest { query, k }).await?;
        Ok(hits
            .into_iter()
            .map(|h| LexicalHit {
                chunk_id: h.chunk_id,
                doc_id: h.doc_id,
                text: h.text,
                score: h.score,
                recency_ms: h.recency_ms,
            })
            .collect())
    }
}

#[derive(Clone)]
pub struct HttpEmbedder {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl QueryEmbedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embed", self.base_url);
        let response: EmbedResponse = post_json(&self.http, &url, &EmbedRequest { text })
            .await
            .map_err(|err| RetrievalError::Embedding(err.to_string()))?;
        Ok(response.embedding)
    }
}

#[derive(Clone)]
pub struct HttpWebSearch {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct WebSearchRequest<'a> {
    query: &'a str,
}

#[derive(Deserialize)]
struct WebSearchHit {
    title: String,
    snippet: String,
    url: String,
}

impl HttpWebSearch {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl WebSearch for HttpWebSearch {
    async fn search(&self, query: &str) -> Result<Vec<WebHit>> {
        let url = format!("{}/search", self.base_url);
        let hits: Vec<WebSearchHit> = post_json(&self.http, &url, &WebSearchRequest { query })
            .await
            .map_err(|err| RetrievalError::Web(err.to_string()))?;
        Ok(hits
            .into_iter()
            .map(|h| WebHit {
                title: h.title,
                snippet: h.snippet,
                url: h.url,
            })
            .collect())
    }
}

fn client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| RetrievalError::Index(err.to_string()))
}

async fn post_json<B: Serialize, T: for<'de> Deserialize<'de>>(
    http: &reqwest::Client,
    url: &str,
    body: &B,
) -> Result<T> {
    let response = http
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|err| RetrievalError::Index(err.to_string()))?
        .error_for_status()
        .map_err(|err| RetrievalError::Index(err.to_string()))?;
    response
        .json()
        .await
        .map_err(|err| RetrievalError::Index(err.to_string()))
}
