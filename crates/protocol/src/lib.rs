use serde::{Deserialize, Serialize};

pub mod config;

pub use config::OrchestratorConfig;

/// Complexity tier assigned by the query classifier. Derived once, never mutated.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityClass {
    Simple,
    Moderate,
    Complex,
}

/// Closed set of question types. Every decision point (decomposition, tier
/// selection, orchestrator step selection) matches exhaustively on this enum
/// so adding a variant is a compile-time-checked change.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    Simple,
    Analytical,
    Synthesis,
    Comparative,
    Factual,
    Creative,
    ChainOfThought,
}

/// Model size tier a sub-request is routed toward.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Fast,
    Balanced,
    Deep,
}

/// Caller-supplied overrides for a single query.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct QueryHints {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub use_consensus: bool,
}

/// An incoming question. Immutable once received; lives for one request.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Query {
    pub text: String,
    pub session_id: String,
    #[serde(default)]
    pub hints: QueryHints,
}

/// An independently answerable fragment of a decomposed query.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SubRequest {
    pub id: String,
    pub parent: String,
    pub text: String,
    pub class: ComplexityClass,
    pub question_type: QuestionType,
    pub tier: ModelTier,
}

/// One ranked chunk out of hybrid retrieval. Read-only after fusion.
///
/// `vector_score` / `lexical_score` are normalized to [0,1]; `None` means the
/// chunk did not appear in that sub-search and contributed zero to the fused
/// score.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RetrievalCandidate {
    pub chunk_id: String,
    pub doc_id: String,
    pub text: String,
    pub vector_score: Option<f32>,
    pub lexical_score: Option<f32>,
    pub fused_score: f32,
    /// Document recency in milliseconds since the epoch; 0 when unknown.
    #[serde(default)]
    pub recency_ms: u64,
}

/// Multi-factor trust estimate. All fields in [0,1]. A report is never
/// recomputed in place; retries produce a replacement.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct ConfidenceReport {
    pub semantic: f32,
    pub content_quality: f32,
    pub consistency: f32,
    pub complexity_adjustment: f32,
    pub composite: f32,
}

impl ConfidenceReport {
    /// Report for an answer with no supporting evidence at all.
    #[must_use]
    pub fn zero() -> Self {
        Self {
            semantic: 0.0,
            content_quality: 0.0,
            consistency: 0.0,
            complexity_adjustment: 0.0,
            composite: 0.0,
        }
    }
}

/// Draft answer for one sub-request.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SubResponse {
    pub request_id: String,
    pub text: String,
    pub instance_id: Option<String>,
    pub sources: Vec<Citation>,
    pub confidence: ConfidenceReport,
    pub latency_ms: u64,
    #[serde(default)]
    pub via_web_fallback: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One entry of the append-only per-session conversation log.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConversationTurn {
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub reasoning: QuestionType,
    pub timestamp_ms: u64,
}

/// Source attribution attached to a final answer. Web results carry the URL
/// in `doc_id`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Citation {
    pub chunk_id: String,
    pub doc_id: String,
    pub snippet: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FinalAnswer {
    pub text: String,
    pub citations: Vec<Citation>,
    pub confidence: ConfidenceReport,
    /// True when the answer fell back to web search or could not find
    /// supporting context. Degradation is always explicit, never silent.
    pub degraded: bool,
    #[serde(default)]
    pub notices: Vec<String>,
}

/// Streamed answer surface. A stream always terminates with `Done` carrying
/// the final confidence score and ordered citation list.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnswerEvent {
    Token { text: String },
    Citations { citations: Vec<Citation> },
    Confidence { report: ConfidenceReport },
    Notice { message: String },
    Done { answer: FinalAnswer },
}

/// Parameters forwarded to a generation backend.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GenerationParams {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Per-instance operational state as reported by `health()`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InstanceHealth {
    pub id: String,
    pub healthy: bool,
    pub avg_latency_ms: f64,
    pub error_rate: f64,
    pub in_flight: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HealthSnapshot {
    pub instances: Vec<InstanceHealth>,
    pub cache_hit_rate: f64,
    pub avg_latency_ms: f64,
}
