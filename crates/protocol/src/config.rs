//! Configuration surface for the orchestrator. Every tunable the pipeline
//! consults is named here; nothing is hardcoded at a decision point.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub classifier: ClassifierConfig,
    pub decompose: DecomposeConfig,
    pub fusion: FusionConfig,
    pub confidence: ConfidenceConfig,
    pub balancer: BalancerConfig,
    pub consensus: ConsensusConfig,
    pub reasoning: ReasoningConfig,
    pub memory: MemoryConfig,
    pub cache: CacheConfig,
    pub timeouts: TimeoutConfig,
    pub web_fallback_enabled: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Queries at or below this token count lean toward Simple.
    pub simple_max_tokens: usize,
    /// Queries at or above this token count are Complex regardless of cues.
    pub complex_min_tokens: usize,
    /// Capacity of the content-hash classification cache.
    pub cache_capacity: usize,
    /// TTL of cached classifications, seconds.
    pub cache_ttl_secs: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            simple_max_tokens: 12,
            complex_min_tokens: 48,
            cache_capacity: 512,
            cache_ttl_secs: 86_400,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DecomposeConfig {
    /// Hard ceiling on sub-requests per query. Excess clauses are merged
    /// into the nearest sub-request, never dropped.
    pub max_sub_requests: usize,
}

impl Default for DecomposeConfig {
    fn default() -> Self {
        Self {
            max_sub_requests: 5,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FusionConfig {
    /// Weight of the normalized vector score; lexical gets `1 - alpha`.
    pub alpha: f32,
    /// Candidates returned to the caller after fusion.
    pub top_k: usize,
    /// Candidates requested from each sub-search before fusion.
    pub candidate_pool: usize,
    /// Per-source timeout for the vector/lexical sub-searches.
    pub source_timeout_ms: u64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            alpha: 0.7,
            top_k: 8,
            candidate_pool: 50,
            source_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConfidenceConfig {
    pub semantic_weight: f32,
    pub content_weight: f32,
    pub consistency_weight: f32,
    /// Composite below this routes the sub-request to web fallback.
    pub threshold: f32,
    /// Character count past which the length bonus saturates.
    pub length_saturation_chars: usize,
    /// Multiplier applied to the composite for Simple queries.
    pub simple_factor: f32,
    pub moderate_factor: f32,
    pub complex_factor: f32,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            semantic_weight: 0.4,
            content_weight: 0.3,
            consistency_weight: 0.3,
            threshold: 0.3,
            length_saturation_chars: 1_000,
            simple_factor: 1.0,
            moderate_factor: 0.85,
            complex_factor: 0.7,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BalancerConfig {
    /// Weight on `1 / avg_latency`.
    pub latency_weight: f64,
    /// Weight on `1 - error_rate`.
    pub error_weight: f64,
    /// Weight on `1 / (1 + in_flight)`.
    pub load_weight: f64,
    /// Half-life of the latency/error EMAs, in samples.
    pub ema_half_life_samples: u32,
    /// Consecutive failures before the circuit breaker opens.
    pub circuit_breaker_failures: u32,
    /// Interval between background health probes, seconds.
    pub probe_interval_secs: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            latency_weight: 0.4,
            error_weight: 0.4,
            load_weight: 0.2,
            ema_half_life_samples: 8,
            circuit_breaker_failures: 3,
            probe_interval_secs: 30,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusStrategy {
    WeightedVote,
    HighestConfidence,
    SimilarityCluster,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Distinct instances to fan a consensus request across.
    pub models: usize,
    /// Minimum successful responses; below this consensus falls back to
    /// single-response mode.
    pub min_responses: usize,
    /// Token-overlap similarity above which two answers are near-duplicates.
    pub similarity_threshold: f32,
    pub strategy: ConsensusStrategy,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            models: 3,
            min_responses: 2,
            similarity_threshold: 0.6,
            strategy: ConsensusStrategy::SimilarityCluster,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ReasoningConfig {
    /// Similarity above which two candidates fall into the same theme.
    /// Default is a starting point, not a validated optimum.
    pub theme_similarity: f32,
    /// Lexical overlap above which a candidate pair is checked for
    /// contradiction markers.
    pub contradiction_overlap: f32,
    pub max_themes: usize,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            theme_similarity: 0.55,
            contradiction_overlap: 0.4,
            max_themes: 6,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    DiversityFocused,
    DepthFocused,
    Balanced,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MemoryConfig {
    /// Turns retained verbatim per session; older turns are compacted into a
    /// single summary turn.
    pub retention_turns: usize,
    /// Token budget for conversation history in a generation call.
    pub context_token_budget: usize,
    /// Half-life of the recency decay, seconds.
    pub recency_half_life_secs: u64,
    pub strategy: ContextStrategy,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            retention_turns: 40,
            context_token_budget: 2_048,
            recency_half_life_secs: 3_600,
            strategy: ContextStrategy::Balanced,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub answer_ttl_secs: u64,
    pub capacity: usize,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            answer_ttl_secs: 900,
            capacity: 256,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Hard timeout for one generation call.
    pub per_call_ms: u64,
    /// End-to-end budget for one query; in-flight sub-requests are cancelled
    /// cooperatively when it elapses and partial results are kept.
    pub end_to_end_ms: u64,
    /// Bounded parallelism across sub-requests of one query.
    pub sub_request_concurrency: usize,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            per_call_ms: 30_000,
            end_to_end_ms: 60_000,
            sub_request_concurrency: 4,
        }
    }
}
