use desk_protocol::config::ClassifierConfig;
use desk_protocol::{ComplexityClass, QuestionType};
use lru::LruCache;
use once_cell::sync::Lazy;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Cues that push a query toward Moderate: it asks for a relation between
/// things rather than a single fact.
static MODERATE_CUES: &[&str] = &[
    "compare",
    "difference",
    "tradeoff",
    "trade-off",
    "pros and cons",
    "versus",
    " vs ",
    "relate",
    "impact of",
    "better than",
];

/// Cues that push a query toward Complex: multi-step or open-ended work.
static COMPLEX_CUES: &[&str] = &[
    "step by step",
    "walk through",
    "walk me through",
    "end to end",
    "architecture",
    "root cause",
    "troubleshoot",
    "migrate",
    "design a",
    "in depth",
];

/// Conditional/logical connectors used for clause counting.
static CONNECTORS: &[&str] = &[
    " and ", " or ", " but ", " if ", " unless ", " whereas ", " while ", " then ",
];

static SENTENCE_SPLIT: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"[.!?]+\s+|[.!?]+$").expect("valid sentence regex"));

fn count_matches(haystack: &str, needles: &[&str]) -> usize {
    needles.iter().filter(|n| haystack.contains(*n)).count()
}

fn sentence_count(text: &str) -> usize {
    SENTENCE_SPLIT
        .split(text)
        .filter(|s| !s.trim().is_empty())
        .count()
        .max(1)
}

/// Classify a query into a complexity tier. Pure and deterministic given
/// fixed thresholds.
#[must_use]
pub fn classify(text: &str, cfg: &ClassifierConfig) -> ComplexityClass {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return ComplexityClass::Simple;
    }

    let lowered = trimmed.to_lowercase();
    let tokens = trimmed.split_whitespace().count();
    let questions = trimmed.matches('?').count();
    let sentences = sentence_count(trimmed);
    let connectors = count_matches(&lowered, CONNECTORS);
    let moderate_cues = count_matches(&lowered, MODERATE_CUES);
    let complex_cues = count_matches(&lowered, COMPLEX_CUES);

    if tokens >= cfg.complex_min_tokens
        || questions >= 3
        || complex_cues >= 2
        || (complex_cues >= 1 && (questions >= 2 || moderate_cues >= 1))
    {
        return ComplexityClass::Complex;
    }

    if questions >= 2
        || moderate_cues >= 1
        || complex_cues >= 1
        || sentences >= 3
        || (tokens > cfg.simple_max_tokens && connectors >= 2)
    {
        return ComplexityClass::Moderate;
    }

    if tokens > cfg.simple_max_tokens {
        return ComplexityClass::Moderate;
    }

    ComplexityClass::Simple
}

/// Assign a question type from keyword cues. First match wins; the priority
/// order puts the most specific intents first.
#[must_use]
pub fn question_type(text: &str) -> QuestionType {
    let lowered = text.trim().to_lowercase();
    if lowered.is_empty() {
        return QuestionType::Simple;
    }

    let chain = ["step by step", "walk me through", "walk through", "show your reasoning"];
    if chain.iter().any(|c| lowered.contains(c)) {
        return QuestionType::ChainOfThought;
    }

    let comparative = [
        "compare",
        " vs ",
        "versus",
        "difference between",
        "tradeoff",
        "trade-off",
        "pros and cons",
        "better than",
    ];
    if comparative.iter().any(|c| lowered.contains(c)) {
        return QuestionType::Comparative;
    }

    let synthesis = ["summarize", "summarise", "synthesize", "combine", "overall picture", "across all"];
    if synthesis.iter().any(|c| lowered.contains(c)) {
        return QuestionType::Synthesis;
    }

    let creative = ["write a", "draft a", "compose", "brainstorm", "come up with"];
    if creative.iter().any(|c| lowered.contains(c)) {
        return QuestionType::Creative;
    }

    let analytical = ["why", "analyze", "analyse", "root cause", "diagnose", "investigate", "explain"];
    if analytical.iter().any(|c| lowered.contains(c)) {
        return QuestionType::Analytical;
    }

    let factual = [
        "what is", "what are", "when ", "where ", "who ", "how many", "how much", "which ", "define",
    ];
    if factual.iter().any(|c| lowered.contains(c)) {
        return QuestionType::Factual;
    }

    QuestionType::Simple
}

struct CachedClass {
    class: ComplexityClass,
    question_type: QuestionType,
    created: Instant,
}

/// Classifier with a content-hash keyed cache. Classification is cheap but
/// hot; decomposition is never cached.
pub struct QueryClassifier {
    cfg: ClassifierConfig,
    cache: Mutex<LruCache<[u8; 32], CachedClass>>,
}

impl QueryClassifier {
    #[must_use]
    pub fn new(cfg: ClassifierConfig) -> Self {
        let capacity = NonZeroUsize::new(cfg.cache_capacity.max(1)).expect("non-zero capacity");
        Self {
            cfg,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Classify with cache. The key is a blake3 hash of the raw text; entries
    /// expire after the configured TTL.
    pub fn classify_cached(&self, text: &str) -> (ComplexityClass, QuestionType) {
        let key = *blake3::hash(text.as_bytes()).as_bytes();
        let ttl = Duration::from_secs(self.cfg.cache_ttl_secs);

        {
            let mut cache = self.cache.lock().expect("classifier cache poisoned");
            if let Some(entry) = cache.get(&key) {
                if entry.created.elapsed() <= ttl {
                    return (entry.class, entry.question_type);
                }
                cache.pop(&key);
            }
        }

        let class = classify(text, &self.cfg);
        let qtype = question_type(text);
        let mut cache = self.cache.lock().expect("classifier cache poisoned");
        cache.put(
            key,
            CachedClass {
                class,
                question_type: qtype,
                created: Instant::now(),
            },
        );
        (class, qtype)
    }

    #[must_use]
    pub fn config(&self) -> &ClassifierConfig {
        &self.cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ClassifierConfig {
        ClassifierConfig::default()
    }

    #[test]
    fn short_single_question_is_simple() {
        assert_eq!(
            classify("What is the default retry limit?", &cfg()),
            ComplexityClass::Simple
        );
        assert_eq!(classify("What is X?", &cfg()), ComplexityClass::Simple);
    }

    #[test]
    fn comparison_is_moderate() {
        assert_eq!(
            classify("Compare A and B. What are the tradeoffs?", &cfg()),
            ComplexityClass::Moderate
        );
    }

    #[test]
    fn multi_question_walkthrough_is_complex() {
        let q = "Walk me through the deployment step by step. Why does stage two fail? \
                 What should I check first? How do I roll back?";
        assert_eq!(classify(q, &cfg()), ComplexityClass::Complex);
    }

    #[test]
    fn long_queries_are_never_simple() {
        let q = "words ".repeat(60);
        assert_eq!(classify(&q, &cfg()), ComplexityClass::Complex);
    }

    #[test]
    fn question_types_match_cues() {
        assert_eq!(question_type("What is DNS?"), QuestionType::Factual);
        assert_eq!(
            question_type("Compare RAID 1 and RAID 5"),
            QuestionType::Comparative
        );
        assert_eq!(
            question_type("Why does the service crash under load?"),
            QuestionType::Analytical
        );
        assert_eq!(
            question_type("Walk me through certificate renewal"),
            QuestionType::ChainOfThought
        );
        assert_eq!(
            question_type("Summarize the incident reports"),
            QuestionType::Synthesis
        );
        assert_eq!(question_type("Restart the gateway"), QuestionType::Simple);
    }

    #[test]
    fn classification_is_deterministic() {
        let q = "Compare A and B. What are the tradeoffs?";
        let first = classify(q, &cfg());
        for _ in 0..10 {
            assert_eq!(classify(q, &cfg()), first);
        }
    }

    #[test]
    fn cache_returns_same_result() {
        let classifier = QueryClassifier::new(cfg());
        let a = classifier.classify_cached("What is X?");
        let b = classifier.classify_cached("What is X?");
        assert_eq!(a, b);
        assert_eq!(a.0, ComplexityClass::Simple);
    }
}
