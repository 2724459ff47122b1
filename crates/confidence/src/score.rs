use crate::text::{cosine_similarity, term_frequencies};
use desk_protocol::config::ConfidenceConfig;
use desk_protocol::{ComplexityClass, ConfidenceReport, RetrievalCandidate, SubRequest};
use once_cell::sync::Lazy;

/// Hedging phrases that depress content-quality confidence.
static HEDGING_PHRASES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "i don't know",
        "i do not know",
        "i'm not sure",
        "i am not sure",
        "unclear",
        "may not",
        "might not",
        "cannot determine",
        "can't determine",
        "apologize",
        "no information",
        "not enough context",
        "i'm uncertain",
    ]
});

const HEDGE_PENALTY: f32 = 0.15;

/// Scores answers against their retrieved evidence. Pure: never makes
/// routing decisions, only reports.
pub struct ConfidenceScorer {
    cfg: ConfidenceConfig,
}

impl ConfidenceScorer {
    #[must_use]
    pub fn new(cfg: ConfidenceConfig) -> Self {
        Self { cfg }
    }

    #[must_use]
    pub fn config(&self) -> &ConfidenceConfig {
        &self.cfg
    }

    /// Score a draft answer for one sub-request.
    #[must_use]
    pub fn score(
        &self,
        sub_request: &SubRequest,
        candidates: &[RetrievalCandidate],
        draft: &str,
    ) -> ConfidenceReport {
        score(&self.cfg, sub_request.class, candidates, draft)
    }

    /// Candidate-set-only confidence, computed before any draft exists. Used
    /// upstream to decide RAG-vs-web routing.
    #[must_use]
    pub fn retrieval_confidence(&self, candidates: &[RetrievalCandidate]) -> f32 {
        retrieval_confidence(candidates)
    }
}

/// Compose the four sub-scores into a report. Weights come from
/// configuration; the composite is clamped into [0,1] no matter how extreme
/// the inputs are.
#[must_use]
pub fn score(
    cfg: &ConfidenceConfig,
    class: ComplexityClass,
    candidates: &[RetrievalCandidate],
    draft: &str,
) -> ConfidenceReport {
    let semantic = semantic_confidence(candidates, draft);
    let content_quality = content_quality(cfg, draft);
    let consistency = consistency_from_scores(
        &candidates.iter().map(|c| c.fused_score).collect::<Vec<_>>(),
    );
    let complexity_adjustment = match class {
        ComplexityClass::Simple => cfg.simple_factor,
        ComplexityClass::Moderate => cfg.moderate_factor,
        ComplexityClass::Complex => cfg.complex_factor,
    }
    .clamp(0.0, 1.0);

    recompose(cfg, semantic, content_quality, consistency, complexity_adjustment)
}

/// Build a report from already-computed sub-scores. Used directly when a
/// later stage (e.g. consensus) replaces one sub-score and the composite
/// must be derived again under the same weights.
#[must_use]
pub fn recompose(
    cfg: &ConfidenceConfig,
    semantic: f32,
    content_quality: f32,
    consistency: f32,
    complexity_adjustment: f32,
) -> ConfidenceReport {
    let semantic = semantic.clamp(0.0, 1.0);
    let content_quality = content_quality.clamp(0.0, 1.0);
    let consistency = consistency.clamp(0.0, 1.0);
    let complexity_adjustment = complexity_adjustment.clamp(0.0, 1.0);

    let weight_sum = cfg.semantic_weight + cfg.content_weight + cfg.consistency_weight;
    let blended = if weight_sum <= f32::EPSILON {
        0.0
    } else {
        (cfg.semantic_weight * semantic
            + cfg.content_weight * content_quality
            + cfg.consistency_weight * consistency)
            / weight_sum
    };

    ConfidenceReport {
        semantic,
        content_quality,
        consistency,
        complexity_adjustment,
        composite: (blended * complexity_adjustment).clamp(0.0, 1.0),
    }
}

/// Similarity between the draft and the union of candidate texts. Low when
/// the answer appears unrelated to the retrieved context.
fn semantic_confidence(candidates: &[RetrievalCandidate], draft: &str) -> f32 {
    if candidates.is_empty() || draft.trim().is_empty() {
        return 0.0;
    }
    let union = candidates
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    cosine_similarity(&term_frequencies(draft), &term_frequencies(&union))
}

/// Penalizes hedging language, rewards sufficiently detailed answers. The
/// length bonus saturates past the configured character threshold.
fn content_quality(cfg: &ConfidenceConfig, draft: &str) -> f32 {
    let trimmed = draft.trim();
    if trimmed.is_empty() {
        return 0.0;
    }

    let lowered = trimmed.to_lowercase();
    let hedges = HEDGING_PHRASES
        .iter()
        .filter(|phrase| lowered.contains(*phrase))
        .count();

    let saturation = cfg.length_saturation_chars.max(1) as f32;
    let length_bonus = (trimmed.len() as f32 / saturation).min(1.0);

    (0.5 + 0.5 * length_bonus - HEDGE_PENALTY * hedges as f32).clamp(0.0, 1.0)
}

/// Variance-based agreement across candidate scores. Defaults to a neutral
/// midpoint with fewer than two sources.
#[must_use]
pub fn consistency_from_scores(scores: &[f32]) -> f32 {
    if scores.len() < 2 {
        return 0.5;
    }
    let n = scores.len() as f32;
    let mean = scores.iter().sum::<f32>() / n;
    let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / n;
    // Scores live in [0,1], so variance tops out at 0.25.
    (1.0 - 4.0 * variance).clamp(0.0, 1.0)
}

/// Pre-draft confidence of a candidate set: mean fused score blended with
/// cross-candidate agreement.
#[must_use]
pub fn retrieval_confidence(candidates: &[RetrievalCandidate]) -> f32 {
    if candidates.is_empty() {
        return 0.0;
    }
    let mean = candidates.iter().map(|c| c.fused_score).sum::<f32>() / candidates.len() as f32;
    let agreement = consistency_from_scores(
        &candidates.iter().map(|c| c.fused_score).collect::<Vec<_>>(),
    );
    (0.7 * mean + 0.3 * agreement).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use desk_protocol::{ModelTier, QuestionType};
    use proptest::prelude::*;

    fn candidate(id: &str, text: &str, fused: f32) -> RetrievalCandidate {
        RetrievalCandidate {
            chunk_id: id.to_string(),
            doc_id: format!("doc-{id}"),
            text: text.to_string(),
            vector_score: Some(fused),
            lexical_score: Some(fused),
            fused_score: fused,
            recency_ms: 0,
        }
    }

    fn sub_request(class: ComplexityClass) -> SubRequest {
        SubRequest {
            id: "p#0".to_string(),
            parent: "p".to_string(),
            text: "How do I rotate the certificate?".to_string(),
            class,
            question_type: QuestionType::Factual,
            tier: ModelTier::Fast,
        }
    }

    #[test]
    fn grounded_answer_scores_higher_than_unrelated_answer() {
        let cfg = ConfidenceConfig::default();
        let scorer = ConfidenceScorer::new(cfg);
        let candidates = vec![candidate(
            "c1",
            "rotate the certificate with the renew command before expiry",
            0.8,
        )];
        let grounded = scorer.score(
            &sub_request(ComplexityClass::Simple),
            &candidates,
            "Run the renew command to rotate the certificate before expiry.",
        );
        let unrelated = scorer.score(
            &sub_request(ComplexityClass::Simple),
            &candidates,
            "Bananas ripen faster in paper bags.",
        );
        assert!(grounded.composite > unrelated.composite);
        assert!(grounded.semantic > unrelated.semantic);
    }

    #[test]
    fn hedging_depresses_content_quality() {
        let cfg = ConfidenceConfig::default();
        let confident = content_quality(&cfg, "Set the TTL to 300 seconds in the zone file.");
        let hedged = content_quality(
            &cfg,
            "I'm not sure, and it's unclear whether this may not work. I apologize.",
        );
        assert!(confident > hedged);
    }

    #[test]
    fn single_source_consistency_is_neutral() {
        assert_eq!(consistency_from_scores(&[0.9]), 0.5);
        assert_eq!(consistency_from_scores(&[]), 0.5);
    }

    #[test]
    fn agreeing_sources_beat_disagreeing_sources() {
        let agree = consistency_from_scores(&[0.8, 0.8, 0.8]);
        let disagree = consistency_from_scores(&[0.1, 0.9, 0.1]);
        assert!(agree > disagree);
    }

    #[test]
    fn complex_queries_are_trusted_less_than_simple_ones() {
        let cfg = ConfidenceConfig::default();
        let candidates = vec![candidate("c1", "relevant context about the issue here", 0.9)];
        let draft = "relevant context about the issue here";
        let simple = score(&cfg, ComplexityClass::Simple, &candidates, draft);
        let complex = score(&cfg, ComplexityClass::Complex, &candidates, draft);
        assert!(simple.composite > complex.composite);
    }

    #[test]
    fn empty_candidates_give_zero_retrieval_confidence() {
        assert_eq!(retrieval_confidence(&[]), 0.0);
    }

    proptest! {
        #[test]
        fn composite_is_always_clamped(
            fused in proptest::collection::vec(-10.0f32..10.0, 0..6),
            len in 0usize..5_000,
        ) {
            let cfg = ConfidenceConfig::default();
            let candidates: Vec<RetrievalCandidate> = fused
                .iter()
                .enumerate()
                .map(|(i, f)| candidate(&format!("c{i}"), "evidence text here", *f))
                .collect();
            let draft = "x".repeat(len);
            let report = score(&cfg, ComplexityClass::Moderate, &candidates, &draft);
            prop_assert!((0.0..=1.0).contains(&report.composite));
            prop_assert!((0.0..=1.0).contains(&report.semantic));
            prop_assert!((0.0..=1.0).contains(&report.content_quality));
            prop_assert!((0.0..=1.0).contains(&report.consistency));
        }
    }
}
