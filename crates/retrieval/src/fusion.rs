use desk_protocol::config::FusionConfig;
use desk_protocol::RetrievalCandidate;
use std::cmp::Ordering;
use std::collections::HashMap;

/// A raw hit from one retrieval source, before fusion.
#[derive(Debug, Clone)]
pub struct SourceHit {
    pub chunk_id: String,
    pub doc_id: String,
    pub text: String,
    pub score: f32,
    pub recency_ms: u64,
}

/// Weighted-sum fusion of two normalized scores. Clamped to [0,1] and
/// monotonically non-decreasing in both components.
#[must_use]
pub fn weighted_sum(alpha: f32, vector: f32, lexical: f32) -> f32 {
    let alpha = alpha.clamp(0.0, 1.0);
    (alpha * vector.clamp(0.0, 1.0) + (1.0 - alpha) * lexical.clamp(0.0, 1.0)).clamp(0.0, 1.0)
}

/// Min-max normalization into [0,1]. A constant list maps to all-ones so a
/// single-source ranking still carries signal.
#[must_use]
pub fn normalize_scores(scores: &[f32]) -> Vec<f32> {
    let finite: Vec<f32> = scores.iter().map(|s| if s.is_finite() { *s } else { 0.0 }).collect();
    let Some(&max) = finite.iter().max_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal)) else {
        return Vec::new();
    };
    let &min = finite
        .iter()
        .min_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal))
        .expect("non-empty");
    let range = max - min;
    if range <= f32::EPSILON {
        return vec![1.0; finite.len()];
    }
    finite.iter().map(|s| (s - min) / range).collect()
}

struct PartialCandidate {
    doc_id: String,
    text: String,
    vector_score: Option<f32>,
    lexical_score: Option<f32>,
    recency_ms: u64,
}

/// Merge vector and lexical hit lists into a fused, ranked candidate list.
///
/// Candidates present in only one sub-search get zero for the missing
/// component, not a penalty beyond that. Ties break by lexical score, then
/// document recency, then chunk id for determinism. Output is capped at
/// `top_k`, sorted descending by fused score.
#[must_use]
pub fn fuse(
    cfg: &FusionConfig,
    vector_hits: Vec<SourceHit>,
    lexical_hits: Vec<SourceHit>,
) -> Vec<RetrievalCandidate> {
    let vector_norm = normalize_scores(&vector_hits.iter().map(|h| h.score).collect::<Vec<_>>());
    let lexical_norm = normalize_scores(&lexical_hits.iter().map(|h| h.score).collect::<Vec<_>>());

    let mut merged: HashMap<String, PartialCandidate> = HashMap::new();

    for (hit, score) in vector_hits.into_iter().zip(vector_norm) {
        merged
            .entry(hit.chunk_id)
            .or_insert_with(|| PartialCandidate {
                doc_id: hit.doc_id,
                text: hit.text,
                vector_score: None,
                lexical_score: None,
                recency_ms: hit.recency_ms,
            })
            .vector_score = Some(score);
    }

    for (hit, score) in lexical_hits.into_iter().zip(lexical_norm) {
        let entry = merged
            .entry(hit.chunk_id)
            .or_insert_with(|| PartialCandidate {
                doc_id: hit.doc_id,
                text: hit.text,
                vector_score: None,
                lexical_score: None,
                recency_ms: hit.recency_ms,
            });
        entry.lexical_score = Some(score);
        entry.recency_ms = entry.recency_ms.max(hit.recency_ms);
    }

    let mut candidates: Vec<RetrievalCandidate> = merged
        .into_iter()
        .map(|(chunk_id, partial)| RetrievalCandidate {
            fused_score: weighted_sum(
                cfg.alpha,
                partial.vector_score.unwrap_or(0.0),
                partial.lexical_score.unwrap_or(0.0),
            ),
            chunk_id,
            doc_id: partial.doc_id,
            text: partial.text,
            vector_score: partial.vector_score,
            lexical_score: partial.lexical_score,
            recency_ms: partial.recency_ms,
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                b.lexical_score
                    .unwrap_or(0.0)
                    .partial_cmp(&a.lexical_score.unwrap_or(0.0))
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| b.recency_ms.cmp(&a.recency_ms))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    candidates.truncate(cfg.top_k);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn hit(id: &str, score: f32) -> SourceHit {
        SourceHit {
            chunk_id: id.to_string(),
            doc_id: format!("doc-{id}"),
            text: format!("text {id}"),
            score,
            recency_ms: 0,
        }
    }

    #[test]
    fn overlapping_chunks_outrank_single_source_chunks() {
        let cfg = FusionConfig::default();
        let fused = fuse(
            &cfg,
            vec![hit("a", 0.9), hit("b", 0.5)],
            vec![hit("a", 0.8), hit("c", 0.4)],
        );
        assert_eq!(fused[0].chunk_id, "a");
        assert!(fused[0].vector_score.is_some());
        assert!(fused[0].lexical_score.is_some());
    }

    #[test]
    fn missing_component_contributes_zero() {
        let cfg = FusionConfig {
            alpha: 0.7,
            ..FusionConfig::default()
        };
        let fused = fuse(&cfg, vec![hit("v", 1.0)], Vec::new());
        assert_eq!(fused.len(), 1);
        assert!(fused[0].lexical_score.is_none());
        // alpha * 1.0 + (1 - alpha) * 0.0
        assert!((fused[0].fused_score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn ties_break_by_lexical_then_recency() {
        let cfg = FusionConfig {
            alpha: 0.0,
            ..FusionConfig::default()
        };
        let mut newer = hit("newer", 1.0);
        newer.recency_ms = 2_000;
        let mut older = hit("older", 1.0);
        older.recency_ms = 1_000;
        let fused = fuse(&cfg, Vec::new(), vec![older, newer]);
        assert_eq!(fused[0].chunk_id, "newer");
    }

    #[test]
    fn output_is_capped_at_top_k() {
        let cfg = FusionConfig {
            top_k: 2,
            ..FusionConfig::default()
        };
        let hits: Vec<SourceHit> = (0..10).map(|i| hit(&format!("c{i}"), i as f32)).collect();
        assert_eq!(fuse(&cfg, hits, Vec::new()).len(), 2);
    }

    proptest! {
        #[test]
        fn fused_score_is_bounded(alpha in 0.0f32..=1.0, v in 0.0f32..=1.0, l in 0.0f32..=1.0) {
            let s = weighted_sum(alpha, v, l);
            prop_assert!((0.0..=1.0).contains(&s));
        }

        #[test]
        fn fused_score_is_monotone_in_each_component(
            alpha in 0.0f32..=1.0,
            v in 0.0f32..=1.0,
            l in 0.0f32..=1.0,
            dv in 0.0f32..=0.5,
            dl in 0.0f32..=0.5,
        ) {
            let base = weighted_sum(alpha, v, l);
            prop_assert!(weighted_sum(alpha, (v + dv).min(1.0), l) >= base - 1e-6);
            prop_assert!(weighted_sum(alpha, v, (l + dl).min(1.0)) >= base - 1e-6);
        }
    }
}
