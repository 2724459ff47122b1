use desk_confidence::recompose;
use desk_protocol::config::ConfidenceConfig;
use desk_protocol::{Citation, ComplexityClass, ConfidenceReport, FinalAnswer, SubResponse};
use std::collections::HashSet;

/// Merge sub-responses into the final answer.
///
/// Citations are deduplicated by chunk id across sub-responses. Complex
/// queries pass the text through a synthesis result when one is available;
/// Simple/Moderate answers concatenate. The aggregate confidence is the
/// minimum of the constituents when any sub-response used web fallback, so
/// one weak sub-answer cannot be masked by strong siblings; otherwise it is
/// a confidence-weighted average.
#[must_use]
pub fn assemble(
    cfg: &ConfidenceConfig,
    class: ComplexityClass,
    sub_responses: &[SubResponse],
    synthesized: Option<String>,
    mut notices: Vec<String>,
) -> FinalAnswer {
    let citations = dedupe_citations(sub_responses);
    let any_web = sub_responses.iter().any(|r| r.via_web_fallback);
    let any_failed = sub_responses
        .iter()
        .any(|r| r.text.trim().is_empty() || r.confidence.composite == 0.0);

    let text = match (class, synthesized) {
        (ComplexityClass::Complex, Some(synthesis)) => synthesis,
        (_, _) => {
            let parts: Vec<&str> = sub_responses
                .iter()
                .map(|r| r.text.trim())
                .filter(|t| !t.is_empty())
                .collect();
            parts.join("\n\n")
        }
    };

    let confidence = aggregate_confidence(cfg, sub_responses, any_web);

    if text.trim().is_empty() {
        notices.push("No part of this question could be answered.".to_string());
    }

    FinalAnswer {
        degraded: any_web || any_failed || text.trim().is_empty(),
        text,
        citations,
        confidence,
        notices,
    }
}

/// Deduplicate citations by chunk id, keeping first-seen order across
/// sub-responses.
#[must_use]
pub fn dedupe_citations(sub_responses: &[SubResponse]) -> Vec<Citation> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut out = Vec::new();
    for response in sub_responses {
        for citation in &response.sources {
            if seen.insert(citation.chunk_id.as_str()) {
                out.push(citation.clone());
            }
        }
    }
    out
}

fn aggregate_confidence(
    cfg: &ConfidenceConfig,
    sub_responses: &[SubResponse],
    any_web: bool,
) -> ConfidenceReport {
    let reports: Vec<&ConfidenceReport> = sub_responses.iter().map(|r| &r.confidence).collect();
    if reports.is_empty() {
        return ConfidenceReport::zero();
    }

    if any_web {
        // Minimum rule: the weakest constituent dominates.
        return **reports
            .iter()
            .min_by(|a, b| {
                a.composite
                    .partial_cmp(&b.composite)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("non-empty reports");
    }

    let total_weight: f32 = reports.iter().map(|r| r.composite).sum();
    if total_weight <= f32::EPSILON {
        return ConfidenceReport::zero();
    }

    let weighted = |f: fn(&ConfidenceReport) -> f32| {
        reports.iter().map(|r| r.composite * f(r)).sum::<f32>() / total_weight
    };
    recompose(
        cfg,
        weighted(|r| r.semantic),
        weighted(|r| r.content_quality),
        weighted(|r| r.consistency),
        weighted(|r| r.complexity_adjustment),
    )
}
