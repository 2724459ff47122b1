use desk_confidence::token_overlap;
use desk_protocol::config::ReasoningConfig;
use desk_protocol::{RetrievalCandidate, SubResponse};
use once_cell::sync::Lazy;

/// States of one reasoning session. Progression is strictly forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningState {
    Decomposed,
    Retrieving,
    Drafting,
    Synthesizing,
    Consensus,
    Assembled,
}

/// Per-step confidence record. The terminal `Assembled` confidence is
/// expected not to fall below the single-pass baseline; violations are
/// logged as quality regressions, not treated as hard failures.
pub struct ReasoningTrace {
    steps: Vec<(ReasoningState, f32)>,
}

impl ReasoningTrace {
    #[must_use]
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn record(&mut self, state: ReasoningState, confidence: f32) {
        log::debug!("Reasoning step {state:?} at confidence {confidence:.3}");
        self.steps.push((state, confidence));
    }

    /// The first drafting confidence, i.e. the single-pass baseline.
    #[must_use]
    pub fn baseline(&self) -> Option<f32> {
        self.steps
            .iter()
            .find(|(state, _)| *state == ReasoningState::Drafting)
            .map(|(_, c)| *c)
    }

    /// Check the terminal confidence against the baseline, logging a quality
    /// regression when it dropped.
    pub fn finish(&mut self, final_confidence: f32) {
        if let Some(baseline) = self.baseline() {
            if final_confidence < baseline {
                log::warn!(
                    "Quality regression: assembled confidence {final_confidence:.3} \
                     below single-pass baseline {baseline:.3}"
                );
            }
        }
        self.record(ReasoningState::Assembled, final_confidence);
    }

    #[must_use]
    pub fn steps(&self) -> &[(ReasoningState, f32)] {
        &self.steps
    }
}

impl Default for ReasoningTrace {
    fn default() -> Self {
        Self::new()
    }
}

/// A group of evidence candidates covering the same topic.
#[derive(Debug)]
pub struct Theme {
    pub members: Vec<usize>,
}

/// Greedy single-link clustering of candidates by text similarity. Bounded
/// at `max_themes`; later candidates that fit no cluster are folded into the
/// closest existing one.
#[must_use]
pub fn cluster_themes(candidates: &[RetrievalCandidate], cfg: &ReasoningConfig) -> Vec<Theme> {
    let mut themes: Vec<Theme> = Vec::new();
    for (i, candidate) in candidates.iter().enumerate() {
        let mut best: Option<(usize, f32)> = None;
        for (t, theme) in themes.iter().enumerate() {
            let seed = theme.members[0];
            let sim = token_overlap(&candidate.text, &candidates[seed].text);
            if best.is_none_or(|(_, s)| sim > s) {
                best = Some((t, sim));
            }
        }

        match best {
            Some((t, sim)) if sim >= cfg.theme_similarity => themes[t].members.push(i),
            Some((t, _)) if themes.len() >= cfg.max_themes.max(1) => themes[t].members.push(i),
            _ => themes.push(Theme { members: vec![i] }),
        }
    }
    themes
}

static NEGATION_MARKERS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "not ", "never", "no longer", "disabled", "deprecated", "instead of", "rather than",
        "don't", "do not", "cannot", "avoid",
    ]
});

fn has_negation(text: &str) -> bool {
    let lowered = text.to_lowercase();
    NEGATION_MARKERS.iter().any(|m| lowered.contains(m))
}

/// Pairwise contradiction detection inside one theme: two candidates that
/// share most of their vocabulary but differ in negation markers likely
/// state opposite facts.
#[must_use]
pub fn detect_contradictions(
    candidates: &[RetrievalCandidate],
    theme: &Theme,
    cfg: &ReasoningConfig,
) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for (pos, &a) in theme.members.iter().enumerate() {
        for &b in &theme.members[pos + 1..] {
            let overlap = token_overlap(&candidates[a].text, &candidates[b].text);
            if overlap >= cfg.contradiction_overlap
                && has_negation(&candidates[a].text) != has_negation(&candidates[b].text)
            {
                pairs.push((a, b));
            }
        }
    }
    pairs
}

/// Prompt for the cross-source synthesis pass over a complex query: one
/// paragraph per theme, contradictions called out, then an overall summary.
#[must_use]
pub fn build_synthesis_prompt(
    question: &str,
    sub_responses: &[SubResponse],
    candidates: &[RetrievalCandidate],
    themes: &[Theme],
    contradictions: &[(usize, usize)],
) -> String {
    let mut sections = vec![format!(
        "Synthesize one coherent answer to this question from the partial \
         answers and evidence themes below.\n\nQuestion: {question}"
    )];

    let answers = sub_responses
        .iter()
        .filter(|r| !r.text.trim().is_empty())
        .enumerate()
        .map(|(i, r)| format!("Partial answer {}: {}", i + 1, r.text.trim()))
        .collect::<Vec<_>>()
        .join("\n");
    if !answers.is_empty() {
        sections.push(answers);
    }

    for (t, theme) in themes.iter().enumerate() {
        let body = theme
            .members
            .iter()
            .map(|&i| format!("- {}", candidates[i].text.trim()))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("Theme {}:\n{body}", t + 1));
    }

    if !contradictions.is_empty() {
        let body = contradictions
            .iter()
            .map(|&(a, b)| {
                format!(
                    "- \"{}\" vs \"{}\"",
                    candidates[a].text.trim(),
                    candidates[b].text.trim()
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!(
            "These sources appear to conflict; resolve or flag the conflict \
             explicitly:\n{body}"
        ));
    }

    sections.push(
        "Write one synthesis paragraph per theme, then a short overall summary."
            .to_string(),
    );
    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(text: &str) -> RetrievalCandidate {
        RetrievalCandidate {
            chunk_id: text.chars().take(8).collect(),
            doc_id: "d".to_string(),
            text: text.to_string(),
            vector_score: None,
            lexical_score: None,
            fused_score: 0.5,
            recency_ms: 0,
        }
    }

    fn cfg() -> ReasoningConfig {
        ReasoningConfig::default()
    }

    #[test]
    fn similar_candidates_share_a_theme() {
        let candidates = vec![
            candidate("rotate the tls certificate before expiry each month"),
            candidate("the tls certificate must rotate before expiry monthly"),
            candidate("the postgres connection pool exhausts under load"),
        ];
        let themes = cluster_themes(&candidates, &cfg());
        assert_eq!(themes.len(), 2);
        assert_eq!(themes[0].members, vec![0, 1]);
    }

    #[test]
    fn contradiction_needs_overlap_and_negation_difference() {
        let candidates = vec![
            candidate("enable the compression setting for backups compression helps"),
            candidate("do not enable the compression setting for backups compression hurts"),
            candidate("the mail queue drains every five minutes"),
        ];
        let theme = Theme {
            members: vec![0, 1, 2],
        };
        let pairs = detect_contradictions(&candidates, &theme, &cfg());
        assert_eq!(pairs, vec![(0, 1)]);
    }

    #[test]
    fn trace_reports_baseline_and_regression() {
        let mut trace = ReasoningTrace::new();
        trace.record(ReasoningState::Decomposed, 0.0);
        trace.record(ReasoningState::Drafting, 0.6);
        trace.record(ReasoningState::Synthesizing, 0.7);
        assert_eq!(trace.baseline(), Some(0.6));
        trace.finish(0.5);
        assert_eq!(
            trace.steps().last().map(|(s, _)| *s),
            Some(ReasoningState::Assembled)
        );
    }

    #[test]
    fn synthesis_prompt_flags_conflicts() {
        let candidates = vec![
            candidate("use mode A not mode B"),
            candidate("use mode A and mode B together"),
        ];
        let themes = vec![Theme {
            members: vec![0, 1],
        }];
        let prompt = build_synthesis_prompt("which mode?", &[], &candidates, &themes, &[(0, 1)]);
        assert!(prompt.contains("conflict"));
        assert!(prompt.contains("Theme 1"));
    }
}
