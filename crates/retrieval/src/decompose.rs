use crate::classifier::question_type;
use desk_protocol::config::DecomposeConfig;
use desk_protocol::{ComplexityClass, ModelTier, Query, QuestionType, SubRequest};
use once_cell::sync::Lazy;
use regex::Regex;

static SENTENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^.!?]+[.!?]*").expect("valid sentence regex"));

/// `compare X and Y` / `difference between X and Y` entity extraction.
static COMPARISON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:compare|between)\s+(.+?)\s+(?:and|with|to)\s+(.+?)(?:[.?!,]|$)")
        .expect("valid comparison regex")
});

/// Secondary clause separators inside one sentence.
static CLAUSE_SPLIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r";\s+|,\s+and also\s+|\s+and also\s+").expect("valid clause regex"));

pub struct Decomposer {
    cfg: DecomposeConfig,
}

impl Decomposer {
    #[must_use]
    pub fn new(cfg: DecomposeConfig) -> Self {
        Self { cfg }
    }

    /// Split a query into independently answerable sub-requests.
    ///
    /// Simple queries map to exactly one sub-request carrying the original
    /// text. Moderate queries yield 2-3, Complex up to the configured
    /// maximum. When splitting would exceed the maximum, trailing clauses are
    /// merged into the last sub-request rather than dropped.
    #[must_use]
    pub fn decompose(&self, query: &Query, class: ComplexityClass) -> Vec<SubRequest> {
        let parent = parent_id(&query.text);
        let text = query.text.trim();

        let limit = match class {
            ComplexityClass::Simple => {
                return vec![self.sub_request(&parent, 0, text.to_string(), class)];
            }
            ComplexityClass::Moderate => 3,
            ComplexityClass::Complex => self.cfg.max_sub_requests.max(1),
        };

        let segments = self.split(text, limit);
        log::debug!(
            "Decomposed query into {} sub-requests (class {:?})",
            segments.len(),
            class
        );

        segments
            .into_iter()
            .enumerate()
            .map(|(i, segment)| self.sub_request(&parent, i, segment, class))
            .collect()
    }

    fn sub_request(
        &self,
        parent: &str,
        index: usize,
        text: String,
        class: ComplexityClass,
    ) -> SubRequest {
        let qtype = question_type(&text);
        SubRequest {
            id: format!("{parent}#{index}"),
            parent: parent.to_string(),
            tier: suggested_tier(class, qtype),
            text,
            class,
            question_type: qtype,
        }
    }

    fn split(&self, text: &str, limit: usize) -> Vec<String> {
        // Comparative queries split into one sub-request per compared entity
        // plus the comparison itself, which is only resolved at synthesis
        // time from the entity sub-answers.
        if let Some(caps) = COMPARISON.captures(text) {
            let left = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            let right = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
            if !left.is_empty() && !right.is_empty() {
                let mut out = vec![
                    format!("What are the key characteristics of {left}?"),
                    format!("What are the key characteristics of {right}?"),
                    text.to_string(),
                ];
                out.truncate(limit.max(1));
                return out;
            }
        }

        let mut segments: Vec<String> = Vec::new();
        for sentence in SENTENCES.find_iter(text) {
            let sentence = sentence.as_str().trim();
            if sentence.is_empty() {
                continue;
            }
            for clause in CLAUSE_SPLIT.split(sentence) {
                let clause = clause.trim().trim_matches(',').trim();
                if !clause.is_empty() {
                    segments.push(clause.to_string());
                }
            }
        }

        if segments.is_empty() {
            segments.push(text.to_string());
        }

        // Overflow recovery: merge the lowest-priority (trailing) clauses
        // into the nearest kept sub-request.
        if segments.len() > limit {
            let merged = segments.split_off(limit - 1).join("; ");
            segments.push(merged);
        }

        segments
    }
}

fn parent_id(text: &str) -> String {
    blake3::hash(text.trim().as_bytes()).to_hex()[..12].to_string()
}

/// Tier suggestion per sub-request. Exhaustive over `QuestionType` within
/// each complexity arm.
#[must_use]
pub fn suggested_tier(class: ComplexityClass, qtype: QuestionType) -> ModelTier {
    match class {
        ComplexityClass::Simple => ModelTier::Fast,
        ComplexityClass::Moderate => match qtype {
            QuestionType::Simple | QuestionType::Factual => ModelTier::Fast,
            QuestionType::Analytical | QuestionType::Comparative => ModelTier::Balanced,
            QuestionType::Synthesis | QuestionType::Creative | QuestionType::ChainOfThought => {
                ModelTier::Deep
            }
        },
        ComplexityClass::Complex => match qtype {
            QuestionType::Simple | QuestionType::Factual => ModelTier::Balanced,
            QuestionType::Analytical | QuestionType::Comparative => ModelTier::Balanced,
            QuestionType::Synthesis | QuestionType::Creative | QuestionType::ChainOfThought => {
                ModelTier::Deep
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn query(text: &str) -> Query {
        Query {
            text: text.to_string(),
            session_id: "s1".to_string(),
            hints: Default::default(),
        }
    }

    fn decomposer() -> Decomposer {
        Decomposer::new(DecomposeConfig::default())
    }

    #[test]
    fn simple_query_yields_one_sub_request_with_original_text() {
        let subs = decomposer().decompose(&query("What is X?"), ComplexityClass::Simple);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].text, "What is X?");
        assert_eq!(subs[0].tier, ModelTier::Fast);
    }

    #[test]
    fn comparison_yields_entity_sub_requests_plus_comparison() {
        let subs = decomposer().decompose(
            &query("Compare A and B. What are the tradeoffs?"),
            ComplexityClass::Moderate,
        );
        assert_eq!(subs.len(), 3);
        assert!(subs[0].text.contains('A'));
        assert!(subs[1].text.contains('B'));
        assert!(subs[2].text.contains("tradeoffs"));
    }

    #[test]
    fn overflow_merges_trailing_clauses_instead_of_dropping() {
        let text = "Why is the cache slow? How do I size the pool? What about timeouts? \
                    Should I enable retries? Is the index stale? Can I shard the store?";
        let subs = decomposer().decompose(&query(text), ComplexityClass::Complex);
        assert_eq!(subs.len(), 5);
        // The merged tail keeps all remaining clauses.
        assert!(subs[4].text.contains("stale"));
        assert!(subs[4].text.contains("shard"));
    }

    #[test]
    fn sub_request_ids_share_the_parent() {
        let subs = decomposer().decompose(
            &query("Why does it fail? How do I fix it?"),
            ComplexityClass::Moderate,
        );
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].parent, subs[1].parent);
        assert_ne!(subs[0].id, subs[1].id);
    }

    #[test]
    fn complex_factual_never_routes_to_fast() {
        assert_eq!(
            suggested_tier(ComplexityClass::Complex, QuestionType::Factual),
            ModelTier::Balanced
        );
        assert_eq!(
            suggested_tier(ComplexityClass::Complex, QuestionType::Synthesis),
            ModelTier::Deep
        );
    }
}
