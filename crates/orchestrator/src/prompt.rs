use desk_protocol::{ConversationTurn, RetrievalCandidate, Role};

const PREAMBLE: &str = "You are a technical support assistant. Answer using the \
reference material below and cite sources as [n]. If the material does not \
cover the question, say so explicitly.";

/// Rough token estimate: 4 characters per token. The backend contract does
/// not expose a tokenizer, so budgets are enforced on this approximation.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Assemble a generation prompt within the context-window budget. Evidence
/// gets 60% of the budget and history the rest; both are packed in rank
/// order and trimmed when the budget runs out.
#[must_use]
pub fn build_prompt(
    turns: &[ConversationTurn],
    candidates: &[RetrievalCandidate],
    question: &str,
    budget_tokens: usize,
) -> String {
    let evidence_budget = budget_tokens * 6 / 10;
    let history_budget = budget_tokens.saturating_sub(evidence_budget);

    let mut sections: Vec<String> = vec![PREAMBLE.to_string()];

    if !turns.is_empty() {
        let mut spent = 0usize;
        let mut lines = Vec::new();
        for turn in turns {
            let cost = estimate_tokens(&turn.content);
            if spent + cost > history_budget {
                break;
            }
            spent += cost;
            let role = match turn.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System => "Context",
            };
            lines.push(format!("{role}: {}", turn.content));
        }
        if !lines.is_empty() {
            sections.push(format!("Conversation so far:\n{}", lines.join("\n")));
        }
    }

    if !candidates.is_empty() {
        let mut spent = 0usize;
        let mut lines = Vec::new();
        for (i, candidate) in candidates.iter().enumerate() {
            let cost = estimate_tokens(&candidate.text);
            if spent + cost > evidence_budget {
                break;
            }
            spent += cost;
            lines.push(format!("[{}] {}", i + 1, candidate.text.trim()));
        }
        if !lines.is_empty() {
            sections.push(format!("Reference material:\n{}", lines.join("\n")));
        }
    }

    sections.push(format!("Question: {question}"));
    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use desk_protocol::QuestionType;

    fn candidate(text: &str) -> RetrievalCandidate {
        RetrievalCandidate {
            chunk_id: "c".to_string(),
            doc_id: "d".to_string(),
            text: text.to_string(),
            vector_score: None,
            lexical_score: None,
            fused_score: 0.5,
            recency_ms: 0,
        }
    }

    fn turn(content: &str) -> ConversationTurn {
        ConversationTurn {
            session_id: "s".to_string(),
            role: Role::User,
            content: content.to_string(),
            reasoning: QuestionType::Factual,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn prompt_contains_numbered_evidence_and_question() {
        let prompt = build_prompt(
            &[turn("earlier question")],
            &[candidate("first chunk"), candidate("second chunk")],
            "What now?",
            1_024,
        );
        assert!(prompt.contains("[1] first chunk"));
        assert!(prompt.contains("[2] second chunk"));
        assert!(prompt.contains("Question: What now?"));
        assert!(prompt.contains("earlier question"));
    }

    #[test]
    fn evidence_is_trimmed_to_budget() {
        let big = "word ".repeat(500);
        let candidates: Vec<RetrievalCandidate> = (0..10).map(|_| candidate(&big)).collect();
        let prompt = build_prompt(&[], &candidates, "q", 400);
        // 60% of 400 tokens fits zero 625-token chunks.
        assert!(!prompt.contains("[1]"));
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
