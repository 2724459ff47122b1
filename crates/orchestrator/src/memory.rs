use crate::cache::unix_ms_now;
use crate::prompt::estimate_tokens;
use desk_confidence::token_overlap;
use desk_protocol::config::{ContextStrategy, MemoryConfig};
use desk_protocol::{ConversationTurn, QuestionType, Role};
use std::collections::HashMap;
use tokio::sync::Mutex;

struct StoredTurn {
    turn: ConversationTurn,
    /// Times this turn was selected into a prompt; feeds the relevance score.
    references: u32,
}

struct SessionLog {
    turns: Vec<StoredTurn>,
}

/// Session-partitioned conversation history. Turns are append-only; once a
/// session exceeds the retention window the oldest turns are compacted into
/// a single summary turn rather than dropped, preserving long-session
/// continuity within bounded memory. No cross-session locking: each call
/// touches exactly one session's log.
pub struct ConversationMemory {
    cfg: MemoryConfig,
    sessions: Mutex<HashMap<String, SessionLog>>,
}

impl ConversationMemory {
    #[must_use]
    pub fn new(cfg: MemoryConfig) -> Self {
        Self {
            cfg,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn append_turn(&self, turn: ConversationTurn) {
        let mut sessions = self.sessions.lock().await;
        let log = sessions
            .entry(turn.session_id.clone())
            .or_insert_with(|| SessionLog { turns: Vec::new() });
        log.turns.push(StoredTurn {
            turn,
            references: 0,
        });

        if log.turns.len() > self.cfg.retention_turns.max(2) {
            compact(log, self.cfg.retention_turns.max(2));
        }
    }

    /// Select history for the current query within the token budget.
    ///
    /// Returned turns are in chronological order regardless of strategy.
    pub async fn select_context(
        &self,
        session_id: &str,
        query_text: &str,
        strategy: ContextStrategy,
        budget_tokens: usize,
    ) -> Vec<ConversationTurn> {
        let mut sessions = self.sessions.lock().await;
        let Some(log) = sessions.get_mut(session_id) else {
            return Vec::new();
        };

        let now_ms = unix_ms_now();
        let half_life_ms = self.cfg.recency_half_life_secs.max(1) * 1_000;
        let scored: Vec<(usize, f32)> = log
            .turns
            .iter()
            .enumerate()
            .map(|(i, stored)| (i, relevance(stored, query_text, now_ms, half_life_ms)))
            .collect();

        let picked = match strategy {
            ContextStrategy::DepthFocused => pick_by_depth(log, &scored, budget_tokens),
            ContextStrategy::DiversityFocused => pick_by_diversity(log, &scored, budget_tokens, 1.0),
            ContextStrategy::Balanced => pick_by_diversity(log, &scored, budget_tokens, 0.5),
        };

        let mut indices = picked;
        indices.sort_unstable();
        for &i in &indices {
            log.turns[i].references += 1;
        }
        indices.into_iter().map(|i| log.turns[i].turn.clone()).collect()
    }

    #[cfg(test)]
    async fn turn_count(&self, session_id: &str) -> usize {
        let sessions = self.sessions.lock().await;
        sessions.get(session_id).map_or(0, |log| log.turns.len())
    }
}

/// Weighted blend of semantic overlap with the query, exponential recency
/// decay and reference frequency.
fn relevance(stored: &StoredTurn, query_text: &str, now_ms: u64, half_life_ms: u64) -> f32 {
    let semantic = token_overlap(query_text, &stored.turn.content);
    let age_ms = now_ms.saturating_sub(stored.turn.timestamp_ms) as f32;
    let recency = 0.5f32.powf(age_ms / half_life_ms as f32);
    let frequency = (stored.references as f32 / 5.0).min(1.0);
    0.5 * semantic + 0.3 * recency + 0.2 * frequency
}

/// Highest-relevance turns first, ignoring diversity.
fn pick_by_depth(log: &SessionLog, scored: &[(usize, f32)], budget_tokens: usize) -> Vec<usize> {
    let mut ranked = scored.to_vec();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut picked = Vec::new();
    let mut spent = 0usize;
    for (i, _) in ranked {
        let cost = estimate_tokens(&log.turns[i].turn.content);
        if spent + cost > budget_tokens {
            continue;
        }
        spent += cost;
        picked.push(i);
    }
    picked
}

/// Greedy selection maximizing marginal novelty: each pick is scored by its
/// relevance minus its worst-case similarity to what is already selected.
/// `novelty_weight` of 1.0 is the diversity-focused strategy; 0.5 interleaves
/// depth and diversity.
fn pick_by_diversity(
    log: &SessionLog,
    scored: &[(usize, f32)],
    budget_tokens: usize,
    novelty_weight: f32,
) -> Vec<usize> {
    let mut remaining: Vec<(usize, f32)> = scored.to_vec();
    let mut picked: Vec<usize> = Vec::new();
    let mut spent = 0usize;

    while !remaining.is_empty() {
        let best = remaining
            .iter()
            .enumerate()
            .map(|(pos, &(i, rel))| {
                let max_sim = picked
                    .iter()
                    .map(|&p| token_overlap(&log.turns[i].turn.content, &log.turns[p].turn.content))
                    .fold(0.0f32, f32::max);
                (pos, rel - novelty_weight * max_sim)
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let Some((pos, _)) = best else { break };
        let (i, _) = remaining.remove(pos);
        let cost = estimate_tokens(&log.turns[i].turn.content);
        if spent + cost > budget_tokens {
            continue;
        }
        spent += cost;
        picked.push(i);
    }
    picked
}

/// Compact the oldest turns into one summary turn so the log shrinks back to
/// the retention window.
fn compact(log: &mut SessionLog, retention: usize) {
    let excess = log.turns.len().saturating_sub(retention) + 1;
    let drained: Vec<StoredTurn> = log.turns.drain(..excess).collect();

    let summary_body = drained
        .iter()
        .map(|stored| {
            let content = stored.turn.content.trim();
            let head: String = content.chars().take(100).collect();
            format!("{:?}: {}", stored.turn.role, head)
        })
        .collect::<Vec<_>>()
        .join("; ");
    let session_id = drained
        .last()
        .map(|s| s.turn.session_id.clone())
        .unwrap_or_default();
    let timestamp_ms = drained.last().map_or(0, |s| s.turn.timestamp_ms);

    log.turns.insert(
        0,
        StoredTurn {
            turn: ConversationTurn {
                session_id,
                role: Role::System,
                content: format!("Earlier in this conversation: {summary_body}"),
                reasoning: QuestionType::Synthesis,
                timestamp_ms,
            },
            references: 0,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(session: &str, content: &str, age_secs: u64) -> ConversationTurn {
        ConversationTurn {
            session_id: session.to_string(),
            role: Role::User,
            content: content.to_string(),
            reasoning: QuestionType::Factual,
            timestamp_ms: unix_ms_now().saturating_sub(age_secs * 1_000),
        }
    }

    fn memory() -> ConversationMemory {
        ConversationMemory::new(MemoryConfig::default())
    }

    #[tokio::test]
    async fn relevant_turns_are_preferred() {
        let mem = memory();
        mem.append_turn(turn("s", "the printer driver keeps crashing on startup", 10)).await;
        mem.append_turn(turn("s", "lunch is at noon on fridays", 10)).await;

        let picked = mem
            .select_context("s", "why does the printer driver crash", ContextStrategy::DepthFocused, 512)
            .await;
        assert!(!picked.is_empty());
        assert!(picked[0].content.contains("printer driver"));
    }

    #[tokio::test]
    async fn budget_bounds_the_selection() {
        let mem = memory();
        for i in 0..20 {
            mem.append_turn(turn("s", &format!("note {i}: {}", "words ".repeat(50)), 10)).await;
        }
        let picked = mem
            .select_context("s", "note", ContextStrategy::DepthFocused, 100)
            .await;
        let total: usize = picked.iter().map(|t| estimate_tokens(&t.content)).sum();
        assert!(total <= 100);
    }

    #[tokio::test]
    async fn diversity_avoids_near_duplicates() {
        let mem = memory();
        mem.append_turn(turn("s", "reset the dns resolver cache on the laptop", 10)).await;
        mem.append_turn(turn("s", "reset the dns resolver cache on the laptop again", 10)).await;
        mem.append_turn(turn("s", "the vpn certificate expired yesterday", 10)).await;

        let picked = mem
            .select_context("s", "dns vpn", ContextStrategy::DiversityFocused, 60)
            .await;
        // Budget of 60 tokens fits two turns; diversity should not spend both
        // slots on the near-duplicate pair.
        assert!(picked.iter().any(|t| t.content.contains("vpn")));
    }

    #[tokio::test]
    async fn retention_compacts_old_turns_into_a_summary() {
        let mem = ConversationMemory::new(MemoryConfig {
            retention_turns: 4,
            ..MemoryConfig::default()
        });
        for i in 0..8 {
            mem.append_turn(turn("s", &format!("turn number {i}"), 0)).await;
        }
        let count = mem.turn_count("s").await;
        assert!(count <= 5);

        let picked = mem
            .select_context("s", "turn number", ContextStrategy::DepthFocused, 4_096)
            .await;
        assert!(picked.iter().any(|t| t.content.starts_with("Earlier in this conversation")));
    }

    #[tokio::test]
    async fn unknown_session_yields_empty_context() {
        let picked = memory()
            .select_context("missing", "anything", ContextStrategy::Balanced, 256)
            .await;
        assert!(picked.is_empty());
    }
}
