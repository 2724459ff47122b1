//! Lightweight lexical representations shared by the scorer and the
//! consensus combinators.

use std::collections::{HashMap, HashSet};

/// Lowercased alphanumeric tokens of length >= 3.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .map(str::to_ascii_lowercase)
        .filter(|t| t.len() >= 3)
        .collect()
}

/// Bag-of-words term frequencies.
#[must_use]
pub fn term_frequencies(text: &str) -> HashMap<String, f32> {
    let mut out: HashMap<String, f32> = HashMap::new();
    for token in tokenize(text) {
        *out.entry(token).or_insert(0.0) += 1.0;
    }
    out
}

/// Cosine similarity over term-frequency maps, in [0,1].
#[must_use]
pub fn cosine_similarity(a: &HashMap<String, f32>, b: &HashMap<String, f32>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let dot: f32 = a
        .iter()
        .filter_map(|(term, weight)| b.get(term).map(|other| weight * other))
        .sum();
    let norm_a: f32 = a.values().map(|w| w * w).sum::<f32>().sqrt();
    let norm_b: f32 = b.values().map(|w| w * w).sum::<f32>().sqrt();
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}

/// Jaccard overlap of token sets, in [0,1].
#[must_use]
pub fn token_overlap(a: &str, b: &str) -> f32 {
    let set_a: HashSet<String> = tokenize(a).into_iter().collect();
    let set_b: HashSet<String> = tokenize(b).into_iter().collect();
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f32;
    let union = set_a.union(&set_b).count() as f32;
    intersection / union
}
