mod consensus;
mod score;
mod text;

pub use consensus::{
    cluster_representative, highest_confidence, similarity_clusters, weighted_vote,
};
pub use score::{consistency_from_scores, recompose, retrieval_confidence, score, ConfidenceScorer};
pub use text::{cosine_similarity, term_frequencies, token_overlap, tokenize};
