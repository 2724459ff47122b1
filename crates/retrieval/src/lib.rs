mod classifier;
mod decompose;
mod error;
mod fusion;
mod hybrid;
mod web;

pub use classifier::{classify, question_type, QueryClassifier};
pub use decompose::Decomposer;
pub use error::{Result, RetrievalError};
pub use fusion::{fuse, normalize_scores, weighted_sum, SourceHit};
pub use hybrid::{ChunkIndex, HybridRetriever, LexicalHit, QueryEmbedder, VectorHit};
pub use web::{candidates_from_web, WebHit, WebSearch};
