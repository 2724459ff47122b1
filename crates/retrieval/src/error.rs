use thiserror::Error;

pub type Result<T> = std::result::Result<T, RetrievalError>;

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Empty query")]
    EmptyQuery,

    /// Both the vector and the lexical sub-search failed. Callers must route
    /// the sub-request to the web-fallback path.
    #[error("Retrieval unavailable: vector search failed ({vector}), lexical search failed ({lexical})")]
    Unavailable { vector: String, lexical: String },

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Web search error: {0}")]
    Web(String),
}
