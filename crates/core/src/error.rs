use thiserror::Error;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("missing {0}: without a retriever, context_input_ids, context_attention_mask and doc_scores must all be given")]
    MissingContext(&'static str),

    #[error("context rows ({rows}) are not a multiple of n_docs ({n_docs})")]
    DocCountMismatch { rows: usize, n_docs: usize },

    #[error("retriever output does not match the query batch: {0}")]
    RetrievalMismatch(String),

    #[error("malformed generation cache: {0}")]
    MalformedCache(String),

    #[error("invalid generation parameters: {0}")]
    InvalidParams(String),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RagError>;
