//! Retrieval-augmented decoding over pluggable encoder, retriever and
//! generator models.
//!
//! [`RagTokenForGeneration`] marginalizes over retrieved documents at every
//! token; [`RagSequenceForGeneration`] generates per document and rescores
//! whole sequences.

pub mod cache;
pub mod config;
pub mod error;
pub mod generation;
pub mod layout;
pub mod loss;
pub mod marginalize;
pub mod model;
pub mod sampling;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use cache::{CachePart, EncoderState, GenerationCache, LayerCache};
pub use config::{GenerationConfig, RagConfig, TokenIds};
pub use error::{RagError, Result};
pub use generation::{
    ForwardOptions, GenerateRequest, RagGeneration, RagLmOutput, RagSequenceForGeneration,
    RagTokenForGeneration,
};
pub use model::{DocSet, Generator, GeneratorOutput, QuestionEncoder, RagInputs, RagModel, Retriever};
