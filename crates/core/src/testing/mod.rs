//! Shared test utilities for rag-core.
//!
//! Scripted collaborators whose outputs are plain functions of their inputs,
//! plus a tiny configuration for wiring them into a [`crate::RagModel`].

mod mock_model;
mod tiny_config;

pub use mock_model::{peaked_logits, Script, ScriptedGenerator, StaticQuestionEncoder, StaticRetriever};
pub use tiny_config::{scripted_rag, tiny_rag_config, BOS, EOS, PAD};
