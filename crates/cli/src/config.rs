//! TOML configuration for the `rag` binary.
//!
//! The `[rag]` table is a [`RagConfig`]; the `[demo]` table describes a tiny
//! scripted world (vocabulary, question and retrieved documents) so both
//! decoders can run without model weights. The world is only built with the
//! `demo` feature.

use std::fs;
use std::path::Path;

use rag_core::{RagConfig, TokenIds};
use serde::{Deserialize, Serialize};

pub const PAD: u32 = 0;
pub const BOS: u32 = 1;
pub const EOS: u32 = 2;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub rag: RagConfig,
    pub demo: DemoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub vocab: Vec<String>,
    pub question: String,
    pub docs: Vec<DemoDoc>,
}

/// A retrieved document: its retrieval score and the answer a generator
/// reading it would give.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoDoc {
    pub title: String,
    pub score: f32,
    pub answer: Vec<String>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        let words = |s: &str| s.split_whitespace().map(String::from).collect::<Vec<_>>();
        Self {
            vocab: words("paris lyon is the capital of france"),
            question: "what is the capital of france".into(),
            docs: vec![
                DemoDoc {
                    title: "France".into(),
                    score: 2.0,
                    answer: words("paris is the capital"),
                },
                DemoDoc {
                    title: "Paris".into(),
                    score: 1.5,
                    answer: words("paris is the capital of france"),
                },
                DemoDoc {
                    title: "Lyon".into(),
                    score: 0.5,
                    answer: words("lyon"),
                },
            ],
        }
    }
}

impl CliConfig {
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// The RAG config with the demo's reserved token ids and document count.
    pub fn rag_config(&self) -> RagConfig {
        RagConfig {
            n_docs: self.demo.docs.len(),
            tokens: TokenIds {
                bos_token_id: Some(BOS),
                eos_token_id: Some(EOS),
                pad_token_id: PAD,
                decoder_start_token_id: BOS,
            },
            ..self.rag.clone()
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rag.toml");
        fs::write(
            &path,
            r#"
[rag.generation]
num_beams = 3
max_length = 12

[demo]
vocab = ["yes", "no"]
question = "is it?"

[[demo.docs]]
title = "a"
score = 1.0
answer = ["yes"]
"#,
        )
        .unwrap();

        let config = CliConfig::load_from(&path).unwrap();
        assert_eq!(config.rag.generation.num_beams, 3);
        assert_eq!(config.rag.generation.max_length, 12);
        assert_eq!(config.rag.generation.top_k, 50);
        assert_eq!(config.demo.docs.len(), 1);
        assert_eq!(config.rag_config().n_docs, 1);
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("default.toml");
        fs::write(&path, CliConfig::default().to_toml().unwrap()).unwrap();
        let loaded = CliConfig::load_from(&path).unwrap();
        assert_eq!(loaded.rag, RagConfig::default());
        assert_eq!(loaded.demo.vocab, DemoConfig::default().vocab);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let err = CliConfig::load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
