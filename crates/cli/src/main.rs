use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

mod config;
#[cfg(feature = "demo")]
mod demo;
mod logging;

use config::CliConfig;
use logging::LogFormat;

#[derive(Parser)]
#[command(name = "rag", about = "Retrieval-augmented decoding over scripted documents")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log format; defaults to RAG_LOG_FORMAT, then pretty
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,
}

#[cfg(feature = "demo")]
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Mode {
    /// Marginalize over documents at every token
    Token,
    /// Generate per document, then rescore whole sequences
    Sequence,
}

#[derive(Subcommand)]
enum Command {
    /// Answer the demo question with one of the RAG decoders
    #[cfg(feature = "demo")]
    Generate {
        /// TOML file with [rag] and [demo] tables; built-in demo when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = Mode::Token)]
        mode: Mode,

        #[arg(long)]
        num_beams: Option<usize>,

        #[arg(long)]
        num_return_sequences: Option<usize>,

        #[arg(long)]
        max_length: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,

        /// Sample instead of greedy or beam search
        #[arg(long)]
        do_sample: bool,
    },
    /// Print the effective configuration as TOML
    ShowConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CliConfig> {
    match path {
        Some(path) => CliConfig::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(CliConfig::default()),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(Some(&cli.log_level), cli.log_format.unwrap_or_else(LogFormat::from_env))?;

    match cli.command {
        #[cfg(feature = "demo")]
        Command::Generate {
            config,
            mode,
            num_beams,
            num_return_sequences,
            max_length,
            seed,
            do_sample,
        } => {
            use rag_core::{RagGeneration, RagSequenceForGeneration, RagTokenForGeneration};

            let file_config = load_config(config.as_deref())?;
            let mut rag_config = file_config.rag_config();
            let params = &mut rag_config.generation;
            if let Some(n) = num_beams {
                params.num_beams = n;
            }
            if let Some(n) = num_return_sequences {
                params.num_return_sequences = n;
            }
            if let Some(n) = max_length {
                params.max_length = n;
            }
            if seed.is_some() {
                params.seed = seed;
            }
            params.do_sample |= do_sample;

            let demo = &file_config.demo;
            let (model, request) = demo
                .build(rag_config)
                .context("failed to build the demo model")?;
            tracing::info!(question = %demo.question, docs = demo.docs.len(), ?mode, "answering");

            let output = match mode {
                Mode::Token => RagTokenForGeneration::new(model).generate(request),
                Mode::Sequence => RagSequenceForGeneration::new(model).generate(request),
            }
            .context("generation failed")?;

            for row in output.to_vec2::<u32>()? {
                println!("{}", demo.decode(&row));
            }
        }
        Command::ShowConfig { config } => {
            let file_config = load_config(config.as_deref())?;
            print!("{}", file_config.to_toml()?);
        }
    }

    Ok(())
}
