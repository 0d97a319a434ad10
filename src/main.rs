//! Quarry CLI
//!
//! A small front-end for the engine: ingest text files into an in-memory
//! index, then answer one-shot questions or run an interactive loop.
//! For library usage, import from the `quarry` crate instead.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use quarry::types::SourceKind;
use quarry::{Engine, EngineConfig, PipelineProfile, QueryRequest, SourceDescriptor};

#[derive(Parser)]
#[command(name = "quarry-engine", version, about = "Document-grounded question answering")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "quarry.toml")]
    config: PathBuf,

    /// Pipeline profile: baseline, enhanced, advanced, comprehensive.
    #[arg(long, default_value = "enhanced")]
    profile: String,

    /// Persist the chunk index to this file between runs.
    #[arg(long)]
    index: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest text files and answer a single question.
    Ask {
        /// The question to answer.
        question: String,
        /// Text files to ingest first (one source per file, pages split
        /// on form feeds).
        #[arg(long)]
        file: Vec<PathBuf>,
    },
    /// Ingest text files, then answer questions read from stdin.
    Repl {
        /// Text files to ingest first.
        #[arg(long)]
        file: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quarry=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = if cli.config.exists() {
        EngineConfig::from_path(&cli.config)?
    } else {
        EngineConfig::default()
    };
    let profile = PipelineProfile::from_str(&cli.profile)?;
    let store = Arc::new(match &cli.index {
        Some(path) => quarry::MemoryChunkStore::load_or_new(path, config.embedding.dimension),
        None => quarry::MemoryChunkStore::new(config.embedding.dimension),
    });
    let engine = Engine::with_store(config, Arc::clone(&store) as Arc<dyn quarry::ChunkStore>)?;
    let cancel = CancellationToken::new();

    match cli.command {
        Command::Ask { question, file } => {
            ingest_files(&engine, &file, &cancel).await?;
            if let Some(path) = &cli.index {
                store.save(path)?;
            }
            answer(&engine, &question, profile, &cancel).await?;
        }
        Command::Repl { file } => {
            ingest_files(&engine, &file, &cancel).await?;
            if let Some(path) = &cli.index {
                store.save(path)?;
            }
            let stdin = std::io::stdin();
            loop {
                print!("? ");
                std::io::stdout().flush()?;
                let mut line = String::new();
                if stdin.lock().read_line(&mut line)? == 0 {
                    break;
                }
                let question = line.trim();
                if question.is_empty() || question == "exit" {
                    break;
                }
                if let Err(e) = answer(&engine, question, profile, &cancel).await {
                    eprintln!("error: {}", e);
                }
            }
        }
    }

    Ok(())
}

async fn ingest_files(
    engine: &Engine,
    files: &[PathBuf],
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    for path in files {
        let text = std::fs::read_to_string(path)?;
        let pages: Vec<String> = text.split('\u{c}').map(String::from).collect();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let source = engine
            .ingest(
                SourceDescriptor {
                    name,
                    kind: SourceKind::File,
                },
                pages,
                cancel,
            )
            .await?;
        eprintln!(
            "ingested {} ({} chunks{})",
            source.name,
            source.chunk_count,
            if source.is_truncated {
                format!(", truncated at {:.0}% coverage", source.coverage_percent)
            } else {
                String::new()
            }
        );
    }
    Ok(())
}

async fn answer(
    engine: &Engine,
    question: &str,
    profile: PipelineProfile,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let request = QueryRequest::new(question).with_profile(profile);
    let result = engine.query(request, cancel).await?;

    if result.abstained {
        println!(
            "{}",
            result
                .clarification
                .unwrap_or_else(|| "No answer available.".to_string())
        );
        return Ok(());
    }
    if let Some(code) = &result.error {
        eprintln!("generation failed ({}); sources follow", code);
    } else {
        println!("{}\n", result.text);
    }

    for (index, source) in result.sources.iter().enumerate() {
        println!(
            "[{}] {} (page {}, score {:.3})",
            index + 1,
            source.name,
            source.page,
            source.score
        );
    }
    Ok(())
}
