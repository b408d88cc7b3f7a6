//! # docqa CLI
//!
//! ```bash
//! docqa --config ./config/docqa.toml init       # create the database
//! docqa --config ./config/docqa.toml serve      # start the HTTP server
//! docqa --config ./config/docqa.toml ingest doc.pdf   # ingest one file
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use docqa::config::{load_config, Config};
use docqa::models::DocumentStatus;
use docqa::server;

/// docqa — document question answering with hybrid RAG retrieval.
#[derive(Parser)]
#[command(
    name = "docqa",
    about = "Document question-answering service with hybrid RAG retrieval and streaming chat",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). Missing file means defaults
    /// (mock providers, local SQLite).
    #[arg(long, global = true, default_value = "./config/docqa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Start the HTTP API server.
    Serve,

    /// Ingest one local file through the full pipeline and wait for it.
    Ingest {
        /// File to ingest (pdf, md, markdown, or txt).
        file: PathBuf,
        /// Skip LLM contextual enrichment for this file.
        #[arg(long)]
        skip_enrichment: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        tracing::warn!(path = %cli.config.display(), "config file not found, using defaults");
        Config::default()
    };

    match cli.command {
        Commands::Init => {
            let pool = docqa::db::connect(&config.db.path).await?;
            docqa::migrate::run(&pool).await?;
            println!("database initialized at {}", config.db.path.display());
        }
        Commands::Serve => {
            let state = server::build_state(config).await?;
            server::run_server(state).await?;
        }
        Commands::Ingest {
            file,
            skip_enrichment,
        } => {
            let state = server::build_state(config).await?;
            let filename = file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("upload")
                .to_string();
            let bytes = tokio::fs::read(&file).await?;

            let document = state
                .documents
                .clone()
                .upload(&filename, bytes, skip_enrichment)
                .await?;
            println!("ingesting {} as {}", filename, document.id);

            // the pipeline runs in the background; poll until it settles
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                let current = state.documents.get_document(&document.id).await?;
                match current.status {
                    DocumentStatus::Ready => {
                        println!("ready: {} chunks", current.chunk_count);
                        break;
                    }
                    DocumentStatus::Failed => {
                        anyhow::bail!("ingestion failed for {}", document.id);
                    }
                    _ => {}
                }
            }
        }
    }

    Ok(())
}
