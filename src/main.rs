use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use log::{error, info};
use std::path::PathBuf;

use kb_rag::config::RagConfig;
use kb_rag::rag::RagEngine;

/// Answer questions about a local knowledge base of text and PDF files
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Ignore any persisted index and rebuild it from the knowledge base
    #[arg(long)]
    rebuild: bool,

    /// Answer a single question, print it as JSON and exit
    #[arg(long, short)]
    query: Option<String>,

    /// Number of chunks to retrieve per question
    #[arg(long, short)]
    k: Option<usize>,

    /// Directory holding the documents to index
    #[arg(long)]
    knowledge_base: Option<PathBuf>,

    /// Directory where the index is persisted
    #[arg(long)]
    index: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();

    // Load configuration from environment, then apply command line overrides
    let mut config = RagConfig::from_env().context("Invalid configuration")?;
    if let Some(k) = args.k {
        if k == 0 {
            error!("--k must be a positive integer");
            return Err(anyhow::anyhow!("Invalid --k"));
        }
        config.top_k = k;
    }
    if let Some(dir) = args.knowledge_base {
        config.knowledge_base_path = dir;
    }
    if let Some(dir) = args.index {
        config.index_path = dir;
    }

    info!(
        "Knowledge base: {}, mode: {:?}",
        config.knowledge_base_path.display(),
        config.llm_mode
    );

    let engine = RagEngine::build(&config, args.rebuild)
        .await
        .context("Failed to initialize RAG engine")?;

    match args.query {
        Some(question) => {
            let response = engine
                .answer_query(question.trim())
                .await
                .context("Failed to answer question")?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        None => engine
            .run_query_loop()
            .await
            .context("Error in query loop")?,
    }

    Ok(())
}
