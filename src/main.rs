use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nlq_engine::config::EngineConfig;
use nlq_engine::dataset::DatasetStore;
use nlq_engine::NlqEngine;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nlq")]
#[command(about = "Ask questions about a CSV or Parquet dataset in plain English")]
struct Args {
    /// Dataset to load (.csv or .parquet)
    #[arg(short, long)]
    data: PathBuf,

    /// Table name used in generated SQL (default: file stem)
    #[arg(short, long)]
    alias: Option<String>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// OpenAI API key (or set OPENAI_API_KEY env var)
    #[arg(long)]
    api_key: Option<String>,

    /// Disable LLM routing and translation
    #[arg(long)]
    no_llm: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Translate a question, run it and print the answer
    Ask { question: String },
    /// Run every strategy on a question and print the ranking
    Compare { question: String },
    /// Print the inferred schema
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = EngineConfig::load(args.config.as_deref())?;
    if let Some(key) = args.api_key {
        config.llm.api_key = Some(key);
    }
    if args.no_llm {
        config.llm.enabled = false;
    }

    let alias = args.alias.clone().unwrap_or_else(|| {
        args.data
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("dataset")
            .to_string()
    });

    info!("NLQ engine starting...");
    let engine = NlqEngine::from_config(&config, Arc::new(DatasetStore::new()))?;
    engine
        .load_dataset(&args.data, &alias)
        .with_context(|| format!("loading {}", args.data.display()))?;

    match args.command {
        Command::Ask { question } => {
            let response = engine.translate_and_run(&question).await;
            println!("\n{}", response.text);
            if let Some(table) = &response.table {
                println!("\n{}", table);
            }
            if let Some(translation) = &response.translation {
                if !translation.raw_sql.is_empty() {
                    println!("SQL: {}", translation.raw_sql);
                }
            }
            if !response.suggestions.is_empty() {
                println!("\nTry asking:");
                for suggestion in &response.suggestions {
                    println!("  - {}", suggestion);
                }
            }
        }
        Command::Compare { question } => {
            let report = engine.compare_strategies(&question).await?;
            println!("\n{}", report.render());
        }
        Command::Schema => {
            let snapshot = engine
                .store()
                .snapshot()
                .context("no dataset loaded")?;
            println!(
                "Table {} ({} rows)\n{}",
                snapshot.alias(),
                snapshot.row_count(),
                snapshot.schema().describe()
            );
        }
    }

    Ok(())
}
