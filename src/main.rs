//! # autodoc CLI
//!
//! ## Usage
//!
//! ```bash
//! autodoc --config ./autodoc.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `autodoc index` | Analyze and store every changed file |
//! | `autodoc update [--force]` | Like `index`, plus dependency propagation and removal of deleted files |
//! | `autodoc cost` | Estimate the cost of the next `index` without calling the service |
//! | `autodoc search "<query>"` | Keyword search over stored documents |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `warn`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use autodoc::analyzer::{Analyzer, RetryPolicy};
use autodoc::config::{self, Config};
use autodoc::llm::create_provider;
use autodoc::pipeline::{Pipeline, PipelineError, PipelineOptions, RunResult};
use autodoc::progress::ProgressMode;
use autodoc::store::open_store;
use autodoc::{pipeline, search, walker};

/// autodoc: incremental LLM analysis of a source tree into a searchable index.
#[derive(Parser)]
#[command(name = "autodoc", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./autodoc.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to `human` on a terminal, else `off`.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze every file whose content changed since the last run.
    Index,

    /// Incremental update.
    ///
    /// Re-analyzes changed files and the files that depend on them, and
    /// removes files that no longer exist from the index.
    Update {
        /// Re-analyze every file, ignoring stored content hashes.
        #[arg(long)]
        force: bool,
    },

    /// Estimate the cost of analyzing the currently changed files.
    Cost,

    /// Search stored documents.
    Search {
        query: String,

        /// Restrict to one document kind: `file`, `function`, or `class`.
        #[arg(long)]
        kind: Option<String>,

        /// Restrict to documents of one file (path relative to the root).
        #[arg(long)]
        file: Option<String>,

        #[arg(long)]
        language: Option<String>,

        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let progress = cli
        .progress
        .map(ProgressMode::from)
        .unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Index => run_pipeline(&cfg, progress, false, false).await?,
        Commands::Update { force } => run_pipeline(&cfg, progress, true, force).await?,
        Commands::Cost => run_cost(&cfg).await?,
        Commands::Search {
            query,
            kind,
            file,
            language,
            limit,
        } => search::run_search(&cfg, &query, kind, file, language, limit).await?,
    }

    Ok(())
}

async fn run_pipeline(
    cfg: &Config,
    progress: ProgressMode,
    update: bool,
    force: bool,
) -> Result<()> {
    if !cfg.llm.is_enabled() {
        bail!("No LLM provider configured. Set [llm] provider and model in the config.");
    }

    let files = walker::scan_with_config(&cfg.index)?;
    let provider = create_provider(&cfg.llm)?;
    let analyzer = Analyzer::new(
        Arc::from(provider),
        cfg.analysis.quality,
        cfg.llm.model.clone().unwrap_or_default(),
    )
    .with_retry_policy(RetryPolicy::from_config(&cfg.analysis));
    let store = open_store(cfg).await?;

    let mut pipeline = Pipeline::new(PipelineOptions::from_config(cfg), Arc::new(analyzer), store)
        .with_force(force);
    if let Some(progress_fn) = progress.progress_fn() {
        pipeline = pipeline.with_progress(progress_fn);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight files");
            on_signal.cancel();
        }
    });

    let outcome = if update {
        pipeline.run_update(&cancel, &files).await
    } else {
        pipeline.run(&cancel, &files).await
    };
    let command = if update { "update" } else { "index" };

    match outcome {
        Ok(result) => {
            print_summary(command, &result, update);
            println!("ok");
            Ok(())
        }
        Err(PipelineError::Persist { partial, source }) => {
            print_summary(command, &partial, update);
            Err(source.context("Index was not saved; the next run will redo this work"))
        }
        Err(e) => Err(e.into()),
    }
}

fn print_summary(command: &str, result: &RunResult, update: bool) {
    println!("{}", command);
    println!("  processed: {} files", result.files_processed);
    println!("  unchanged: {} files", result.files_skipped);
    println!("  failed: {} files", result.files_failed);
    if update {
        println!("  dependency-affected: {} files", result.dependency_affected.len());
        println!("  removed: {} files", result.files_removed);
    }
    println!(
        "  tokens: {} in / {} out",
        result.input_tokens, result.output_tokens
    );
    println!("  estimated cost: ${:.4}", result.estimated_cost);
    println!("  duration: {:.1}s", result.duration.as_secs_f64());
    for error in &result.errors {
        println!("  error: {}", error);
    }
}

async fn run_cost(cfg: &Config) -> Result<()> {
    let files = walker::scan_with_config(&cfg.index)?;
    let estimate = pipeline::dry_run(&cfg.index.state_dir, cfg.analysis.quality, &files).await?;

    println!("cost ({})", cfg.analysis.quality);
    println!("  files to analyze: {}", estimate.total_files);
    println!("  estimated tokens: {}", estimate.total_tokens_estimate);
    for (operation, cost) in &estimate.cost_breakdown {
        println!("  {}: ${:.4}", operation, cost);
    }
    println!("  total: ${:.4}", estimate.estimated_cost);
    Ok(())
}
