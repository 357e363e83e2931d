//! `coexpr`: load expression studies into the star schema.
//!
//! # Usage
//!
//! ```
//! coexpr --config coexpr.yaml run
//! coexpr resume --run-id 4f0c… --study GSE1
//! coexpr rollback --run-id 4f0c…
//! coexpr validate --input-dir ./data
//! coexpr report --run-id 4f0c…
//! coexpr correlate --study GSE1 --study GSE2
//! ```
//!
//! Settings come from the config file plus `COEXPR__SECTION__KEY`
//! environment overrides; `RUST_LOG` overrides `logging.level`.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use coexpr_core::run::RunStatus;
use coexpr_etl::{
  Settings, correlation_job::refresh_correlations, discovery::discover, run_pipeline,
  runs,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ─── CLI args ─────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "coexpr", version, about = "Genomic expression ETL and gene co-expression")]
struct Cli {
  /// Path to the configuration file (YAML, TOML or JSON).
  #[arg(short, long, value_name = "FILE", default_value = "coexpr.yaml", env = "COEXPR_CONFIG")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Process every discovered study under a new run.
  Run,

  /// Show how far a run got and which studies will resume.
  Resume {
    #[arg(long)]
    run_id: Uuid,
    /// Restrict to one study accession.
    #[arg(long)]
    study:  Option<String>,
  },

  /// Delete everything a run wrote.
  Rollback {
    #[arg(long)]
    run_id: Uuid,
  },

  /// Check study discovery without touching the database.
  Validate {
    /// Defaults to `processing.input_directory`.
    #[arg(long, value_name = "DIR")]
    input_dir: Option<PathBuf>,
  },

  /// Print the metrics of a run as JSON.
  Report {
    #[arg(long)]
    run_id: Uuid,
  },

  /// Recompute correlations from stored expression facts.
  Correlate {
    /// Study accession; repeat for several. All studies when omitted.
    #[arg(long = "study", value_name = "ACC")]
    studies: Vec<String>,
  },
}

// ─── Entry point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  // Discovery preflight works without a complete configuration.
  if let Command::Validate { input_dir: Some(dir) } = &cli.command {
    init_tracing(LevelFilter::INFO);
    return validate(dir);
  }

  let settings = Settings::load(&cli.config)
    .with_context(|| format!("failed to load settings from {}", cli.config.display()))?;
  init_tracing(settings.level_filter());

  match cli.command {
    Command::Run => run(settings).await,
    Command::Resume { run_id, study } => resume(&settings, run_id, study).await,
    Command::Rollback { run_id } => {
      let removed = runs::rollback(&settings, run_id)
        .await
        .with_context(|| format!("failed to roll back run {run_id}"))?;
      println!("rolled back run {run_id}");
      println!("  expression facts: {}", removed.expression_facts);
      println!("  metrics:          {}", removed.metrics);
      println!("  checkpoints:      {}", removed.checkpoints);
      println!("  resume cursors:   {}", removed.resume_states);
      Ok(())
    }
    Command::Validate { input_dir } => {
      validate(input_dir.as_deref().unwrap_or(settings.processing.input_directory.as_path()))
    }
    Command::Report { run_id } => {
      let report = runs::report(&settings, run_id)
        .await
        .with_context(|| format!("failed to build report for run {run_id}"))?;
      println!("{}", serde_json::to_string_pretty(&report)?);
      Ok(())
    }
    Command::Correlate { studies } => {
      let summary = refresh_correlations(&settings, &studies)
        .await
        .context("correlation refresh failed")?;
      println!("refreshed: {}", summary.refreshed.join(", "));
      if !summary.cleared.is_empty() {
        println!("cleared:   {}", summary.cleared.join(", "));
      }
      if !summary.missing.is_empty() {
        println!("missing:   {}", summary.missing.join(", "));
      }
      if !summary.failed.is_empty() {
        bail!("correlation refresh failed for {}", summary.failed.join(", "));
      }
      Ok(())
    }
  }
}

fn init_tracing(level: LevelFilter) {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy(),
    )
    .init();
}

// ─── Commands ─────────────────────────────────────────────────────────────────

async fn run(settings: Settings) -> Result<()> {
  let summary = run_pipeline(settings).await.context("run failed")?;
  println!("run {} {}", summary.run_id, summary.status);
  println!("  succeeded: {}", summary.succeeded.len());
  println!("  failed:    {}", summary.failed_count());
  for study in &summary.failed {
    println!("    {study}");
  }
  if summary.status == RunStatus::Failed {
    bail!("every study of run {} failed", summary.run_id);
  }
  Ok(())
}

async fn resume(settings: &Settings, run_id: Uuid, study: Option<String>) -> Result<()> {
  let status = runs::resume_status(settings, run_id, study)
    .await
    .with_context(|| format!("failed to load resume status of run {run_id}"))?;
  println!("run {} {}", status.run.run_id, status.run.status);
  match &status.checkpoint {
    Some(cp) => println!(
      "  last committed batch: {} of {} ({})",
      cp.batch_index, cp.study_accession, cp.table_name
    ),
    None => println!("  no committed batches"),
  }
  if status.pending.is_empty() {
    println!("  nothing to resume");
  }
  for state in &status.pending {
    println!(
      "  pending {}: gene {} index {} (metadata loaded: {})",
      state.study_accession,
      state.last_processed_gene.as_deref().unwrap_or("-"),
      state.last_sample_index,
      state.metadata_loaded,
    );
  }
  Ok(())
}

fn validate(input_dir: &Path) -> Result<()> {
  let report = discover(input_dir)
    .with_context(|| format!("failed to scan {}", input_dir.display()))?;
  for unit in &report.studies {
    println!("ok       {} {}", unit.accession, unit.directory.display());
  }
  for skipped in &report.incomplete {
    println!("skipped  {} ({})", skipped.directory.display(), skipped.reason);
  }
  if report.studies.is_empty() {
    bail!("no studies found under {}", input_dir.display());
  }
  Ok(())
}
