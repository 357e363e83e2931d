//! Run administration: resume status, rollback and metric reports.

use coexpr_core::{
  run::{Checkpoint, RollbackSummary, Run, RunReport, StudyResumeState},
  store::EtlStore,
};
use coexpr_store_sqlite::SqliteStore;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::{Error, Result, Settings};

/// Open a store session with the configured busy timeout.
pub async fn open_store(settings: &Settings) -> Result<SqliteStore> {
  Ok(SqliteStore::open(&settings.database.path, settings.busy_timeout()).await?)
}

async fn require_run(store: &SqliteStore, settings: &Settings, run_id: Uuid) -> Result<Run> {
  settings
    .retry_policy()
    .run("load run", || store.get_run(run_id))
    .await?
    .ok_or(Error::RunNotFound(run_id))
}

// ─── Resume ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResumeStatus {
  pub run:        Run,
  /// Last committed batch of the run, optionally for one study.
  pub checkpoint: Option<Checkpoint>,
  /// Studies whose next `run` continues from a stored cursor.
  pub pending:    Vec<StudyResumeState>,
}

pub async fn resume_status(
  settings: &Settings,
  run_id: Uuid,
  study: Option<String>,
) -> Result<ResumeStatus> {
  let store = open_store(settings).await?;
  let policy = settings.retry_policy();
  let run = require_run(&store, settings, run_id).await?;
  let checkpoint = policy
    .run("load checkpoint", || store.latest_checkpoint(run_id, study.clone()))
    .await?;
  let mut pending = policy.run("list resume states", || store.list_resume_states()).await?;
  if let Some(study) = &study {
    pending.retain(|s| &s.study_accession == study);
  }
  Ok(ResumeStatus { run, checkpoint, pending })
}

// ─── Rollback ────────────────────────────────────────────────────────────────

/// Remove everything run `run_id` wrote, in one transaction.
pub async fn rollback(settings: &Settings, run_id: Uuid) -> Result<RollbackSummary> {
  let store = open_store(settings).await?;
  require_run(&store, settings, run_id).await?;
  let summary = settings
    .retry_policy()
    .run("rollback run", || store.rollback_run(run_id))
    .await?;
  info!(
    %run_id,
    expression_facts = summary.expression_facts,
    metrics = summary.metrics,
    checkpoints = summary.checkpoints,
    resume_states = summary.resume_states,
    "run rolled back"
  );
  Ok(summary)
}

// ─── Report ──────────────────────────────────────────────────────────────────

pub async fn report(settings: &Settings, run_id: Uuid) -> Result<RunReport> {
  let store = open_store(settings).await?;
  let report = settings.retry_policy().run("report", || store.report(run_id)).await?;
  if report.run_id.is_none() {
    return Err(Error::RunNotFound(run_id));
  }
  Ok(report)
}
