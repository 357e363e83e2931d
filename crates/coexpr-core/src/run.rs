//! Run bookkeeping: runs, checkpoints, metrics and resume cursors.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fact::ResumePosition;

/// Table name recorded in checkpoints for expression batches.
pub const EXPRESSION_TABLE: &str = "fact_expression";

// ─── Runs ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
  Running,
  Completed,
  Partial,
  Failed,
}

impl RunStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Running => "running",
      Self::Completed => "completed",
      Self::Partial => "partial",
      Self::Failed => "failed",
    }
  }

  /// Terminal status for a run given its per-study outcomes.
  pub fn from_outcome(succeeded: usize, failed: usize) -> Self {
    match (succeeded, failed) {
      (_, 0) => Self::Completed,
      (0, _) => Self::Failed,
      _ => Self::Partial,
    }
  }
}

impl std::str::FromStr for RunStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "running" => Ok(Self::Running),
      "completed" => Ok(Self::Completed),
      "partial" => Ok(Self::Partial),
      "failed" => Ok(Self::Failed),
      other => Err(other.to_owned()),
    }
  }
}

impl std::fmt::Display for RunStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
  pub run_id:      Uuid,
  pub started_at:  DateTime<Utc>,
  pub finished_at: Option<DateTime<Utc>>,
  pub status:      RunStatus,
  pub config_hash: String,
}

// ─── Checkpoints & metrics ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
  pub run_id:          Uuid,
  pub study_accession: String,
  pub table_name:      String,
  pub batch_index:     u64,
  pub created_at:      DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
  pub key:   String,
  pub value: f64,
}

impl Metric {
  pub fn new(key: impl Into<String>, value: impl Into<f64>) -> Self {
    Self { key: key.into(), value: value.into() }
  }
}

/// Metrics of one run, grouped by study accession then metric key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
  pub run_id:  Option<Uuid>,
  pub status:  Option<RunStatus>,
  pub studies: BTreeMap<String, BTreeMap<String, f64>>,
}

/// Row counts removed by a rollback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackSummary {
  pub expression_facts: usize,
  pub metrics:          usize,
  pub checkpoints:      usize,
  pub runs:             usize,
  /// Resume cursors reset because the run had checkpointed their study.
  pub resume_states:    usize,
}

// ─── Resume state ────────────────────────────────────────────────────────────

/// Persisted progress of a study that has not completed yet.
///
/// `last_sample_index` is the index of the last *committed* cell of
/// `last_processed_gene`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyResumeState {
  pub study_accession:     String,
  pub last_processed_gene: Option<String>,
  pub last_sample_index:   usize,
  pub metadata_loaded:     bool,
  pub updated_at:          DateTime<Utc>,
}

impl StudyResumeState {
  pub fn new(study_accession: impl Into<String>) -> Self {
    Self {
      study_accession:     study_accession.into(),
      last_processed_gene: None,
      last_sample_index:   0,
      metadata_loaded:     false,
      updated_at:          Utc::now(),
    }
  }

  /// The first cell the expression reader should emit, i.e. the one after
  /// the last committed cell.
  pub fn resume_position(&self) -> Option<ResumePosition> {
    self.last_processed_gene.as_ref().map(|gene| ResumePosition {
      gene_id:      gene.clone(),
      sample_index: self.last_sample_index + 1,
    })
  }
}
