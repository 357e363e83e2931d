//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! All timestamps are stored as RFC 3339 strings. UUIDs are stored as
//! hyphenated lowercase strings.

use chrono::{DateTime, Utc};
use coexpr_core::{
  dimension::DimensionKind,
  run::{Checkpoint, Run, RunStatus, StudyResumeState},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Uuid ─────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── RunStatus ───────────────────────────────────────────────────────────────

pub fn decode_run_status(s: &str) -> Result<RunStatus> {
  s.parse().map_err(Error::UnknownRunStatus)
}

// ─── Dimension tables ────────────────────────────────────────────────────────

/// `(table, surrogate key column, natural key column)` of a dimension.
pub fn dimension_table(kind: DimensionKind) -> (&'static str, &'static str, &'static str) {
  match kind {
    DimensionKind::Gene => ("dim_gene", "gene_key", "ensembl_id"),
    DimensionKind::Study => ("dim_study", "study_key", "gse_accession"),
    DimensionKind::Platform => ("dim_platform", "platform_key", "gpl_accession"),
    DimensionKind::Illness => ("dim_illness", "illness_key", "label"),
  }
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Raw values read directly from a `runs` row.
pub struct RawRun {
  pub run_id:      String,
  pub started_at:  String,
  pub finished_at: Option<String>,
  pub status:      String,
  pub config_hash: String,
}

impl RawRun {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      run_id:      row.get(0)?,
      started_at:  row.get(1)?,
      finished_at: row.get(2)?,
      status:      row.get(3)?,
      config_hash: row.get(4)?,
    })
  }

  pub fn into_run(self) -> Result<Run> {
    Ok(Run {
      run_id:      decode_uuid(&self.run_id)?,
      started_at:  decode_dt(&self.started_at)?,
      finished_at: self.finished_at.as_deref().map(decode_dt).transpose()?,
      status:      decode_run_status(&self.status)?,
      config_hash: self.config_hash,
    })
  }
}

/// Raw values read directly from a `checkpoints` row.
pub struct RawCheckpoint {
  pub run_id:          String,
  pub study_accession: String,
  pub table_name:      String,
  pub batch_index:     i64,
  pub created_at:      String,
}

impl RawCheckpoint {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      run_id:          row.get(0)?,
      study_accession: row.get(1)?,
      table_name:      row.get(2)?,
      batch_index:     row.get(3)?,
      created_at:      row.get(4)?,
    })
  }

  pub fn into_checkpoint(self) -> Result<Checkpoint> {
    Ok(Checkpoint {
      run_id:          decode_uuid(&self.run_id)?,
      study_accession: self.study_accession,
      table_name:      self.table_name,
      batch_index:     self.batch_index.max(0) as u64,
      created_at:      decode_dt(&self.created_at)?,
    })
  }
}

/// Raw values read directly from an `etl_study_state` row.
pub struct RawResumeState {
  pub study_accession:     String,
  pub last_processed_gene: Option<String>,
  pub last_sample_index:   i64,
  pub metadata_loaded:     bool,
  pub updated_at:          String,
}

impl RawResumeState {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      study_accession:     row.get(0)?,
      last_processed_gene: row.get(1)?,
      last_sample_index:   row.get(2)?,
      metadata_loaded:     row.get(3)?,
      updated_at:          row.get(4)?,
    })
  }

  pub fn into_state(self) -> Result<StudyResumeState> {
    Ok(StudyResumeState {
      study_accession:     self.study_accession,
      last_processed_gene: self.last_processed_gene,
      last_sample_index:   self.last_sample_index.max(0) as usize,
      metadata_loaded:     self.metadata_loaded,
      updated_at:          decode_dt(&self.updated_at)?,
    })
  }
}
