//! Fact types: expression measurements and gene-pair correlations.
//!
//! Expression facts are append-only within a run and identified by
//! `(sample_key, gene_key, study_key)`. Correlation facts are replaced
//! wholesale per study whenever they are recomputed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dimension::{GeneKey, IllnessKey, SampleKey, StudyKey};

// ─── Streaming ───────────────────────────────────────────────────────────────

/// One `(gene, sample, value)` cell produced by the expression reader.
///
/// `sample_index` is the zero-based column index among the file's sample
/// columns, not the index in the header row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionRow {
  pub gene_id:          String,
  pub sample_accession: String,
  pub value:            f64,
  pub sample_index:     usize,
}

impl ExpressionRow {
  pub fn position(&self) -> ResumePosition {
    ResumePosition { gene_id: self.gene_id.clone(), sample_index: self.sample_index }
  }
}

/// Where a stream should restart: the first cell to emit is
/// `(gene_id, sample_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePosition {
  pub gene_id:      String,
  pub sample_index: usize,
}

// ─── Expression ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExpressionFact {
  pub sample_key: SampleKey,
  pub gene_key:   GeneKey,
  pub value:      f64,
}

/// A unit of work for the batch loader.
///
/// The facts, the resume cursor and the checkpoint derived from this batch
/// are committed together or not at all.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionBatch {
  pub run_id:          Uuid,
  pub study_key:       StudyKey,
  /// Key under which the resume cursor is stored.
  pub study_accession: String,
  pub batch_index:     u64,
  pub facts:           Vec<ExpressionFact>,
  /// Position of the last cell in `facts`.
  pub cursor:          ResumePosition,
}

/// Values of one study, keyed by gene then sample. Ordered so that pair
/// enumeration is deterministic.
pub type ExpressionMatrix = BTreeMap<GeneKey, BTreeMap<SampleKey, f64>>;

/// Illness assignment of every sample in a study. `None` is the
/// "no illness recorded" cohort.
pub type CohortMap = BTreeMap<SampleKey, Option<IllnessKey>>;

// ─── Correlation ─────────────────────────────────────────────────────────────

/// A derived fact: Spearman correlation of two genes within a cohort.
///
/// `gene_a_key < gene_b_key` always holds. `q_value` is `None` when the pair
/// had too few samples to take part in FDR correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationRecord {
  pub gene_a_key:  GeneKey,
  pub gene_b_key:  GeneKey,
  pub illness_key: Option<IllnessKey>,
  pub study_key:   StudyKey,
  pub rho:         f64,
  pub p_value:     f64,
  pub q_value:     Option<f64>,
  pub n_samples:   usize,
  pub computed_at: DateTime<Utc>,
}
