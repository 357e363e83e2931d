//! The `EtlStore` trait.
//!
//! The trait is implemented by storage backends (e.g. `coexpr-store-sqlite`).
//! Higher layers (`coexpr-etl`, `coexpr-cli`) depend on this abstraction, not
//! on any concrete backend.
//!
//! One value of an implementing type is one storage session. Sessions are
//! never shared between workers; each worker opens its own.

use std::future::Future;

use uuid::Uuid;

use crate::{
  dimension::{
    DimensionCache, DimensionKind, SampleKey, SampleUpsert, StudyDescriptor,
    StudyKey,
  },
  fact::{CohortMap, CorrelationRecord, ExpressionBatch, ExpressionMatrix},
  retry::Transient,
  run::{
    Checkpoint, Metric, RollbackSummary, Run, RunReport, RunStatus,
    StudyResumeState,
  },
};

/// Abstraction over a star-schema store backend.
///
/// Every method that writes more than one row runs in a single transaction:
/// it either commits completely or leaves the store untouched.
///
/// All methods return `Send` futures so the trait can be used from tasks
/// spawned on a multi-threaded tokio runtime.
pub trait EtlStore: Send + Sync {
  type Error: Transient + std::error::Error + Send + Sync + 'static;

  // ── Dimensions ────────────────────────────────────────────────────────

  /// Load every existing dimension row into a fresh cache.
  fn load_dimensions(
    &self,
  ) -> impl Future<Output = Result<DimensionCache, Self::Error>> + Send + '_;

  /// Insert `natural_key` unless it already exists, then return the
  /// surrogate key of whichever row holds it.
  ///
  /// Safe under concurrent callers on separate sessions: exactly one row is
  /// ever created per natural key.
  fn insert_dimension(
    &self,
    kind: DimensionKind,
    natural_key: String,
  ) -> impl Future<Output = Result<i64, Self::Error>> + Send + '_;

  /// Insert or merge the samples of a study in one transaction.
  ///
  /// Unknown fields of existing rows are filled in; known fields are never
  /// overwritten. Returns the sample key of each accession.
  fn upsert_samples(
    &self,
    study_key: StudyKey,
    samples: Vec<SampleUpsert>,
  ) -> impl Future<Output = Result<Vec<(String, SampleKey)>, Self::Error>> + Send + '_;

  // ── Resume state ──────────────────────────────────────────────────────

  fn load_resume_state(
    &self,
    study_accession: String,
  ) -> impl Future<Output = Result<Option<StudyResumeState>, Self::Error>> + Send + '_;

  fn save_resume_state(
    &self,
    state: StudyResumeState,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn clear_resume_state(
    &self,
    study_accession: String,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn list_resume_states(
    &self,
  ) -> impl Future<Output = Result<Vec<StudyResumeState>, Self::Error>> + Send + '_;

  // ── Facts ─────────────────────────────────────────────────────────────

  /// Commit an expression batch: the facts (conflicts skipped), the resume
  /// cursor and a checkpoint row. Returns the number of newly inserted facts.
  fn insert_expression_batch(
    &self,
    batch: ExpressionBatch,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;

  fn load_expression_matrix(
    &self,
    study_key: StudyKey,
  ) -> impl Future<Output = Result<ExpressionMatrix, Self::Error>> + Send + '_;

  fn load_cohorts(
    &self,
    study_key: StudyKey,
  ) -> impl Future<Output = Result<CohortMap, Self::Error>> + Send + '_;

  /// Delete every correlation of the study and insert `records` in their
  /// place. Returns the number of inserted records.
  fn replace_correlations(
    &self,
    study_key: StudyKey,
    records: Vec<CorrelationRecord>,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;

  /// Studies that have at least one expression fact, ordered by accession.
  fn studies_with_expression(
    &self,
  ) -> impl Future<Output = Result<Vec<StudyDescriptor>, Self::Error>> + Send + '_;

  // ── Runs ──────────────────────────────────────────────────────────────

  /// Create and persist a new run with status `running`.
  fn begin_run(
    &self,
    config_hash: String,
  ) -> impl Future<Output = Result<Run, Self::Error>> + Send + '_;

  fn finish_run(
    &self,
    run_id: Uuid,
    status: RunStatus,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn get_run(
    &self,
    run_id: Uuid,
  ) -> impl Future<Output = Result<Option<Run>, Self::Error>> + Send + '_;

  fn record_metrics(
    &self,
    run_id: Uuid,
    study_accession: String,
    metrics: Vec<Metric>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// The most recent checkpoint of a run, optionally restricted to one study.
  fn latest_checkpoint(
    &self,
    run_id: Uuid,
    study_accession: Option<String>,
  ) -> impl Future<Output = Result<Option<Checkpoint>, Self::Error>> + Send + '_;

  /// Metrics of a run aggregated by study.
  fn report(
    &self,
    run_id: Uuid,
  ) -> impl Future<Output = Result<RunReport, Self::Error>> + Send + '_;

  /// Atomically delete every expression fact, metric, checkpoint and the run
  /// row tagged with `run_id`. Dimensions are left in place; resume cursors
  /// of the studies the run checkpointed are reset.
  fn rollback_run(
    &self,
    run_id: Uuid,
  ) -> impl Future<Output = Result<RollbackSummary, Self::Error>> + Send + '_;
}
