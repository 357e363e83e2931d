//! Integration tests for `SqliteStore` against an in-memory database.

use std::time::Duration;

use chrono::Utc;
use coexpr_core::{
  Error as CoreError,
  dimension::{DimensionKind, SampleRecord, SampleUpsert, UNKNOWN},
  fact::{CorrelationRecord, ExpressionBatch, ExpressionFact, ResumePosition},
  reconcile::Reconciler,
  retry::{RetryPolicy, Transient},
  run::{EXPRESSION_TABLE, Metric, RunStatus, StudyResumeState},
  store::EtlStore,
};
use uuid::Uuid;

use crate::{Error, SqliteStore};

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn policy() -> RetryPolicy {
  RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5))
}

fn upsert(accession: &str, illness_key: Option<i64>, age: &str) -> SampleUpsert {
  SampleUpsert {
    accession: accession.into(),
    platform_key: None,
    illness_key,
    age: age.into(),
    sex: UNKNOWN.into(),
  }
}

/// A study with one gene and two samples, ready for expression facts.
async fn seeded(s: &SqliteStore) -> (i64, i64, Vec<i64>) {
  let study = s.insert_dimension(DimensionKind::Study, "GSE1".into()).await.unwrap();
  let gene = s.insert_dimension(DimensionKind::Gene, "ENSG1".into()).await.unwrap();
  let samples = s
    .upsert_samples(study, vec![upsert("GSM1", None, UNKNOWN), upsert("GSM2", None, UNKNOWN)])
    .await
    .unwrap()
    .into_iter()
    .map(|(_, key)| key)
    .collect();
  (study, gene, samples)
}

fn batch(
  run_id: Uuid,
  study: i64,
  index: u64,
  facts: Vec<ExpressionFact>,
  gene: &str,
  at: usize,
) -> ExpressionBatch {
  ExpressionBatch {
    run_id,
    study_key: study,
    study_accession: "GSE1".into(),
    batch_index: index,
    facts,
    cursor: ResumePosition { gene_id: gene.into(), sample_index: at },
  }
}

// ─── Dimensions ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn insert_dimension_is_idempotent() {
  let s = store().await;
  let first = s.insert_dimension(DimensionKind::Gene, "ENSG1".into()).await.unwrap();
  let second = s.insert_dimension(DimensionKind::Gene, "ENSG1".into()).await.unwrap();
  let other = s.insert_dimension(DimensionKind::Gene, "ENSG2".into()).await.unwrap();
  assert_eq!(first, second);
  assert_ne!(first, other);

  let cache = s.load_dimensions().await.unwrap();
  assert_eq!(cache.genes.len(), 2);
  assert_eq!(cache.get(DimensionKind::Gene, "ENSG1"), Some(first));
}

#[tokio::test]
async fn dimension_kinds_have_separate_key_spaces() {
  let s = store().await;
  s.insert_dimension(DimensionKind::Illness, "Flu".into()).await.unwrap();
  s.insert_dimension(DimensionKind::Platform, "Flu".into()).await.unwrap();
  let cache = s.load_dimensions().await.unwrap();
  assert_eq!(cache.illnesses.len(), 1);
  assert_eq!(cache.platforms.len(), 1);
  assert!(cache.genes.is_empty());
}

#[tokio::test]
async fn concurrent_get_or_create_on_two_connections_yields_one_row() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("coexpr.db");
  let a = SqliteStore::open(&path, Duration::from_secs(5)).await.unwrap();
  let b = SqliteStore::open(&path, Duration::from_secs(5)).await.unwrap();

  let (ka, kb) = tokio::join!(
    a.insert_dimension(DimensionKind::Gene, "ENSG7".into()),
    b.insert_dimension(DimensionKind::Gene, "ENSG7".into()),
  );
  assert_eq!(ka.unwrap(), kb.unwrap());

  let mut ra = Reconciler::bootstrap(&a, policy()).await.unwrap();
  let mut rb = Reconciler::bootstrap(&b, policy()).await.unwrap();
  let (x, y) = tokio::join!(
    ra.get_or_create(DimensionKind::Study, "GSE9"),
    rb.get_or_create(DimensionKind::Study, "GSE9"),
  );
  assert_eq!(x.unwrap(), y.unwrap());
  assert_eq!(a.load_dimensions().await.unwrap().studies.len(), 1);
}

#[tokio::test]
async fn write_lock_held_elsewhere_is_transient() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("coexpr.db");
  let holder = SqliteStore::open(&path, Duration::ZERO).await.unwrap();
  let writer = SqliteStore::open(&path, Duration::ZERO).await.unwrap();
  holder.conn_for_tests(|conn| conn.execute_batch("BEGIN IMMEDIATE")).await;

  let err = writer.insert_dimension(DimensionKind::Gene, "ENSG1".into()).await.unwrap_err();
  assert!(err.is_transient(), "{err}");

  let once = RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1));
  let err = once
    .run("insert gene", || writer.insert_dimension(DimensionKind::Gene, "ENSG1".into()))
    .await
    .unwrap_err();
  assert!(matches!(err, CoreError::RetriesExhausted { attempts: 2, .. }), "{err}");

  holder.conn_for_tests(|conn| conn.execute_batch("COMMIT")).await;
  writer.insert_dimension(DimensionKind::Gene, "ENSG1".into()).await.unwrap();
}

#[tokio::test]
async fn samples_merge_first_writer_wins() {
  let s = store().await;
  let study = s.insert_dimension(DimensionKind::Study, "GSE1".into()).await.unwrap();
  let flu = s.insert_dimension(DimensionKind::Illness, "Flu".into()).await.unwrap();
  let cold = s.insert_dimension(DimensionKind::Illness, "Cold".into()).await.unwrap();

  let first = s.upsert_samples(study, vec![upsert("GSM1", None, "42")]).await.unwrap();
  let second = s
    .upsert_samples(study, vec![SampleUpsert {
      sex: "female".into(),
      ..upsert("GSM1", Some(flu), "50")
    }])
    .await
    .unwrap();
  let third = s.upsert_samples(study, vec![upsert("GSM1", Some(cold), UNKNOWN)]).await.unwrap();
  assert_eq!(first[0].1, second[0].1);
  assert_eq!(first[0].1, third[0].1);

  let cohorts = s.load_cohorts(study).await.unwrap();
  assert_eq!(cohorts.get(&first[0].1), Some(&Some(flu)));

  let (age, sex): (String, String) = s
    .conn_for_tests(move |conn| {
      conn.query_row("SELECT age, sex FROM dim_sample WHERE gsm_accession = 'GSM1'", [], |r| {
        Ok((r.get(0)?, r.get(1)?))
      })
    })
    .await;
  assert_eq!(age, "42");
  assert_eq!(sex, "female");
}

#[tokio::test]
async fn same_accession_in_two_studies_is_two_samples() {
  let s = store().await;
  let a = s.insert_dimension(DimensionKind::Study, "GSE1".into()).await.unwrap();
  let b = s.insert_dimension(DimensionKind::Study, "GSE2".into()).await.unwrap();
  let ka = s.upsert_samples(a, vec![upsert("GSM1", None, UNKNOWN)]).await.unwrap();
  let kb = s.upsert_samples(b, vec![upsert("GSM1", None, UNKNOWN)]).await.unwrap();
  assert_ne!(ka[0].1, kb[0].1);
}

#[tokio::test]
async fn reconciler_resolves_optional_values_and_caches_samples() {
  let s = store().await;
  let mut r = Reconciler::bootstrap(&s, policy()).await.unwrap();

  assert_eq!(r.resolve_optional(DimensionKind::Illness, UNKNOWN).await.unwrap(), None);
  assert_eq!(r.resolve_optional(DimensionKind::Platform, " ").await.unwrap(), None);
  assert!(r.get_or_create(DimensionKind::Gene, "").await.is_err());

  let study = r.get_or_create(DimensionKind::Study, "GSE1").await.unwrap();
  let mut record = SampleRecord::new("GSM1", "GSE1");
  record.illness_label = "Flu".into();
  record.platform_accession = "GPL570".into();
  let records = vec![record, SampleRecord::new("GSM2", "GSE1")];

  assert!(!r.has_samples(study, &records));
  assert_eq!(r.upsert_samples(study, &records).await.unwrap(), 2);
  assert!(r.has_samples(study, &records));
  assert!(r.cache().get(DimensionKind::Illness, "Flu").is_some());
  assert!(r.cache().get(DimensionKind::Platform, "GPL570").is_some());

  // A fresh session sees the same keys.
  let again = Reconciler::bootstrap(&s, policy()).await.unwrap();
  assert_eq!(again.sample_key("GSM1", study), r.sample_key("GSM1", study));
}

// ─── Expression batches ──────────────────────────────────────────────────────

#[tokio::test]
async fn expression_batch_commits_facts_cursor_and_checkpoint() {
  let s = store().await;
  let run = s.begin_run("hash".into()).await.unwrap();
  let (study, gene, samples) = seeded(&s).await;

  let facts: Vec<ExpressionFact> = samples
    .iter()
    .map(|&sample_key| ExpressionFact { sample_key, gene_key: gene, value: 1.5 })
    .collect();
  let n = s
    .insert_expression_batch(batch(run.run_id, study, 0, facts.clone(), "ENSG1", 1))
    .await
    .unwrap();
  assert_eq!(n, 2);

  // Re-emitted rows are skipped, not duplicated.
  let n = s
    .insert_expression_batch(batch(run.run_id, study, 1, facts, "ENSG1", 1))
    .await
    .unwrap();
  assert_eq!(n, 0);
  assert_eq!(s.expression_count(study).await.unwrap(), 2);

  let state = s.load_resume_state("GSE1".into()).await.unwrap().unwrap();
  assert!(state.metadata_loaded);
  assert_eq!(state.last_processed_gene.as_deref(), Some("ENSG1"));
  assert_eq!(state.last_sample_index, 1);

  let cp = s.latest_checkpoint(run.run_id, Some("GSE1".into())).await.unwrap().unwrap();
  assert_eq!(cp.batch_index, 1);
  assert_eq!(cp.table_name, EXPRESSION_TABLE);
  assert!(s.latest_checkpoint(run.run_id, Some("GSE404".into())).await.unwrap().is_none());

  let matrix = s.load_expression_matrix(study).await.unwrap();
  assert_eq!(matrix[&gene].len(), 2);
}

#[tokio::test]
async fn failed_batch_leaves_no_trace() {
  let s = store().await;
  let run = s.begin_run("hash".into()).await.unwrap();
  let (study, gene, samples) = seeded(&s).await;

  // The second fact references a sample that does not exist.
  let facts = vec![
    ExpressionFact { sample_key: samples[0], gene_key: gene, value: 1.0 },
    ExpressionFact { sample_key: 9_999, gene_key: gene, value: 2.0 },
  ];
  let err = s
    .insert_expression_batch(batch(run.run_id, study, 0, facts, "ENSG1", 1))
    .await
    .unwrap_err();
  assert!(!err.is_transient());

  assert_eq!(s.expression_count(study).await.unwrap(), 0);
  assert!(s.load_resume_state("GSE1".into()).await.unwrap().is_none());
  assert!(s.latest_checkpoint(run.run_id, None).await.unwrap().is_none());
}

// ─── Resume state ────────────────────────────────────────────────────────────

#[tokio::test]
async fn resume_state_round_trip_and_clear() {
  let s = store().await;
  assert!(s.load_resume_state("GSE1".into()).await.unwrap().is_none());

  let mut state = StudyResumeState::new("GSE1");
  state.metadata_loaded = true;
  s.save_resume_state(state.clone()).await.unwrap();
  state.last_processed_gene = Some("ENSG3".into());
  state.last_sample_index = 7;
  s.save_resume_state(state).await.unwrap();

  let loaded = s.load_resume_state("GSE1".into()).await.unwrap().unwrap();
  assert_eq!(loaded.last_processed_gene.as_deref(), Some("ENSG3"));
  assert_eq!(loaded.last_sample_index, 7);
  assert_eq!(s.list_resume_states().await.unwrap().len(), 1);

  s.clear_resume_state("GSE1".into()).await.unwrap();
  assert!(s.list_resume_states().await.unwrap().is_empty());
}

// ─── Correlations ────────────────────────────────────────────────────────────

fn corr(a: i64, b: i64, illness_key: Option<i64>, study_key: i64) -> CorrelationRecord {
  CorrelationRecord {
    gene_a_key: a,
    gene_b_key: b,
    illness_key,
    study_key,
    rho: 0.5,
    p_value: 0.1,
    q_value: Some(0.2),
    n_samples: 3,
    computed_at: Utc::now(),
  }
}

#[tokio::test]
async fn replace_correlations_deletes_previous_rows() {
  let s = store().await;
  let study = s.insert_dimension(DimensionKind::Study, "GSE1".into()).await.unwrap();
  let g1 = s.insert_dimension(DimensionKind::Gene, "ENSG1".into()).await.unwrap();
  let g2 = s.insert_dimension(DimensionKind::Gene, "ENSG2".into()).await.unwrap();
  let g3 = s.insert_dimension(DimensionKind::Gene, "ENSG3".into()).await.unwrap();

  let written = s
    .replace_correlations(study, vec![corr(g1, g2, None, study), corr(g1, g3, None, study)])
    .await
    .unwrap();
  assert_eq!(written, 2);

  s.replace_correlations(study, vec![corr(g2, g3, None, study)]).await.unwrap();
  let stored = s.correlations(study).await.unwrap();
  assert_eq!(stored.len(), 1);
  assert_eq!((stored[0].gene_a_key, stored[0].gene_b_key), (g2, g3));
  assert_eq!(stored[0].q_value, Some(0.2));

  s.replace_correlations(study, vec![]).await.unwrap();
  assert!(s.correlations(study).await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_pair_in_one_cohort_is_rejected_atomically() {
  let s = store().await;
  let study = s.insert_dimension(DimensionKind::Study, "GSE1".into()).await.unwrap();
  let g1 = s.insert_dimension(DimensionKind::Gene, "ENSG1".into()).await.unwrap();
  let g2 = s.insert_dimension(DimensionKind::Gene, "ENSG2".into()).await.unwrap();
  s.replace_correlations(study, vec![corr(g1, g2, None, study)]).await.unwrap();

  let result = s
    .replace_correlations(study, vec![corr(g1, g2, None, study), corr(g1, g2, None, study)])
    .await;
  assert!(matches!(result, Err(Error::Database(_))));
  assert_eq!(s.correlations(study).await.unwrap().len(), 1);
}

// ─── Runs ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn run_lifecycle_and_report() {
  let s = store().await;
  let run = s.begin_run("abc".into()).await.unwrap();
  assert_eq!(run.status, RunStatus::Running);

  s.record_metrics(run.run_id, "GSE1".into(), vec![
    Metric::new("samples", 3.0),
    Metric::new("expression_records", 12.0),
  ])
  .await
  .unwrap();
  s.record_metrics(run.run_id, "GSE2".into(), vec![Metric::new("samples", 5.0)])
    .await
    .unwrap();
  s.finish_run(run.run_id, RunStatus::Partial).await.unwrap();

  let fetched = s.get_run(run.run_id).await.unwrap().unwrap();
  assert_eq!(fetched.status, RunStatus::Partial);
  assert!(fetched.finished_at.is_some());
  assert_eq!(fetched.config_hash, "abc");

  let report = s.report(run.run_id).await.unwrap();
  assert_eq!(report.status, Some(RunStatus::Partial));
  assert_eq!(report.studies.len(), 2);
  assert_eq!(report.studies["GSE1"]["expression_records"], 12.0);
  assert_eq!(report.studies["GSE2"]["samples"], 5.0);

  let empty = s.report(Uuid::new_v4()).await.unwrap();
  assert!(empty.run_id.is_none());
  assert!(empty.studies.is_empty());
}

#[tokio::test]
async fn rollback_removes_only_the_target_run() {
  let s = store().await;
  let (study, gene, samples) = seeded(&s).await;
  let keep = s.begin_run("h".into()).await.unwrap();
  let discard = s.begin_run("h".into()).await.unwrap();

  let fact = |sample_key| ExpressionFact { sample_key, gene_key: gene, value: 0.5 };
  s.insert_expression_batch(batch(keep.run_id, study, 0, vec![fact(samples[0])], "ENSG1", 0))
    .await
    .unwrap();
  s.insert_expression_batch(batch(discard.run_id, study, 0, vec![fact(samples[1])], "ENSG1", 1))
    .await
    .unwrap();
  s.record_metrics(keep.run_id, "GSE1".into(), vec![Metric::new("samples", 2.0)]).await.unwrap();
  s.record_metrics(discard.run_id, "GSE1".into(), vec![Metric::new("samples", 2.0)]).await.unwrap();

  let summary = s.rollback_run(discard.run_id).await.unwrap();
  assert_eq!(summary.expression_facts, 1);
  assert_eq!(summary.metrics, 1);
  assert_eq!(summary.checkpoints, 1);
  assert_eq!(summary.runs, 1);
  assert_eq!(summary.resume_states, 1);
  assert!(s.load_resume_state("GSE1".into()).await.unwrap().is_none());

  assert!(s.get_run(discard.run_id).await.unwrap().is_none());
  assert!(s.get_run(keep.run_id).await.unwrap().is_some());
  assert_eq!(s.expression_count(study).await.unwrap(), 1);
  assert!(s.latest_checkpoint(keep.run_id, None).await.unwrap().is_some());
  assert_eq!(s.report(keep.run_id).await.unwrap().studies.len(), 1);
  // Dimensions survive.
  assert_eq!(s.load_dimensions().await.unwrap().samples.len(), 2);

  let again = s.rollback_run(discard.run_id).await.unwrap();
  assert_eq!(again.runs, 0);
}
