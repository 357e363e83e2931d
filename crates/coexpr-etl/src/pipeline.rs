//! The run orchestrator.
//!
//! ```text
//! run_pipeline()
//!   ├─ load gene filter, discover study units, open the run
//!   └─ JoinSet of study workers, at most `max_concurrent_studies` at once
//!        └─ Worker::process_study()
//!             Discovered → MetadataLoaded → ExpressionIngesting
//!               → CorrelationComputed → Completed
//! ```
//!
//! Each worker opens its own store session and dimension cache. A failing
//! study keeps its resume state and does not affect its siblings.

use std::{
  collections::{HashMap, HashSet},
  fmt,
  sync::Arc,
  time::Instant,
};

use coexpr_core::{
  correlation::compute_correlations,
  dimension::{DimensionKind, MetadataQuality, known},
  fact::{ExpressionBatch, ExpressionFact},
  reconcile::Reconciler,
  run::{Metric, RunStatus, StudyResumeState},
  store::EtlStore,
};
use coexpr_tsv::{ExpressionReader, load_gene_filter, load_metadata};
use serde::Serialize;
use tokio::{
  sync::Semaphore,
  task::{JoinSet, block_in_place},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
  Error, Result, Settings,
  discovery::{StudyUnit, discover},
  runs::open_store,
};

// ─── Stages & results ────────────────────────────────────────────────────────

/// Progress of one study through a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StudyStage {
  Discovered,
  MetadataLoaded,
  ExpressionIngesting,
  CorrelationComputed,
  Completed,
}

impl fmt::Display for StudyStage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Discovered => "discovered",
      Self::MetadataLoaded => "metadata_loaded",
      Self::ExpressionIngesting => "expression_ingesting",
      Self::CorrelationComputed => "correlation_computed",
      Self::Completed => "completed",
    })
  }
}

/// Figures recorded as metrics for every completed study.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StudyMetrics {
  pub samples:            usize,
  pub age_completion:     f64,
  pub sex_completion:     f64,
  pub expression_records: usize,
  pub genes:              usize,
  pub correlations:       usize,
  pub elapsed_seconds:    f64,
}

impl StudyMetrics {
  fn to_metrics(self) -> Vec<Metric> {
    vec![
      Metric::new("samples", self.samples as f64),
      Metric::new("age_completion", self.age_completion),
      Metric::new("sex_completion", self.sex_completion),
      Metric::new("expression_records", self.expression_records as f64),
      Metric::new("genes", self.genes as f64),
      Metric::new("correlations", self.correlations as f64),
      Metric::new("elapsed_seconds", self.elapsed_seconds),
    ]
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
  pub run_id:    Uuid,
  pub status:    RunStatus,
  pub succeeded: Vec<String>,
  pub failed:    Vec<String>,
  /// Workers that panicked or were cancelled before reporting a study.
  pub aborted:   usize,
}

impl RunSummary {
  pub fn failed_count(&self) -> usize { self.failed.len() + self.aborted }
}

// ─── Worker ──────────────────────────────────────────────────────────────────

/// State shared read-only by every study worker of a run.
struct Worker {
  settings:    Settings,
  gene_filter: HashSet<String>,
  run_id:      Uuid,
}

impl Worker {
  async fn process_study(&self, unit: &StudyUnit) -> Result<StudyMetrics> {
    let mut stage = StudyStage::Discovered;
    info!(study = %unit.accession, dir = %unit.directory.display(), "starting study");
    match self.ingest(unit, &mut stage).await {
      Ok(metrics) => Ok(metrics),
      Err(source) => Err(Error::StudyFailed {
        study: unit.accession.clone(),
        stage,
        source: Box::new(source),
      }),
    }
  }

  async fn ingest(&self, unit: &StudyUnit, stage: &mut StudyStage) -> Result<StudyMetrics> {
    let started = Instant::now();
    let settings = &self.settings;
    let logging = &settings.logging;
    let policy = settings.retry_policy();
    let accession = unit.accession.as_str();

    let store = open_store(settings).await?;
    let mut reconciler = Reconciler::bootstrap(&store, policy.clone()).await?;

    let mut state = policy
      .run("load resume state", || store.load_resume_state(accession.to_owned()))
      .await?
      .unwrap_or_else(|| StudyResumeState::new(accession));
    if let Some(gene) = &state.last_processed_gene {
      info!(study = accession, gene = %gene, index = state.last_sample_index, "resuming study");
    }

    // ── Metadata ──────────────────────────────────────────────────────────

    let (samples, quality) = block_in_place(|| {
      load_metadata(
        &unit.metadata_file,
        &settings.field_mappings,
        settings.processing.enforce_required_columns,
      )
    })?;
    if samples.is_empty() {
      return Err(Error::StudyProcessing(format!(
        "no valid samples in {}",
        unit.metadata_file.display()
      )));
    }

    let study_accession = samples
      .iter()
      .find_map(|s| known(&s.study_accession))
      .unwrap_or(accession)
      .to_owned();
    for sample in &samples {
      if let Some(other) = known(&sample.study_accession)
        && other != study_accession
      {
        warn!(
          study = %study_accession,
          sample = %sample.accession,
          other,
          "sample references a different study accession"
        );
      }
    }

    let study_key = reconciler.get_or_create(DimensionKind::Study, &study_accession).await?;
    if state.metadata_loaded && reconciler.has_samples(study_key, &samples) {
      debug!(study = accession, "metadata already loaded");
    } else {
      reconciler.upsert_samples(study_key, &samples).await?;
    }
    state.metadata_loaded = true;
    policy.run("save resume state", || store.save_resume_state(state.clone())).await?;
    *stage = StudyStage::MetadataLoaded;

    if logging.log_record_counts {
      info!(study = accession, samples = samples.len(), "metadata processed");
    }
    if logging.log_data_quality {
      log_quality(accession, &quality);
    }

    // ── Expression ────────────────────────────────────────────────────────

    *stage = StudyStage::ExpressionIngesting;
    let mut sample_keys = HashMap::new();
    let mut expected = Vec::new();
    for sample in &samples {
      let key = reconciler.sample_key(&sample.accession, study_key).ok_or_else(|| {
        Error::StudyProcessing(format!(
          "sample {} has no key in study {study_accession}",
          sample.accession
        ))
      })?;
      if sample_keys.insert(sample.accession.clone(), key).is_none() {
        expected.push(sample.accession.clone());
      }
    }

    let mut reader = block_in_place(|| {
      ExpressionReader::open(
        &unit.expression_file,
        &self.gene_filter,
        &expected,
        state.resume_position(),
      )
    })?;
    debug!(
      study = accession,
      columns = reader.sample_headers().len(),
      known_samples = expected.len(),
      "expression file opened"
    );

    let batch_size = settings.database.batch_size;
    let mut batch_index = 0u64;
    let mut inserted = 0usize;
    let mut genes = HashSet::new();
    loop {
      let rows = block_in_place(|| {
        reader.by_ref().take(batch_size).collect::<coexpr_tsv::Result<Vec<_>>>()
      })?;
      let Some(last) = rows.last() else { break };
      let cursor = last.position();

      let mut facts = Vec::with_capacity(rows.len());
      for row in &rows {
        let Some(&sample_key) = sample_keys.get(&row.sample_accession) else {
          continue;
        };
        let gene_key = reconciler.get_or_create(DimensionKind::Gene, &row.gene_id).await?;
        genes.insert(gene_key);
        facts.push(ExpressionFact { sample_key, gene_key, value: row.value });
      }

      let batch = ExpressionBatch {
        run_id: self.run_id,
        study_key,
        study_accession: accession.to_owned(),
        batch_index,
        facts,
        cursor,
      };
      let written = policy
        .run("insert expression batch", || store.insert_expression_batch(batch.clone()))
        .await?;
      debug!(study = accession, batch = batch_index, rows = rows.len(), written, "batch committed");
      inserted += written;
      batch_index += 1;

      if rows.len() < batch_size {
        break;
      }
    }

    if logging.log_record_counts {
      info!(study = accession, records = inserted, genes = genes.len(), "expression processed");
    }

    // ── Correlation ───────────────────────────────────────────────────────

    let matrix =
      policy.run("load expression matrix", || store.load_expression_matrix(study_key)).await?;
    let cohorts = policy.run("load cohorts", || store.load_cohorts(study_key)).await?;
    let min_samples = settings.processing.min_samples;
    let records =
      block_in_place(|| compute_correlations(&matrix, &cohorts, study_key, min_samples));
    let correlations = policy
      .run("replace correlations", || store.replace_correlations(study_key, records.clone()))
      .await?;
    *stage = StudyStage::CorrelationComputed;

    if logging.log_record_counts {
      info!(study = accession, correlations, "correlations computed");
    }

    // ── Bookkeeping ───────────────────────────────────────────────────────

    let metrics = StudyMetrics {
      samples: samples.len(),
      age_completion: quality.age_completion(),
      sex_completion: quality.sex_completion(),
      expression_records: inserted,
      genes: genes.len(),
      correlations,
      elapsed_seconds: started.elapsed().as_secs_f64(),
    };
    policy
      .run("record metrics", || {
        store.record_metrics(self.run_id, accession.to_owned(), metrics.to_metrics())
      })
      .await?;
    policy.run("clear resume state", || store.clear_resume_state(accession.to_owned())).await?;
    *stage = StudyStage::Completed;

    if logging.log_processing_time {
      info!(study = accession, elapsed_seconds = metrics.elapsed_seconds, "study completed");
    }
    Ok(metrics)
  }
}

fn log_quality(accession: &str, quality: &MetadataQuality) {
  info!(
    study = accession,
    age_completion = quality.age_completion(),
    sex_completion = quality.sex_completion(),
    "metadata quality"
  );
}

// ─── Run ─────────────────────────────────────────────────────────────────────

/// Process every discovered study of `settings.processing.input_directory`
/// under a new run.
///
/// Study failures are logged and counted; only failures outside any study
/// (settings, gene filter, discovery, opening the run) are returned as
/// errors. Must be called from a multi-threaded tokio runtime.
pub async fn run_pipeline(settings: Settings) -> Result<RunSummary> {
  settings.validate()?;
  let policy = settings.retry_policy();

  let gene_filter =
    block_in_place(|| load_gene_filter(&settings.processing.gene_filter_file))?;
  info!(genes = gene_filter.len(), "loaded gene filter");

  let input = settings.processing.input_directory.clone();
  let discovery = block_in_place(|| discover(&input))?;
  if discovery.studies.is_empty() {
    warn!(dir = %input.display(), "no studies found");
  }

  let store = open_store(&settings).await?;
  let config_hash = settings.config_hash();
  let run = policy.run("begin run", || store.begin_run(config_hash.clone())).await?;
  let run_id = run.run_id;

  let workers = settings.processing.max_concurrent_studies.max(1);
  info!(
    %run_id,
    studies = discovery.studies.len(),
    workers,
    "run started"
  );

  let worker = Arc::new(Worker { settings, gene_filter, run_id });
  let permits = Arc::new(Semaphore::new(workers));
  let mut tasks = JoinSet::new();
  for unit in discovery.studies {
    let worker = Arc::clone(&worker);
    let permits = Arc::clone(&permits);
    tasks.spawn(async move {
      let outcome = match permits.acquire_owned().await {
        Ok(_permit) => worker.process_study(&unit).await,
        Err(e) => Err(Error::WorkerPool(e.to_string())),
      };
      (unit.accession, outcome)
    });
  }

  let mut succeeded = Vec::new();
  let mut failed = Vec::new();
  let mut aborted = 0;
  while let Some(joined) = tasks.join_next().await {
    match joined {
      Ok((study, Ok(_))) => succeeded.push(study),
      Ok((study, Err(e))) => {
        error!(%run_id, study = %study, error = %e, "study failed");
        failed.push(study);
      }
      Err(e) => {
        error!(%run_id, error = %Error::Join(e), "study worker aborted");
        aborted += 1;
      }
    }
  }
  succeeded.sort();
  failed.sort();

  let status = RunStatus::from_outcome(succeeded.len(), failed.len() + aborted);
  policy.run("finish run", || store.finish_run(run_id, status)).await?;
  info!(
    %run_id,
    %status,
    succeeded = succeeded.len(),
    failed = failed.len() + aborted,
    "run finished"
  );

  Ok(RunSummary { run_id, status, succeeded, failed, aborted })
}
