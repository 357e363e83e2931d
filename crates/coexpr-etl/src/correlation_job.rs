//! Standalone correlation refresh over already-loaded expression facts.

use std::{collections::HashSet, time::Instant};

use coexpr_core::{
  correlation::compute_correlations,
  dimension::StudyDescriptor,
  retry::RetryPolicy,
  store::EtlStore,
};
use coexpr_store_sqlite::SqliteStore;
use serde::Serialize;
use tokio::task::block_in_place;
use tracing::{debug, error, info, warn};

use crate::{Result, Settings, runs::open_store};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
  /// Studies whose correlations were recomputed.
  pub refreshed: Vec<String>,
  /// Studies without expression facts whose correlations were removed.
  pub cleared:   Vec<String>,
  /// Requested accessions that are not known to the store.
  pub missing:   Vec<String>,
  pub failed:    Vec<String>,
}

/// Recompute the correlations of `studies`, or of every study when empty.
///
/// Failures are per study and reported in the summary.
pub async fn refresh_correlations(
  settings: &Settings,
  studies: &[String],
) -> Result<RefreshSummary> {
  let policy = settings.retry_policy();
  let store = open_store(settings).await?;
  let min_samples = settings.processing.min_samples;

  let with_expression = policy.run("list studies", || store.studies_with_expression()).await?;
  let dimensions = policy.run("load dimensions", || store.load_dimensions()).await?;
  let loaded: HashSet<&str> = with_expression.iter().map(|s| s.accession.as_str()).collect();
  let requested: HashSet<&str> = studies.iter().map(String::as_str).collect();
  let wanted = |accession: &str| requested.is_empty() || requested.contains(accession);

  let mut summary = RefreshSummary::default();
  for accession in studies {
    if !loaded.contains(accession.as_str()) && !dimensions.studies.contains_key(accession) {
      warn!(study = %accession, "requested study is unknown");
      summary.missing.push(accession.clone());
    }
  }

  // Stale correlations of studies that have no expression facts.
  let mut empty: Vec<(&String, &i64)> = dimensions
    .studies
    .iter()
    .filter(|(acc, _)| !loaded.contains(acc.as_str()) && wanted(acc.as_str()))
    .collect();
  empty.sort();
  for (accession, &study_key) in empty {
    match policy.run("clear correlations", || store.replace_correlations(study_key, Vec::new())).await
    {
      Ok(_) => {
        debug!(study = %accession, "no expression data, correlations cleared");
        summary.cleared.push(accession.clone());
      }
      Err(e) => {
        error!(study = %accession, error = %e, "clearing correlations failed");
        summary.failed.push(accession.clone());
      }
    }
  }

  for study in with_expression.iter().filter(|s| wanted(s.accession.as_str())) {
    match refresh_study(&store, &policy, study, min_samples).await {
      Ok(_) => summary.refreshed.push(study.accession.clone()),
      Err(e) => {
        error!(study = %study.accession, error = %e, "correlation refresh failed");
        summary.failed.push(study.accession.clone());
      }
    }
  }

  info!(
    refreshed = summary.refreshed.len(),
    cleared = summary.cleared.len(),
    failed = summary.failed.len(),
    "correlation refresh finished"
  );
  Ok(summary)
}

async fn refresh_study(
  store: &SqliteStore,
  policy: &RetryPolicy,
  study: &StudyDescriptor,
  min_samples: usize,
) -> Result<usize> {
  let study_key = study.study_key;

  let timer = Instant::now();
  let matrix =
    policy.run("load expression matrix", || store.load_expression_matrix(study_key)).await?;
  let cohorts = policy.run("load cohorts", || store.load_cohorts(study_key)).await?;
  let load_ms = timer.elapsed().as_millis() as u64;

  let timer = Instant::now();
  let records = block_in_place(|| compute_correlations(&matrix, &cohorts, study_key, min_samples));
  let compute_ms = timer.elapsed().as_millis() as u64;

  let timer = Instant::now();
  let written = policy
    .run("replace correlations", || store.replace_correlations(study_key, records.clone()))
    .await?;
  let write_ms = timer.elapsed().as_millis() as u64;

  info!(
    study = %study.accession,
    genes = matrix.len(),
    samples = cohorts.len(),
    correlations = written,
    load_ms,
    compute_ms,
    write_ms,
    "correlations refreshed"
  );
  Ok(written)
}
