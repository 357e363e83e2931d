//! Pipeline settings.
//!
//! Loaded with the `config` crate from a file (YAML, TOML, JSON, …) layered
//! under `COEXPR__`-prefixed environment variables, e.g.
//! `COEXPR__DATABASE__BATCH_SIZE=500`.

use std::{path::{Path, PathBuf}, str::FromStr as _, time::Duration};

use coexpr_core::{correlation::DEFAULT_MIN_SAMPLES, retry::RetryPolicy};
use coexpr_tsv::FieldMappings;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::level_filters::LevelFilter;

use crate::{Error, Result};

/// Upper bound for the retry backoff settings, one day.
const MAX_BACKOFF_SECONDS: f64 = 86_400.0;

fn backoff(secs: f64) -> Duration {
  Duration::try_from_secs_f64(secs.min(MAX_BACKOFF_SECONDS)).unwrap_or_default()
}

// ─── Sections ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
  pub path:                      PathBuf,
  pub batch_size:                usize,
  pub max_retries:               u32,
  pub retry_backoff_seconds:     f64,
  pub retry_backoff_max_seconds: f64,
  pub busy_timeout_ms:           u64,
}

impl Default for DatabaseSettings {
  fn default() -> Self {
    Self {
      path:                      PathBuf::new(),
      batch_size:                1000,
      max_retries:               5,
      retry_backoff_seconds:     1.0,
      retry_backoff_max_seconds: 30.0,
      busy_timeout_ms:           5000,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingSettings {
  pub input_directory:          PathBuf,
  pub gene_filter_file:         PathBuf,
  pub max_concurrent_studies:   usize,
  pub min_samples:              usize,
  pub enforce_required_columns: bool,
}

impl Default for ProcessingSettings {
  fn default() -> Self {
    Self {
      input_directory:          PathBuf::new(),
      gene_filter_file:         PathBuf::new(),
      max_concurrent_studies:   1,
      min_samples:              DEFAULT_MIN_SAMPLES,
      enforce_required_columns: true,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
  pub level:               String,
  pub log_record_counts:   bool,
  pub log_data_quality:    bool,
  pub log_processing_time: bool,
}

impl Default for LoggingSettings {
  fn default() -> Self {
    Self {
      level:               "info".to_owned(),
      log_record_counts:   true,
      log_data_quality:    true,
      log_processing_time: true,
    }
  }
}

// ─── Settings ────────────────────────────────────────────────────────────────

/// Everything a run needs; passed explicitly to the orchestrator and cloned
/// into each worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
  pub database:       DatabaseSettings,
  pub processing:     ProcessingSettings,
  pub logging:        LoggingSettings,
  pub field_mappings: FieldMappings,
}

impl Settings {
  /// Read `path` (if it exists) plus environment overrides, then validate.
  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    let settings: Settings = config::Config::builder()
      .add_source(config::File::from(path.as_ref()).required(false))
      .add_source(
        config::Environment::with_prefix("COEXPR")
          .prefix_separator("__")
          .separator("__")
          .try_parsing(true),
      )
      .build()
      .and_then(|c| c.try_deserialize())
      .map_err(|e| Error::Configuration(e.to_string()))?;
    settings.validate()?;
    Ok(settings)
  }

  /// Reject settings the pipeline cannot run with.
  pub fn validate(&self) -> Result<()> {
    let invalid = |message: String| Err(Error::Configuration(message));

    if self.database.path.as_os_str().is_empty() {
      return invalid("database.path is required".into());
    }
    if self.processing.input_directory.as_os_str().is_empty() {
      return invalid("processing.input_directory is required".into());
    }
    if self.processing.gene_filter_file.as_os_str().is_empty() {
      return invalid("processing.gene_filter_file is required".into());
    }
    if self.database.batch_size == 0 {
      return invalid("database.batch_size must be at least 1".into());
    }
    if self.processing.max_concurrent_studies == 0 {
      return invalid("processing.max_concurrent_studies must be at least 1".into());
    }
    if self.processing.min_samples < 2 {
      return invalid(format!(
        "processing.min_samples must be at least 2, got {}",
        self.processing.min_samples
      ));
    }
    for (name, secs) in [
      ("retry_backoff_seconds", self.database.retry_backoff_seconds),
      ("retry_backoff_max_seconds", self.database.retry_backoff_max_seconds),
    ] {
      if !secs.is_finite() || !(0.0..=MAX_BACKOFF_SECONDS).contains(&secs) {
        return invalid(format!(
          "database.{name} must be between 0 and {MAX_BACKOFF_SECONDS} seconds, got {secs}"
        ));
      }
    }
    let empty = self.field_mappings.empty_lists();
    if !empty.is_empty() {
      return invalid(format!(
        "field_mappings lists must not be empty: {}",
        empty.join(", ")
      ));
    }
    if LevelFilter::from_str(&self.logging.level).is_err() {
      return invalid(format!("unknown logging.level {:?}", self.logging.level));
    }
    Ok(())
  }

  /// Retry policy for store writes.
  ///
  /// Backoffs outside what [`validate`](Self::validate) accepts are clamped.
  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy::new(
      self.database.max_retries,
      backoff(self.database.retry_backoff_seconds),
      backoff(self.database.retry_backoff_max_seconds),
    )
  }

  pub fn busy_timeout(&self) -> Duration {
    Duration::from_millis(self.database.busy_timeout_ms)
  }

  /// The configured log level; `INFO` when unparseable.
  pub fn level_filter(&self) -> LevelFilter {
    LevelFilter::from_str(&self.logging.level).unwrap_or(LevelFilter::INFO)
  }

  /// Hex SHA-256 of the canonical JSON form, recorded on every run.
  pub fn config_hash(&self) -> String {
    let canonical = serde_json::to_vec(self).unwrap_or_default();
    hex::encode(Sha256::digest(&canonical))
  }
}
