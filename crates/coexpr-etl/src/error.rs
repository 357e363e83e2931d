//! Error types for the coexpr ETL engine.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::StudyStage;

#[derive(Debug, Error)]
pub enum Error {
  /// Invalid settings; raised before any processing starts.
  #[error("configuration error: {0}")]
  Configuration(String),

  #[error("discovery error at {path}: {message}")]
  Discovery { path: PathBuf, message: String },

  #[error(transparent)]
  Tsv(#[from] coexpr_tsv::Error),

  #[error("store error: {0}")]
  Store(#[from] coexpr_store_sqlite::Error),

  #[error(transparent)]
  Core(#[from] coexpr_core::Error),

  #[error("study processing error: {0}")]
  StudyProcessing(String),

  #[error("study {study} failed at stage {stage}: {source}")]
  StudyFailed {
    study:  String,
    stage:  StudyStage,
    #[source]
    source: Box<Error>,
  },

  #[error("run {0} not found")]
  RunNotFound(Uuid),

  #[error("worker pool error: {0}")]
  WorkerPool(String),

  #[error("worker task failed: {0}")]
  Join(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
