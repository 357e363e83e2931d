//! Error types for the coexpr-tsv readers.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("metadata file {path}: {message}")]
  MetadataFormat { path: PathBuf, message: String },

  #[error("expression file {path}: {message}")]
  ExpressionFormat { path: PathBuf, message: String },

  #[error("gene filter {path}: {message}")]
  GeneFilter { path: PathBuf, message: String },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("tsv error: {0}")]
  Csv(#[from] csv::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
