//! Error types for `coexpr-core`.

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
  /// A storage operation failed with a non-transient error.
  #[error("store error: {0}")]
  Store(#[source] BoxError),

  /// A storage operation kept failing transiently until the retry budget
  /// ran out.
  #[error("{operation} failed after {attempts} attempt(s): {source}")]
  RetriesExhausted {
    operation: String,
    attempts:  u32,
    #[source]
    source:    BoxError,
  },

  #[error("invalid input: {0}")]
  InvalidInput(String),
}

impl Error {
  pub fn store(e: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Store(Box::new(e))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
