//! Error type for `coexpr-store-sqlite`.

use coexpr_core::{dimension::DimensionKind, retry::Transient};
use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("unknown run status: {0:?}")]
  UnknownRunStatus(String),

  /// The conditional insert succeeded but the row could not be read back.
  #[error("{kind} {natural_key:?} missing after insert")]
  MissingDimension { kind: DimensionKind, natural_key: String },
}

fn is_locked(e: &rusqlite::Error) -> bool {
  matches!(
    e.sqlite_error_code(),
    Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
  )
}

impl Transient for Error {
  /// `SQLITE_BUSY` and `SQLITE_LOCKED`: another connection holds the lock.
  fn is_transient(&self) -> bool {
    match self {
      Self::Database(tokio_rusqlite::Error::Rusqlite(e)) | Self::Sqlite(e) => is_locked(e),
      _ => false,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
