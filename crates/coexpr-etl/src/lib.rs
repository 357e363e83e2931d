//! The coexpr ETL engine.
//!
//! Ties the readers of [`coexpr_tsv`], the reconciler and correlation engine
//! of [`coexpr_core`] and the [`coexpr_store_sqlite`] backend together:
//!
//! - [`config::Settings`]: file plus environment configuration
//! - [`discovery::discover`]: find study directories
//! - [`pipeline::run_pipeline`]: the resumable, concurrent study run
//! - [`correlation_job::refresh_correlations`]: recompute correlations only
//! - [`runs`]: resume status, rollback and reports of past runs

pub mod config;
pub mod correlation_job;
pub mod discovery;
pub mod error;
pub mod pipeline;
pub mod runs;

pub use config::Settings;
pub use error::{Error, Result};
pub use pipeline::{RunSummary, run_pipeline};
