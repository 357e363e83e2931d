//! Core types and trait definitions for the coexpr ETL engine.
//!
//! This crate is free of file-format and database dependencies. It holds the
//! star-schema domain model, the [`store::EtlStore`] abstraction implemented
//! by storage backends, the dimension reconciler, the retry policy and the
//! gene-pair correlation engine.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod correlation;
pub mod dimension;
pub mod error;
pub mod fact;
pub mod reconcile;
pub mod retry;
pub mod run;
pub mod stats;
pub mod store;

pub use error::{Error, Result};
