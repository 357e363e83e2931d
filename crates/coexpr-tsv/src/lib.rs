//! Tab-separated readers for coexpr studies.
//!
//! Converts study files into [`coexpr_core`] domain types. Pure synchronous
//! file I/O; no database dependencies.
//!
//! # Quick start
//!
//! ```no_run
//! use coexpr_tsv::{FieldMappings, load_gene_filter, load_metadata, ExpressionReader};
//!
//! let genes = load_gene_filter("genes.tsv").unwrap();
//! let (samples, quality) =
//!   load_metadata("GSE1/metadata_GSE1.tsv", &FieldMappings::default(), true).unwrap();
//! let expected: Vec<String> = samples.iter().map(|s| s.accession.clone()).collect();
//!
//! for row in ExpressionReader::open("GSE1/expression_GSE1.tsv", &genes, &expected, None).unwrap() {
//!   let row = row.unwrap();
//!   println!("{} {} {}", row.gene_id, row.sample_accession, row.value);
//! }
//! println!("{} samples, {:.0}% with age", quality.total_samples, quality.age_completion() * 100.0);
//! ```

use std::{fs::File, path::Path};

pub mod error;
mod expression;
mod gene_filter;
mod metadata;

pub use error::{Error, Result};
pub use expression::ExpressionReader;
pub use gene_filter::load_gene_filter;
pub use metadata::{FieldMappings, load_metadata};

/// A flexible, tab-delimited reader over `path`.
fn tsv_reader(path: &Path, has_headers: bool) -> Result<csv::Reader<File>> {
  let file = File::open(path)?;
  Ok(
    csv::ReaderBuilder::new()
      .delimiter(b'\t')
      .has_headers(has_headers)
      .flexible(true)
      .from_reader(file),
  )
}
