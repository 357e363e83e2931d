//! Gene allow-list loaded from a one-column TSV.

use std::{collections::HashSet, path::Path};

use tracing::info;

use crate::{
  error::{Error, Result},
  tsv_reader,
};

const GENE_COLUMN: &str = "ensembl_id";

/// Load the set of Ensembl gene identifiers to keep.
///
/// The file must have an `ensembl_id` column and at least one non-blank
/// identifier.
pub fn load_gene_filter(path: impl AsRef<Path>) -> Result<HashSet<String>> {
  let path = path.as_ref();
  let filter_error = |message: &str| Error::GeneFilter {
    path:    path.to_owned(),
    message: message.to_owned(),
  };

  let mut reader = tsv_reader(path, true)?;
  let column = reader
    .headers()?
    .iter()
    .position(|h| h.trim() == GENE_COLUMN)
    .ok_or_else(|| filter_error("missing 'ensembl_id' column"))?;

  let mut genes = HashSet::new();
  for record in reader.records() {
    let record = record?;
    if let Some(id) = record.get(column).map(str::trim).filter(|id| !id.is_empty()) {
      genes.insert(id.to_owned());
    }
  }
  if genes.is_empty() {
    return Err(filter_error("no gene identifiers"));
  }

  info!(path = %path.display(), genes = genes.len(), "gene filter loaded");
  Ok(genes)
}
