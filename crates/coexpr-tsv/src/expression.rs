//! Streaming reader for wide expression TSVs.
//!
//! The file has one gene per row and one sample per column after the first.
//! Cells are emitted one at a time so that arbitrarily large files can be
//! ingested in bounded memory.

use std::{
  collections::{HashSet, VecDeque},
  fs::File,
  path::{Path, PathBuf},
};

use coexpr_core::fact::{ExpressionRow, ResumePosition};
use csv::{StringRecord, StringRecordsIntoIter};
use tracing::{debug, warn};

use crate::{
  error::{Error, Result},
  tsv_reader,
};

fn format_error(path: &Path, message: impl Into<String>) -> Error {
  Error::ExpressionFormat { path: path.to_owned(), message: message.into() }
}

/// Lazy, finite iterator of expression cells for the allowed genes and
/// expected samples.
///
/// With a resume position, rows are skipped until its gene; within that
/// gene, cells before its sample index are skipped. Structural problems
/// detected while reading are yielded as `Err` items.
pub struct ExpressionReader<'a> {
  path:           PathBuf,
  records:        StringRecordsIntoIter<File>,
  sample_headers: Vec<String>,
  /// Per sample column: is it one of the expected samples.
  selected:       Vec<bool>,
  allowed_genes:  &'a HashSet<String>,
  resume:         Option<ResumePosition>,
  pending:        VecDeque<ExpressionRow>,
}

impl<'a> ExpressionReader<'a> {
  pub fn open(
    path: impl AsRef<Path>,
    allowed_genes: &'a HashSet<String>,
    expected_samples: &[String],
    resume: Option<ResumePosition>,
  ) -> Result<Self> {
    let path = path.as_ref();
    if expected_samples.is_empty() {
      return Err(format_error(path, "no expected sample columns"));
    }

    let mut records = tsv_reader(path, false)?.into_records();
    let header = match records.next() {
      Some(header) => header?,
      None => return Err(format_error(path, "file is empty")),
    };
    if header.len() < 2 {
      return Err(format_error(
        path,
        "must contain a gene column and at least one sample column",
      ));
    }
    let first = header.get(0).unwrap_or("").trim();
    if !first.eq_ignore_ascii_case("gene") && !first.eq_ignore_ascii_case("ensembl_id") {
      return Err(format_error(path, "must begin with a gene identifier column"));
    }

    let sample_headers: Vec<String> =
      header.iter().skip(1).map(|h| h.trim().to_owned()).collect();
    let present: HashSet<&str> = sample_headers.iter().map(String::as_str).collect();
    let missing: Vec<&str> = expected_samples
      .iter()
      .map(String::as_str)
      .filter(|s| !present.contains(s))
      .collect();
    if missing.len() == expected_samples.len() {
      return Err(format_error(path, "none of the expected sample columns are present"));
    }
    if !missing.is_empty() {
      warn!(
        path = %path.display(),
        missing = ?missing,
        "expression file is missing expected sample columns"
      );
    }

    let expected: HashSet<&str> = expected_samples.iter().map(String::as_str).collect();
    let selected = sample_headers.iter().map(|h| expected.contains(h.as_str())).collect();

    if let Some(resume) = &resume {
      debug!(path = %path.display(), gene = %resume.gene_id, index = resume.sample_index, "resuming expression stream");
    }

    Ok(Self {
      path: path.to_owned(),
      records,
      sample_headers,
      selected,
      allowed_genes,
      resume,
      pending: VecDeque::new(),
    })
  }

  /// Sample column names in file order.
  pub fn sample_headers(&self) -> &[String] { &self.sample_headers }

  /// Queue the cells of one data row.
  fn expand(&mut self, record: &StringRecord) {
    let gene_id = record.get(0).unwrap_or("").trim();
    if gene_id.is_empty() {
      return;
    }

    let mut skip_before = 0;
    if let Some(resume) = &self.resume {
      if gene_id != resume.gene_id {
        return;
      }
      skip_before = resume.sample_index;
      self.resume = None;
    }

    if !self.allowed_genes.contains(gene_id) {
      return;
    }

    for (index, raw) in record.iter().skip(1).enumerate() {
      if index < skip_before || !self.selected.get(index).copied().unwrap_or(false) {
        continue;
      }
      let sample = &self.sample_headers[index];
      match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => self.pending.push_back(ExpressionRow {
          gene_id: gene_id.to_owned(),
          sample_accession: sample.clone(),
          value,
          sample_index: index,
        }),
        _ => warn!(
          path = %self.path.display(),
          gene = gene_id,
          sample = %sample,
          value = raw,
          "skipping invalid expression value"
        ),
      }
    }
  }
}

impl Iterator for ExpressionReader<'_> {
  type Item = Result<ExpressionRow>;

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      if let Some(row) = self.pending.pop_front() {
        return Some(Ok(row));
      }
      match self.records.next() {
        Some(Ok(record)) => self.expand(&record),
        Some(Err(e)) => return Some(Err(e.into())),
        None => {
          if let Some(resume) = self.resume.take() {
            warn!(
              path = %self.path.display(),
              gene = %resume.gene_id,
              "expression file ended before the resume gene was reached"
            );
          }
          return None;
        }
      }
    }
  }
}
