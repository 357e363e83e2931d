//! Sample metadata transform.
//!
//! Pipeline:
//!   metadata TSV
//!     └─ HeaderIndex::resolve()   → column per candidate header
//!          └─ first_non_empty()   → normalised field or UNKNOWN
//!               └─ SampleRecord   → accumulate quality counters

use std::path::Path;

use coexpr_core::dimension::{MetadataQuality, SampleRecord, UNKNOWN};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
  error::{Error, Result},
  tsv_reader,
};

const SAMPLE_COLUMN: &str = "refinebio_accession_code";
const STUDY_COLUMN: &str = "experiment_accession";

// ─── Field mappings ──────────────────────────────────────────────────────────

/// Candidate headers for each optional field, in priority order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMappings {
  pub age_fields:      Vec<String>,
  pub sex_fields:      Vec<String>,
  pub illness_fields:  Vec<String>,
  pub platform_fields: Vec<String>,
}

impl Default for FieldMappings {
  /// refine.bio conventions.
  fn default() -> Self {
    fn owned(names: &[&str]) -> Vec<String> {
      names.iter().map(|s| s.to_string()).collect()
    }
    Self {
      age_fields:      owned(&[
        "refinebio_age",
        "characteristics_ch1_Age",
        "characteristics_ch1_age",
        "MetaSRA_age",
      ]),
      sex_fields:      owned(&[
        "refinebio_sex",
        "characteristics_ch1_Sex",
        "characteristics_ch1_Gender",
        "sex",
      ]),
      illness_fields:  owned(&[
        "characteristics_ch1_Illness",
        "refinebio_disease",
        "illness",
      ]),
      platform_fields: owned(&["refinebio_platform", "platform_id"]),
    }
  }
}

impl FieldMappings {
  /// Names of the candidate lists that are empty.
  pub fn empty_lists(&self) -> Vec<&'static str> {
    [
      ("age_fields", &self.age_fields),
      ("sex_fields", &self.sex_fields),
      ("illness_fields", &self.illness_fields),
      ("platform_fields", &self.platform_fields),
    ]
    .into_iter()
    .filter(|(_, list)| list.is_empty())
    .map(|(name, _)| name)
    .collect()
  }
}

// ─── Header resolution ───────────────────────────────────────────────────────

struct HeaderIndex {
  headers: Vec<String>,
}

fn strip_digits(s: &str) -> String {
  s.chars()
    .filter(|c| !c.is_ascii_digit())
    .map(|c| c.to_ascii_lowercase())
    .collect()
}

impl HeaderIndex {
  fn new(record: &StringRecord) -> Self {
    Self { headers: record.iter().map(|h| h.trim().to_owned()).collect() }
  }

  /// Column of `candidate`: exact match, then case-insensitive, then
  /// case-insensitive ignoring digits (`ch1` matches `ch2`).
  fn resolve(&self, candidate: &str) -> Option<usize> {
    self
      .headers
      .iter()
      .position(|h| h == candidate)
      .or_else(|| self.headers.iter().position(|h| h.eq_ignore_ascii_case(candidate)))
      .or_else(|| {
        let wanted = strip_digits(candidate);
        self.headers.iter().position(|h| strip_digits(h) == wanted)
      })
  }

  fn resolve_all(&self, candidates: &[String]) -> Vec<usize> {
    candidates.iter().filter_map(|c| self.resolve(c)).collect()
  }
}

fn cell<'r>(record: &'r StringRecord, column: Option<usize>) -> &'r str {
  column.and_then(|i| record.get(i)).map(str::trim).unwrap_or("")
}

fn first_non_empty(record: &StringRecord, columns: &[usize]) -> String {
  columns
    .iter()
    .map(|&i| cell(record, Some(i)))
    .find(|v| !v.is_empty())
    .unwrap_or(UNKNOWN)
    .to_owned()
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Read and normalise the samples of one metadata TSV.
///
/// Rows without a sample accession are skipped with a warning. With
/// `enforce_required` the two accession columns must be present.
pub fn load_metadata(
  path: impl AsRef<Path>,
  mappings: &FieldMappings,
  enforce_required: bool,
) -> Result<(Vec<SampleRecord>, MetadataQuality)> {
  let path = path.as_ref();
  let mut reader = tsv_reader(path, true)?;
  let headers = HeaderIndex::new(reader.headers()?);

  let sample_col = headers.headers.iter().position(|h| h == SAMPLE_COLUMN);
  let study_col = headers.headers.iter().position(|h| h == STUDY_COLUMN);
  if enforce_required {
    let missing: Vec<&str> = [(SAMPLE_COLUMN, sample_col), (STUDY_COLUMN, study_col)]
      .into_iter()
      .filter(|(_, col)| col.is_none())
      .map(|(name, _)| name)
      .collect();
    if !missing.is_empty() {
      return Err(Error::MetadataFormat {
        path:    path.to_owned(),
        message: format!("missing required columns: {}", missing.join(", ")),
      });
    }
  }

  let age_cols = headers.resolve_all(&mappings.age_fields);
  let sex_cols = headers.resolve_all(&mappings.sex_fields);
  let illness_cols = headers.resolve_all(&mappings.illness_fields);
  let platform_cols = headers.resolve_all(&mappings.platform_fields);

  let mut samples = Vec::new();
  let mut quality = MetadataQuality::default();

  for (line, record) in reader.records().enumerate() {
    let record = record?;
    let accession = cell(&record, sample_col);
    if accession.is_empty() {
      warn!(path = %path.display(), row = line + 1, "skipping metadata row without sample accession");
      continue;
    }
    let study = match cell(&record, study_col) {
      "" => UNKNOWN,
      s => s,
    };

    let mut sample = SampleRecord::new(accession, study);
    sample.platform_accession = first_non_empty(&record, &platform_cols);
    sample.illness_label = first_non_empty(&record, &illness_cols);
    sample.age = first_non_empty(&record, &age_cols);
    sample.sex = first_non_empty(&record, &sex_cols);

    if sample.age != UNKNOWN {
      quality.complete_age += 1;
    }
    if sample.sex != UNKNOWN {
      quality.complete_sex += 1;
    }
    samples.push(sample);
  }
  quality.total_samples = samples.len();

  info!(
    path = %path.display(),
    samples = quality.total_samples,
    age_completion = quality.age_completion(),
    sex_completion = quality.sex_completion(),
    "metadata loaded"
  );
  Ok((samples, quality))
}
