//! Dimensions: the reference entities of the star schema.
//!
//! Every dimension row owns a stable integer surrogate key and a unique
//! natural key. Rows are created lazily on first reference and are never
//! deleted by a run rollback.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Sentinel stored for metadata fields that could not be resolved.
pub const UNKNOWN: &str = "UNKNOWN";

pub type GeneKey = i64;
pub type StudyKey = i64;
pub type SampleKey = i64;
pub type PlatformKey = i64;
pub type IllnessKey = i64;

/// Returns `Some(value)` when `value` carries real information, `None` for
/// blanks and the [`UNKNOWN`] sentinel.
pub fn known(value: &str) -> Option<&str> {
  let trimmed = value.trim();
  if trimmed.is_empty() || trimmed == UNKNOWN {
    None
  } else {
    Some(trimmed)
  }
}

// ─── Kinds ───────────────────────────────────────────────────────────────────

/// Dimensions keyed by a single natural key.
///
/// Samples are keyed by `(accession, study_key)` and handled separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimensionKind {
  Gene,
  Study,
  Platform,
  Illness,
}

impl DimensionKind {
  pub fn label(self) -> &'static str {
    match self {
      Self::Gene => "gene",
      Self::Study => "study",
      Self::Platform => "platform",
      Self::Illness => "illness",
    }
  }
}

impl std::fmt::Display for DimensionKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.label())
  }
}

// ─── Samples ─────────────────────────────────────────────────────────────────

/// One normalised row of a study's metadata TSV.
///
/// Unresolved fields hold [`UNKNOWN`]; use [`known`] to read them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRecord {
  pub accession:          String,
  pub study_accession:    String,
  pub platform_accession: String,
  pub illness_label:      String,
  pub age:                String,
  pub sex:                String,
}

impl SampleRecord {
  /// A record with every optional field set to [`UNKNOWN`].
  pub fn new(accession: impl Into<String>, study_accession: impl Into<String>) -> Self {
    Self {
      accession:          accession.into(),
      study_accession:    study_accession.into(),
      platform_accession: UNKNOWN.to_owned(),
      illness_label:      UNKNOWN.to_owned(),
      age:                UNKNOWN.to_owned(),
      sex:                UNKNOWN.to_owned(),
    }
  }
}

/// A sample row ready for the store: optional references already resolved
/// to surrogate keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleUpsert {
  pub accession:    String,
  pub platform_key: Option<PlatformKey>,
  pub illness_key:  Option<IllnessKey>,
  pub age:          String,
  pub sex:          String,
}

/// Completeness summary of a metadata file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataQuality {
  pub total_samples: usize,
  pub complete_age:  usize,
  pub complete_sex:  usize,
}

impl MetadataQuality {
  pub fn age_completion(&self) -> f64 { ratio(self.complete_age, self.total_samples) }

  pub fn sex_completion(&self) -> f64 { ratio(self.complete_sex, self.total_samples) }
}

fn ratio(part: usize, total: usize) -> f64 {
  if total == 0 { 0.0 } else { part as f64 / total as f64 }
}

// ─── Studies ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyDescriptor {
  pub study_key: StudyKey,
  pub accession: String,
}

// ─── Cache ───────────────────────────────────────────────────────────────────

/// In-process natural-key → surrogate-key maps.
///
/// One cache belongs to one worker; it is never shared or synchronised.
/// Uniqueness is guaranteed by the store, the cache only saves round-trips.
#[derive(Debug, Clone, Default)]
pub struct DimensionCache {
  pub genes:     HashMap<String, GeneKey>,
  pub studies:   HashMap<String, StudyKey>,
  pub platforms: HashMap<String, PlatformKey>,
  pub illnesses: HashMap<String, IllnessKey>,
  pub samples:   HashMap<(String, StudyKey), SampleKey>,
}

impl DimensionCache {
  pub fn map(&self, kind: DimensionKind) -> &HashMap<String, i64> {
    match kind {
      DimensionKind::Gene => &self.genes,
      DimensionKind::Study => &self.studies,
      DimensionKind::Platform => &self.platforms,
      DimensionKind::Illness => &self.illnesses,
    }
  }

  pub fn map_mut(&mut self, kind: DimensionKind) -> &mut HashMap<String, i64> {
    match kind {
      DimensionKind::Gene => &mut self.genes,
      DimensionKind::Study => &mut self.studies,
      DimensionKind::Platform => &mut self.platforms,
      DimensionKind::Illness => &mut self.illnesses,
    }
  }

  pub fn get(&self, kind: DimensionKind, natural_key: &str) -> Option<i64> {
    self.map(kind).get(natural_key).copied()
  }

  pub fn sample(&self, accession: &str, study_key: StudyKey) -> Option<SampleKey> {
    self.samples.get(&(accession.to_owned(), study_key)).copied()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn known_filters_sentinel_and_blanks() {
    assert_eq!(known("Flu"), Some("Flu"));
    assert_eq!(known("  Flu "), Some("Flu"));
    assert_eq!(known(UNKNOWN), None);
    assert_eq!(known("   "), None);
  }

  #[test]
  fn quality_ratios_handle_empty_files() {
    let empty = MetadataQuality::default();
    assert_eq!(empty.age_completion(), 0.0);

    let q = MetadataQuality { total_samples: 4, complete_age: 3, complete_sex: 1 };
    assert!((q.age_completion() - 0.75).abs() < 1e-12);
    assert!((q.sex_completion() - 0.25).abs() < 1e-12);
  }
}
