//! Study discovery: find study units under an input directory.
//!
//! A study unit is a directory holding one metadata TSV and one expression
//! TSV. Names are matched case-insensitively: `metadata.tsv` or
//! `metadata_<ACC>.tsv`, and `expression.tsv` or `expression_<ACC>.tsv`.

use std::{
  collections::HashSet,
  fs,
  path::{Path, PathBuf},
};

use serde::Serialize;
use tracing::{debug, warn};

use crate::{Error, Result};

const METADATA_PREFIX: &str = "metadata";
const EXPRESSION_PREFIX: &str = "expression";

/// One study ready for processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudyUnit {
  pub accession:       String,
  pub directory:       PathBuf,
  pub metadata_file:   PathBuf,
  pub expression_file: PathBuf,
}

/// A directory that was not accepted as a study.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedDirectory {
  pub directory: PathBuf,
  pub reason:    String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
  pub studies:    Vec<StudyUnit>,
  pub incomplete: Vec<SkippedDirectory>,
}

// ─── File matching ───────────────────────────────────────────────────────────

/// `Some("")` for `<prefix>.tsv`, `Some(acc)` for `<prefix>_<acc>.tsv`.
fn match_name<'n>(name: &'n str, prefix: &str) -> Option<&'n str> {
  let lower = name.to_ascii_lowercase();
  if !lower.ends_with(".tsv") || !lower.starts_with(prefix) {
    return None;
  }
  let stem = &name[prefix.len()..name.len() - ".tsv".len()];
  if stem.is_empty() {
    Some("")
  } else {
    stem.strip_prefix('_').filter(|acc| !acc.is_empty())
  }
}

struct Candidates {
  /// `(accession suffix, path)` sorted by file name.
  metadata:   Vec<(String, PathBuf)>,
  expression: Vec<(String, PathBuf)>,
}

fn candidates(dir: &Path) -> Result<Candidates> {
  let mut files: Vec<(String, PathBuf)> = fs::read_dir(dir)
    .map_err(|e| discovery_error(dir, e))?
    .filter_map(|entry| entry.ok())
    .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
    .filter_map(|entry| {
      let name = entry.file_name().to_str()?.to_owned();
      Some((name, entry.path()))
    })
    .collect();
  files.sort();

  let pick = |prefix: &str| -> Vec<(String, PathBuf)> {
    files
      .iter()
      .filter_map(|(name, path)| {
        match_name(name, prefix).map(|acc| (acc.to_owned(), path.clone()))
      })
      .collect()
  };
  Ok(Candidates { metadata: pick(METADATA_PREFIX), expression: pick(EXPRESSION_PREFIX) })
}

fn discovery_error(path: &Path, e: impl std::fmt::Display) -> Error {
  Error::Discovery { path: path.to_owned(), message: e.to_string() }
}

type Inspection = std::result::Result<StudyUnit, SkippedDirectory>;

/// Inspect one directory. `Ok(None)` when it holds neither file.
fn inspect(dir: &Path) -> Result<Option<Inspection>> {
  let Candidates { metadata, expression } = candidates(dir)?;
  if metadata.is_empty() && expression.is_empty() {
    return Ok(None);
  }

  let skipped = |reason: &str| -> Result<Option<Inspection>> {
    Ok(Some(Err(SkippedDirectory { directory: dir.to_owned(), reason: reason.to_owned() })))
  };
  let Some((meta_acc, metadata_file)) = metadata.into_iter().next() else {
    return skipped("missing metadata TSV");
  };

  let accession = if meta_acc.is_empty() {
    match dir.file_name().and_then(|n| n.to_str()) {
      Some(name) => name.to_owned(),
      None => return skipped("cannot derive a study accession"),
    }
  } else {
    meta_acc
  };

  // Prefer the expression file named after the accession.
  let expression_file = expression
    .iter()
    .find(|(acc, _)| acc.eq_ignore_ascii_case(&accession))
    .or_else(|| expression.iter().find(|(acc, _)| acc.is_empty()))
    .or_else(|| expression.first())
    .map(|(_, path)| path.clone());
  let Some(expression_file) = expression_file else {
    return skipped("missing expression TSV");
  };

  Ok(Some(Ok(StudyUnit {
    accession,
    directory: dir.to_owned(),
    metadata_file,
    expression_file,
  })))
}

// ─── Discovery ───────────────────────────────────────────────────────────────

/// The root itself (when it is a study) followed by its immediate
/// subdirectories that are studies, sorted by path.
///
/// Directories with only one of the two files, or whose accession repeats an
/// earlier study, are reported in [`DiscoveryReport::incomplete`].
pub fn discover(root: impl AsRef<Path>) -> Result<DiscoveryReport> {
  let root = root.as_ref();
  if !root.is_dir() {
    return Err(discovery_error(root, "input directory not found"));
  }

  let mut subdirs: Vec<PathBuf> = fs::read_dir(root)
    .map_err(|e| discovery_error(root, e))?
    .filter_map(|entry| entry.ok())
    .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
    .map(|entry| entry.path())
    .collect();
  subdirs.sort();

  let mut report = DiscoveryReport::default();
  let mut seen = HashSet::new();
  for dir in std::iter::once(root.to_owned()).chain(subdirs) {
    match inspect(&dir)? {
      None => debug!(dir = %dir.display(), "not a study directory"),
      Some(Ok(unit)) if !seen.insert(unit.accession.to_ascii_lowercase()) => {
        warn!(study = %unit.accession, dir = %dir.display(), "duplicate study accession, skipped");
        report.incomplete.push(SkippedDirectory {
          directory: dir,
          reason:    format!("duplicate study accession {}", unit.accession),
        });
      }
      Some(Ok(unit)) => report.studies.push(unit),
      Some(Err(skipped)) => {
        warn!(dir = %skipped.directory.display(), reason = %skipped.reason, "incomplete study directory");
        report.incomplete.push(skipped);
      }
    }
  }
  Ok(report)
}
