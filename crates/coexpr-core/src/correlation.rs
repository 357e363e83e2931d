//! Per-cohort gene-pair Spearman correlation with FDR correction.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use tracing::debug;

use crate::{
  dimension::{GeneKey, IllnessKey, SampleKey, StudyKey},
  fact::{CohortMap, CorrelationRecord, ExpressionMatrix},
  stats,
};

/// Default minimum number of overlapping samples for a pair.
pub const DEFAULT_MIN_SAMPLES: usize = 3;

/// Pairs with fewer samples than this have no t-test and skip FDR.
const MIN_TESTABLE_SAMPLES: usize = 3;

/// Samples of a study grouped by illness; `None` groups the samples with no
/// illness recorded.
pub fn partition_cohorts(
  cohorts: &CohortMap,
) -> BTreeMap<Option<IllnessKey>, BTreeSet<SampleKey>> {
  let mut groups: BTreeMap<_, BTreeSet<_>> = BTreeMap::new();
  for (&sample, &illness) in cohorts {
    groups.entry(illness).or_default().insert(sample);
  }
  groups
}

/// Overlap required for pairs in a cohort of `size` samples, or `None` if
/// the cohort has fewer than `min_samples` members.
///
/// The threshold never drops below two, the smallest series with a rank.
fn cohort_threshold(size: usize, min_samples: usize) -> Option<usize> {
  let threshold = min_samples.max(2);
  (size >= threshold).then_some(threshold)
}

/// Compute correlation records for every cohort of one study.
///
/// Pairs are enumerated in ascending gene-key order, so `gene_a_key <
/// gene_b_key` holds for every record. Constant series and pairs with a NaN
/// p-value are dropped. Q-values are computed per cohort over pairs with at
/// least three samples; smaller pairs get `p = 1` and no q-value.
pub fn compute_correlations(
  matrix: &ExpressionMatrix,
  cohorts: &CohortMap,
  study_key: StudyKey,
  min_samples: usize,
) -> Vec<CorrelationRecord> {
  let computed_at = Utc::now();
  let mut out = Vec::new();

  for (illness_key, members) in partition_cohorts(cohorts) {
    let Some(threshold) = cohort_threshold(members.len(), min_samples) else {
      debug!(?illness_key, size = members.len(), "cohort too small, skipped");
      continue;
    };

    // Each gene restricted to the cohort, dropping genes that cannot reach
    // the threshold with any partner.
    let genes: Vec<(GeneKey, BTreeMap<SampleKey, f64>)> = matrix
      .iter()
      .map(|(&gene, values)| {
        let restricted: BTreeMap<_, _> = values
          .iter()
          .filter(|(sample, _)| members.contains(sample))
          .map(|(&s, &v)| (s, v))
          .collect();
        (gene, restricted)
      })
      .filter(|(_, values)| values.len() >= threshold)
      .collect();

    let mut cohort_records = Vec::new();
    for (i, (gene_a, values_a)) in genes.iter().enumerate() {
      for (gene_b, values_b) in &genes[i + 1..] {
        let (x, y): (Vec<f64>, Vec<f64>) = values_a
          .iter()
          .filter_map(|(sample, &a)| values_b.get(sample).map(|&b| (a, b)))
          .unzip();
        let n = x.len();
        if n < threshold {
          continue;
        }
        let Some(rho) = stats::spearman(&x, &y) else {
          continue;
        };
        let p_value = stats::spearman_p_value(rho, n);
        if p_value.is_nan() {
          continue;
        }
        cohort_records.push(CorrelationRecord {
          gene_a_key: *gene_a,
          gene_b_key: *gene_b,
          illness_key,
          study_key,
          rho,
          p_value,
          q_value: None,
          n_samples: n,
          computed_at,
        });
      }
    }

    let tested: Vec<usize> = (0..cohort_records.len())
      .filter(|&i| cohort_records[i].n_samples >= MIN_TESTABLE_SAMPLES)
      .collect();
    let p_values: Vec<f64> = tested.iter().map(|&i| cohort_records[i].p_value).collect();
    for (&i, q) in tested.iter().zip(stats::benjamini_hochberg(&p_values)) {
      cohort_records[i].q_value = q;
    }

    debug!(
      ?illness_key,
      samples = members.len(),
      genes = genes.len(),
      pairs = cohort_records.len(),
      "cohort correlated"
    );
    out.extend(cohort_records);
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  fn matrix(rows: &[(GeneKey, &[(SampleKey, f64)])]) -> ExpressionMatrix {
    rows
      .iter()
      .map(|(gene, values)| (*gene, values.iter().copied().collect()))
      .collect()
  }

  fn cohorts(entries: &[(SampleKey, Option<IllnessKey>)]) -> CohortMap {
    entries.iter().copied().collect()
  }

  #[test]
  fn three_genes_three_samples_single_cohort() {
    let m = matrix(&[
      (1, &[(10, 1.0), (11, 2.0), (12, 3.0)]),
      (2, &[(10, 2.0), (11, 4.0), (12, 7.0)]),
      (3, &[(10, 3.0), (11, 1.0), (12, 2.0)]),
    ]);
    let c = cohorts(&[(10, Some(5)), (11, Some(5)), (12, Some(5))]);

    let records = compute_correlations(&m, &c, 99, 3);
    assert_eq!(records.len(), 3);
    for r in &records {
      assert!(r.gene_a_key < r.gene_b_key);
      assert_eq!(r.n_samples, 3);
      assert_eq!(r.illness_key, Some(5));
      assert_eq!(r.study_key, 99);
      assert!((-1.0..=1.0).contains(&r.rho));
      let q = r.q_value.unwrap();
      assert!((0.0..=1.0).contains(&q));
    }
    let pairs: Vec<_> = records.iter().map(|r| (r.gene_a_key, r.gene_b_key)).collect();
    assert_eq!(pairs, vec![(1, 2), (1, 3), (2, 3)]);
    assert_eq!(records[0].p_value, 0.0);
  }

  #[test]
  fn two_samples_without_illness_form_a_small_cohort() {
    let m = matrix(&[(1, &[(10, 1.0), (11, 2.0)]), (2, &[(10, 5.0), (11, 3.0)])]);
    let c = cohorts(&[(10, None), (11, None)]);

    let records = compute_correlations(&m, &c, 1, 2);
    assert_eq!(records.len(), 1);
    let r = &records[0];
    assert_eq!(r.illness_key, None);
    assert_eq!(r.n_samples, 2);
    assert_eq!(r.p_value, 1.0);
    assert_eq!(r.q_value, None);
    assert!((r.rho + 1.0).abs() < 1e-12);
  }

  #[test]
  fn cohort_below_min_samples_is_skipped() {
    let m = matrix(&[
      (1, &[(10, 1.0), (11, 2.0), (12, 3.0)]),
      (2, &[(10, 2.0), (11, 4.0), (12, 7.0)]),
    ]);
    let c = cohorts(&[(10, Some(7)), (11, Some(7)), (12, Some(7))]);

    assert!(compute_correlations(&m, &c, 1, 5).is_empty());
    assert_eq!(compute_correlations(&m, &c, 1, 3).len(), 1);
  }

  #[test]
  fn two_sample_cohort_needs_min_samples_of_two() {
    let m = matrix(&[(1, &[(10, 1.0), (11, 2.0)]), (2, &[(10, 5.0), (11, 3.0)])]);
    let c = cohorts(&[(10, None), (11, None)]);
    assert!(compute_correlations(&m, &c, 1, 3).is_empty());
  }

  #[test]
  fn constant_series_are_never_emitted() {
    let m = matrix(&[
      (1, &[(10, 1.0), (11, 1.0), (12, 1.0)]),
      (2, &[(10, 2.0), (11, 4.0), (12, 7.0)]),
    ]);
    let c = cohorts(&[(10, None), (11, None), (12, None)]);
    assert!(compute_correlations(&m, &c, 1, 3).is_empty());
  }

  #[test]
  fn cohorts_are_evaluated_separately() {
    let m = matrix(&[
      (1, &[(10, 1.0), (11, 2.0), (12, 3.0), (20, 1.0), (21, 2.0), (22, 3.0)]),
      (2, &[(10, 1.0), (11, 2.0), (12, 3.0), (20, 3.0), (21, 2.0), (22, 1.0)]),
    ]);
    let c = cohorts(&[
      (10, Some(1)),
      (11, Some(1)),
      (12, Some(1)),
      (20, Some(2)),
      (21, Some(2)),
      (22, Some(2)),
    ]);

    let records = compute_correlations(&m, &c, 1, 3);
    assert_eq!(records.len(), 2);
    let by_illness: BTreeMap<_, _> =
      records.iter().map(|r| (r.illness_key, r.rho)).collect();
    assert!((by_illness[&Some(1)] - 1.0).abs() < 1e-12);
    assert!((by_illness[&Some(2)] + 1.0).abs() < 1e-12);
  }

  #[test]
  fn pairs_need_enough_overlapping_samples() {
    // Genes 1 and 2 share only two of the cohort's four samples.
    let m = matrix(&[
      (1, &[(10, 1.0), (11, 2.0), (12, 3.0)]),
      (2, &[(12, 1.0), (13, 2.0), (11, 0.5)]),
    ]);
    let c = cohorts(&[(10, None), (11, None), (12, None), (13, None)]);
    assert!(compute_correlations(&m, &c, 1, 3).is_empty());
  }

  #[test]
  fn single_sample_cohort_is_skipped() {
    let m = matrix(&[(1, &[(10, 1.0)]), (2, &[(10, 2.0)])]);
    let c = cohorts(&[(10, Some(3))]);
    assert!(compute_correlations(&m, &c, 1, 3).is_empty());
  }

  #[test]
  fn q_values_follow_p_values_within_a_cohort() {
    let samples: Vec<SampleKey> = (0..8).collect();
    let series: [[f64; 8]; 4] = [
      [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
      [2.0, 1.0, 4.0, 3.0, 6.0, 5.0, 8.0, 7.0],
      [8.0, 3.0, 5.0, 1.0, 7.0, 2.0, 6.0, 4.0],
      [4.0, 6.0, 1.0, 8.0, 2.0, 7.0, 3.0, 5.0],
    ];
    let m: ExpressionMatrix = series
      .iter()
      .enumerate()
      .map(|(g, values)| {
        (g as GeneKey, samples.iter().copied().zip(values.iter().copied()).collect())
      })
      .collect();
    let c: CohortMap = samples.iter().map(|&s| (s, None)).collect();

    let mut records = compute_correlations(&m, &c, 1, 3);
    assert_eq!(records.len(), 6);
    records.sort_by(|a, b| a.p_value.total_cmp(&b.p_value));
    for w in records.windows(2) {
      assert!(w[0].q_value.unwrap() <= w[1].q_value.unwrap());
    }
    for r in &records {
      assert!(r.q_value.unwrap() >= r.p_value);
    }
  }
}
