//! Rank statistics, the Student-t distribution and Benjamini-Hochberg FDR
//! correction.

use std::f64::consts::PI;

/// Below this distance from ±1 a correlation is treated as exact.
const PERFECT_EPS: f64 = 1e-12;

// ─── Ranks & correlation ─────────────────────────────────────────────────────

/// 1-based ranks of `values`; tied values share the average of their ranks.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
  let mut order: Vec<usize> = (0..values.len()).collect();
  order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

  let mut ranks = vec![0.0; values.len()];
  let mut start = 0;
  while start < order.len() {
    let mut end = start + 1;
    while end < order.len() && values[order[end]] == values[order[start]] {
      end += 1;
    }
    // Positions start..end hold ranks start+1..=end.
    let rank = (start + 1 + end) as f64 / 2.0;
    for &i in &order[start..end] {
      ranks[i] = rank;
    }
    start = end;
  }
  ranks
}

/// Pearson correlation of two equally long series. `None` when either
/// series has zero variance or fewer than two points.
pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
  let n = x.len();
  if n < 2 || n != y.len() {
    return None;
  }
  let mean_x = x.iter().sum::<f64>() / n as f64;
  let mean_y = y.iter().sum::<f64>() / n as f64;

  let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
  for (a, b) in x.iter().zip(y) {
    let dx = a - mean_x;
    let dy = b - mean_y;
    sxy += dx * dy;
    sxx += dx * dx;
    syy += dy * dy;
  }
  if sxx <= 0.0 || syy <= 0.0 {
    return None;
  }
  Some(sxy / (sxx * syy).sqrt())
}

/// Spearman rank correlation clamped to `[-1, 1]`.
pub fn spearman(x: &[f64], y: &[f64]) -> Option<f64> {
  pearson(&average_ranks(x), &average_ranks(y)).map(|rho| rho.clamp(-1.0, 1.0))
}

// ─── Distributions ───────────────────────────────────────────────────────────

/// Natural log of the gamma function (Lanczos approximation, g = 7).
pub fn ln_gamma(x: f64) -> f64 {
  const G: f64 = 7.0;
  const COEF: [f64; 9] = [
    0.999_999_999_999_809_9,
    676.520_368_121_885_1,
    -1_259.139_216_722_402_8,
    771.323_428_777_653_1,
    -176.615_029_162_140_6,
    12.507_343_278_686_905,
    -0.138_571_095_265_720_12,
    9.984_369_578_019_572e-6,
    1.505_632_735_149_311_6e-7,
  ];

  if x < 0.5 {
    // Reflection formula.
    return (PI / (PI * x).sin()).ln() - ln_gamma(1.0 - x);
  }
  let x = x - 1.0;
  let mut a = COEF[0];
  let t = x + G + 0.5;
  for (i, c) in COEF.iter().enumerate().skip(1) {
    a += c / (x + i as f64);
  }
  0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + a.ln()
}

/// Regularized incomplete beta function `I_x(a, b)`.
pub fn incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
  if x <= 0.0 {
    return 0.0;
  }
  if x >= 1.0 {
    return 1.0;
  }
  let ln_front =
    ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
  let front = ln_front.exp();

  // The continued fraction converges fastest below the mean of the
  // distribution; use the symmetry relation above it.
  if x < (a + 1.0) / (a + b + 2.0) {
    front * beta_continued_fraction(a, b, x) / a
  } else {
    1.0 - front * beta_continued_fraction(b, a, 1.0 - x) / b
  }
}

/// Continued fraction for the incomplete beta, modified Lentz's method.
fn beta_continued_fraction(a: f64, b: f64, x: f64) -> f64 {
  const MAX_ITERATIONS: usize = 300;
  const EPS: f64 = 3.0e-16;
  const TINY: f64 = 1.0e-300;

  let guard = |v: f64| if v.abs() < TINY { TINY } else { v };

  let qab = a + b;
  let qap = a + 1.0;
  let qam = a - 1.0;
  let mut c = 1.0;
  let mut d = 1.0 / guard(1.0 - qab * x / qap);
  let mut h = d;

  for m in 1..=MAX_ITERATIONS {
    let m = m as f64;
    let m2 = 2.0 * m;

    let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
    d = 1.0 / guard(1.0 + aa * d);
    c = guard(1.0 + aa / c);
    h *= d * c;

    let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
    d = 1.0 / guard(1.0 + aa * d);
    c = guard(1.0 + aa / c);
    let delta = d * c;
    h *= delta;

    if (delta - 1.0).abs() < EPS {
      break;
    }
  }
  h
}

/// Two-sided p-value of `t` under Student's t with `df` degrees of freedom.
pub fn student_t_two_sided(t: f64, df: f64) -> f64 {
  if t.is_nan() || df <= 0.0 {
    return f64::NAN;
  }
  if t.is_infinite() {
    return 0.0;
  }
  incomplete_beta(df / 2.0, 0.5, df / (df + t * t)).clamp(0.0, 1.0)
}

/// Two-sided p-value of a Spearman coefficient over `n` samples.
///
/// Fewer than three samples leave no degrees of freedom; those pairs are
/// reported with `p = 1`.
pub fn spearman_p_value(rho: f64, n: usize) -> f64 {
  if n < 3 {
    return 1.0;
  }
  if rho.is_nan() {
    return f64::NAN;
  }
  if 1.0 - rho.abs() < PERFECT_EPS {
    return 0.0;
  }
  let df = (n - 2) as f64;
  let t = rho * (df / (1.0 - rho * rho)).sqrt();
  student_t_two_sided(t, df)
}

// ─── FDR ─────────────────────────────────────────────────────────────────────

/// Benjamini-Hochberg q-values, in input order.
///
/// NaN p-values do not count towards the number of tests and yield `None`.
pub fn benjamini_hochberg(p_values: &[f64]) -> Vec<Option<f64>> {
  let mut order: Vec<usize> =
    (0..p_values.len()).filter(|&i| !p_values[i].is_nan()).collect();
  order.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]));

  let m = order.len() as f64;
  let mut q_values = vec![None; p_values.len()];
  let mut running_min = 1.0_f64;
  for (pos, &i) in order.iter().enumerate().rev() {
    let rank = (pos + 1) as f64;
    let q = (p_values[i] * m / rank).clamp(0.0, 1.0);
    running_min = running_min.min(q);
    q_values[i] = Some(running_min);
  }
  q_values
}

#[cfg(test)]
mod tests {
  use super::*;

  fn close(a: f64, b: f64) -> bool { (a - b).abs() < 1e-9 }

  #[test]
  fn ranks_average_ties() {
    assert_eq!(average_ranks(&[10.0, 30.0, 20.0]), vec![1.0, 3.0, 2.0]);
    assert_eq!(average_ranks(&[5.0, 1.0, 5.0, 5.0]), vec![3.0, 1.0, 3.0, 3.0]);
  }

  #[test]
  fn spearman_handles_monotone_and_constant_series() {
    let rho = spearman(&[1.0, 2.0, 3.0, 4.0], &[1.0, 10.0, 100.0, 1000.0]).unwrap();
    assert!(close(rho, 1.0));
    let rho = spearman(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]).unwrap();
    assert!(close(rho, -1.0));
    assert_eq!(spearman(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]), None);
  }

  #[test]
  fn spearman_matches_the_rank_difference_formula() {
    // d = [-2, 1, 1]: rho = 1 - 6 * 6 / (3 * 8)
    let rho = spearman(&[1.0, 2.0, 3.0], &[3.0, 1.0, 2.0]).unwrap();
    assert!(close(rho, -0.5));
  }

  #[test]
  fn ln_gamma_matches_factorials() {
    assert!(close(ln_gamma(1.0), 0.0));
    assert!(close(ln_gamma(5.0), 24.0_f64.ln()));
    assert!(close(ln_gamma(0.5), PI.sqrt().ln()));
  }

  #[test]
  fn student_t_closed_forms() {
    // df = 1 is the Cauchy distribution: P(|T| > 1) = 0.5.
    assert!(close(student_t_two_sided(1.0, 1.0), 0.5));
    // df = 2: P(|T| > t) = 1 - t / sqrt(t^2 + 2).
    let expected = 1.0 - 2.0 / 6.0_f64.sqrt();
    assert!(close(student_t_two_sided(2.0, 2.0), expected));
    assert!(close(student_t_two_sided(0.0, 7.0), 1.0));
    assert!(student_t_two_sided(50.0, 30.0) < 1e-20);
  }

  #[test]
  fn spearman_p_value_edge_cases() {
    assert_eq!(spearman_p_value(1.0, 2), 1.0);
    assert_eq!(spearman_p_value(1.0, 10), 0.0);
    assert_eq!(spearman_p_value(-1.0, 10), 0.0);
    assert!(spearman_p_value(f64::NAN, 10).is_nan());
    // rho = -0.5, n = 3: t^2 = 1/3, p = I_{3/4}(1/2, 1/2) = 2/3.
    assert!(close(spearman_p_value(-0.5, 3), 2.0 / 3.0));
  }

  #[test]
  fn benjamini_hochberg_is_monotone_and_bounded() {
    let p = [0.01, 0.04, 0.03, 0.20, f64::NAN];
    let q = benjamini_hochberg(&p);
    assert_eq!(q[4], None);

    // m = 4: sorted p = [0.01, 0.03, 0.04, 0.20]
    assert!(close(q[0].unwrap(), 0.04));
    assert!(close(q[2].unwrap(), 0.04 * 4.0 / 3.0));
    assert!(close(q[1].unwrap(), 0.04 * 4.0 / 3.0));
    assert!(close(q[3].unwrap(), 0.20));

    let mut pairs: Vec<(f64, f64)> =
      p.iter().zip(&q).filter_map(|(p, q)| q.map(|q| (*p, q))).collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    for w in pairs.windows(2) {
      assert!(w[0].1 <= w[1].1);
    }
    assert!(pairs.iter().all(|(_, q)| (0.0..=1.0).contains(q)));
  }

  #[test]
  fn benjamini_hochberg_of_nothing() {
    assert!(benjamini_hochberg(&[]).is_empty());
  }
}
