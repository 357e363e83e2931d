//! Retry policy for store writes.
//!
//! Every write attempt is classified into an [`Outcome`]. Transient failures
//! (a concurrently locked database) are retried with exponential backoff;
//! anything else is returned immediately.

use std::{future::Future, time::Duration};

use tracing::warn;

use crate::{Error, Result};

/// Classifies errors that may succeed when retried.
pub trait Transient {
  fn is_transient(&self) -> bool;
}

/// The classified result of a single attempt.
#[derive(Debug)]
pub enum Outcome<T, E> {
  Success(T),
  Transient(E),
  Fatal(E),
}

impl<T, E: Transient> Outcome<T, E> {
  pub fn classify(result: std::result::Result<T, E>) -> Self {
    match result {
      Ok(value) => Self::Success(value),
      Err(e) if e.is_transient() => Self::Transient(e),
      Err(e) => Self::Fatal(e),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts including the first one. Never less than one.
  pub max_attempts: u32,
  pub base_delay:   Duration,
  pub max_delay:    Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 6,
      base_delay:   Duration::from_secs(1),
      max_delay:    Duration::from_secs(30),
    }
  }
}

impl RetryPolicy {
  /// Policy allowing `max_retries` retries after the first attempt.
  pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
    Self { max_attempts: max_retries.saturating_add(1), base_delay, max_delay }
  }

  /// Backoff before retrying after the failed `attempt` (1-based).
  pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    self.base_delay.saturating_mul(1u32 << exponent).min(self.max_delay)
  }

  /// Run `attempt` until it succeeds, fails fatally, or the attempts are
  /// exhausted.
  pub async fn run<T, E, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T>
  where
    E: Transient + std::error::Error + Send + Sync + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
  {
    let max_attempts = self.max_attempts.max(1);
    let mut n = 1;
    loop {
      match Outcome::classify(attempt().await) {
        Outcome::Success(value) => return Ok(value),
        Outcome::Fatal(e) => return Err(Error::store(e)),
        Outcome::Transient(e) if n >= max_attempts => {
          return Err(Error::RetriesExhausted {
            operation: operation.to_owned(),
            attempts:  n,
            source:    Box::new(e),
          });
        }
        Outcome::Transient(e) => {
          let delay = self.delay_for_attempt(n);
          warn!(operation, attempt = n, ?delay, error = %e, "transient store error, retrying");
          tokio::time::sleep(delay).await;
          n += 1;
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicU32, Ordering};

  use super::*;

  #[derive(Debug, thiserror::Error)]
  #[error("fake ({transient})")]
  struct FakeError {
    transient: bool,
  }

  impl Transient for FakeError {
    fn is_transient(&self) -> bool { self.transient }
  }

  fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(2))
  }

  #[test]
  fn delays_grow_exponentially_up_to_the_cap() {
    let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(5));
    assert_eq!(policy.max_attempts, 6);
    assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
    assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
    assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
    assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(5));
    assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(5));
  }

  #[tokio::test]
  async fn transient_errors_are_retried_until_success() {
    let calls = AtomicU32::new(0);
    let value = fast_policy(3)
      .run("op", || async {
        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
          Err(FakeError { transient: true })
        } else {
          Ok(7)
        }
      })
      .await
      .unwrap();
    assert_eq!(value, 7);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn exhausting_attempts_reports_the_count() {
    let calls = AtomicU32::new(0);
    let err = fast_policy(2)
      .run::<(), _, _, _>("insert batch", || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(FakeError { transient: true })
      })
      .await
      .unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
  }

  #[tokio::test]
  async fn fatal_errors_are_not_retried() {
    let calls = AtomicU32::new(0);
    let err = fast_policy(5)
      .run::<(), _, _, _>("op", || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(FakeError { transient: false })
      })
      .await
      .unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(err, Error::Store(_)));
  }
}
