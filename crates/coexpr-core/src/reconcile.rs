//! Dimension reconciliation: natural keys in, stable surrogate keys out.

use tracing::debug;

use crate::{
  Error, Result,
  dimension::{
    DimensionCache, DimensionKind, SampleKey, SampleRecord, SampleUpsert,
    StudyKey, known,
  },
  retry::RetryPolicy,
  store::EtlStore,
};

/// Per-worker get-or-create front end over an [`EtlStore`] session.
///
/// The cache is filled once from the store on [`Reconciler::bootstrap`] and
/// then grows as new keys are resolved.
pub struct Reconciler<'s, S> {
  store:  &'s S,
  policy: RetryPolicy,
  cache:  DimensionCache,
}

impl<'s, S: EtlStore> Reconciler<'s, S> {
  pub async fn bootstrap(store: &'s S, policy: RetryPolicy) -> Result<Self> {
    let cache = policy.run("load dimensions", || store.load_dimensions()).await?;
    debug!(
      genes = cache.genes.len(),
      studies = cache.studies.len(),
      samples = cache.samples.len(),
      "dimension cache bootstrapped"
    );
    Ok(Self { store, policy, cache })
  }

  pub fn cache(&self) -> &DimensionCache { &self.cache }

  /// Surrogate key for `natural_key`, creating the dimension row if needed.
  pub async fn get_or_create(
    &mut self,
    kind: DimensionKind,
    natural_key: &str,
  ) -> Result<i64> {
    let natural_key = natural_key.trim();
    if natural_key.is_empty() {
      return Err(Error::InvalidInput(format!("empty {kind} key")));
    }
    if let Some(key) = self.cache.get(kind, natural_key) {
      return Ok(key);
    }

    let store = self.store;
    let key = self
      .policy
      .run(&format!("get-or-create {kind}"), || {
        store.insert_dimension(kind, natural_key.to_owned())
      })
      .await?;
    self.cache.map_mut(kind).insert(natural_key.to_owned(), key);
    Ok(key)
  }

  /// Like [`Self::get_or_create`] but maps blanks and the `UNKNOWN` sentinel
  /// to `None`.
  pub async fn resolve_optional(
    &mut self,
    kind: DimensionKind,
    value: &str,
  ) -> Result<Option<i64>> {
    match known(value) {
      Some(v) => self.get_or_create(kind, v).await.map(Some),
      None => Ok(None),
    }
  }

  /// Resolve the platform and illness of every record and upsert all samples
  /// of the study in one transaction. Returns the number of samples written.
  pub async fn upsert_samples(
    &mut self,
    study_key: StudyKey,
    records: &[SampleRecord],
  ) -> Result<usize> {
    let mut upserts = Vec::with_capacity(records.len());
    for record in records {
      let platform_key =
        self.resolve_optional(DimensionKind::Platform, &record.platform_accession).await?;
      let illness_key =
        self.resolve_optional(DimensionKind::Illness, &record.illness_label).await?;
      upserts.push(SampleUpsert {
        accession: record.accession.clone(),
        platform_key,
        illness_key,
        age: record.age.clone(),
        sex: record.sex.clone(),
      });
    }

    let store = self.store;
    let keys = self
      .policy
      .run("upsert samples", || store.upsert_samples(study_key, upserts.clone()))
      .await?;
    let written = keys.len();
    for (accession, key) in keys {
      self.cache.samples.insert((accession, study_key), key);
    }
    Ok(written)
  }

  pub fn sample_key(&self, accession: &str, study_key: StudyKey) -> Option<SampleKey> {
    self.cache.sample(accession, study_key)
  }

  /// Whether every record already has a sample key in this study.
  pub fn has_samples(&self, study_key: StudyKey, records: &[SampleRecord]) -> bool {
    records.iter().all(|r| self.sample_key(&r.accession, study_key).is_some())
  }
}
