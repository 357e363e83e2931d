//! [`SqliteStore`]: the SQLite implementation of [`EtlStore`].

use std::{path::Path, time::Duration};

use chrono::Utc;
use rusqlite::{OptionalExtension as _, TransactionBehavior};
use tracing::debug;
use uuid::Uuid;

use coexpr_core::{
  dimension::{
    DimensionCache, DimensionKind, SampleKey, SampleUpsert, StudyDescriptor,
    StudyKey, UNKNOWN,
  },
  fact::{CohortMap, CorrelationRecord, ExpressionBatch, ExpressionMatrix},
  run::{
    Checkpoint, EXPRESSION_TABLE, Metric, RollbackSummary, Run, RunReport,
    RunStatus, StudyResumeState,
  },
  store::EtlStore,
};

use crate::{
  Error, Result,
  encode::{
    RawCheckpoint, RawResumeState, RawRun, decode_dt, decode_run_status,
    dimension_table, encode_dt, encode_uuid,
  },
  schema::SCHEMA,
};

/// Busy timeout used by [`SqliteStore::open_in_memory`].
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Store ───────────────────────────────────────────────────────────────────

/// A coexpr store session backed by one SQLite connection.
///
/// Cloning is cheap but shares the connection; workers that must not
/// serialise on each other should each call [`SqliteStore::open`].
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  ///
  /// Lock contention with other connections waits up to `busy_timeout`
  /// before surfacing as a transient error.
  pub async fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema(busy_timeout).await?;
    Ok(store)
  }

  /// Open an in-memory store for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema(DEFAULT_BUSY_TIMEOUT).await?;
    Ok(store)
  }

  async fn init_schema(&self, busy_timeout: Duration) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Number of expression facts stored for a study.
  pub async fn expression_count(&self, study_key: StudyKey) -> Result<usize> {
    let n: i64 = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(
          "SELECT COUNT(*) FROM fact_expression WHERE study_key = ?1",
          rusqlite::params![study_key],
          |r| r.get(0),
        )?)
      })
      .await?;
    Ok(n as usize)
  }

  /// Run an ad-hoc query on the underlying connection.
  #[cfg(test)]
  pub(crate) async fn conn_for_tests<T, F>(&self, f: F) -> T
  where
    F: FnOnce(&mut rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
    T: Send + 'static,
  {
    self.conn.call(move |conn| Ok(f(conn)?)).await.expect("test query")
  }

  /// All correlation records of a study, ordered by cohort then gene pair.
  pub async fn correlations(&self, study_key: StudyKey) -> Result<Vec<CorrelationRecord>> {
    let rows: Vec<(i64, i64, Option<i64>, f64, f64, Option<f64>, i64, String)> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT gene_a_key, gene_b_key, illness_key, rho, p_value, q_value,
                  n_samples, computed_at
             FROM fact_gene_pair_corr
            WHERE study_key = ?1
            ORDER BY IFNULL(illness_key, -1), gene_a_key, gene_b_key",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![study_key], |r| {
            Ok((
              r.get(0)?,
              r.get(1)?,
              r.get(2)?,
              r.get(3)?,
              r.get(4)?,
              r.get(5)?,
              r.get(6)?,
              r.get(7)?,
            ))
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    rows
      .into_iter()
      .map(|(a, b, illness, rho, p, q, n, at)| {
        Ok(CorrelationRecord {
          gene_a_key: a,
          gene_b_key: b,
          illness_key: illness,
          study_key,
          rho,
          p_value: p,
          q_value: q,
          n_samples: n.max(0) as usize,
          computed_at: decode_dt(&at)?,
        })
      })
      .collect()
  }
}

// ─── EtlStore impl ───────────────────────────────────────────────────────────

impl EtlStore for SqliteStore {
  type Error = Error;

  // ── Dimensions ────────────────────────────────────────────────────────────

  async fn load_dimensions(&self) -> Result<DimensionCache> {
    let cache = self
      .conn
      .call(|conn| {
        let mut cache = DimensionCache::default();
        for kind in [
          DimensionKind::Gene,
          DimensionKind::Study,
          DimensionKind::Platform,
          DimensionKind::Illness,
        ] {
          let (table, key_col, natural_col) = dimension_table(kind);
          let mut stmt = conn.prepare(&format!("SELECT {natural_col}, {key_col} FROM {table}"))?;
          let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
          let map = cache.map_mut(kind);
          for row in rows {
            let (natural, key) = row?;
            map.insert(natural, key);
          }
        }

        let mut stmt = conn.prepare("SELECT gsm_accession, study_key, sample_key FROM dim_sample")?;
        let rows = stmt.query_map([], |r| {
          Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?))
        })?;
        for row in rows {
          let (accession, study_key, sample_key) = row?;
          cache.samples.insert((accession, study_key), sample_key);
        }
        Ok(cache)
      })
      .await?;
    Ok(cache)
  }

  async fn insert_dimension(&self, kind: DimensionKind, natural_key: String) -> Result<i64> {
    let (table, key_col, natural_col) = dimension_table(kind);
    let insert = format!(
      "INSERT INTO {table} ({natural_col}) VALUES (?1) ON CONFLICT ({natural_col}) DO NOTHING"
    );
    let select = format!("SELECT {key_col} FROM {table} WHERE {natural_col} = ?1");

    let lookup = natural_key.clone();
    let key: Option<i64> = self
      .conn
      .call(move |conn| {
        let inserted = conn.execute(&insert, rusqlite::params![lookup])?;
        let key = conn
          .query_row(&select, rusqlite::params![lookup], |r| r.get(0))
          .optional()?;
        if inserted > 0 {
          debug!(%kind, natural_key = %lookup, ?key, "dimension row created");
        }
        Ok(key)
      })
      .await?;
    key.ok_or(Error::MissingDimension { kind, natural_key })
  }

  async fn upsert_samples(
    &self,
    study_key: StudyKey,
    samples: Vec<SampleUpsert>,
  ) -> Result<Vec<(String, SampleKey)>> {
    let keys = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut keys = Vec::with_capacity(samples.len());
        {
          let mut stmt = tx.prepare_cached(
            "INSERT INTO dim_sample
                    (gsm_accession, study_key, platform_key, illness_key, age, sex)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (gsm_accession, study_key) DO UPDATE SET
               platform_key = COALESCE(dim_sample.platform_key, excluded.platform_key),
               illness_key  = COALESCE(dim_sample.illness_key, excluded.illness_key),
               age = CASE WHEN dim_sample.age = ?7 THEN excluded.age ELSE dim_sample.age END,
               sex = CASE WHEN dim_sample.sex = ?7 THEN excluded.sex ELSE dim_sample.sex END
             RETURNING sample_key",
          )?;
          for s in samples {
            let key: i64 = stmt.query_row(
              rusqlite::params![
                s.accession,
                study_key,
                s.platform_key,
                s.illness_key,
                s.age,
                s.sex,
                UNKNOWN,
              ],
              |r| r.get(0),
            )?;
            keys.push((s.accession, key));
          }
        }
        tx.commit()?;
        Ok(keys)
      })
      .await?;
    Ok(keys)
  }

  // ── Resume state ──────────────────────────────────────────────────────────

  async fn load_resume_state(&self, study_accession: String) -> Result<Option<StudyResumeState>> {
    let raw = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT study_accession, last_processed_gene, last_sample_index,
                      metadata_loaded, updated_at
                 FROM etl_study_state WHERE study_accession = ?1",
              rusqlite::params![study_accession],
              RawResumeState::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawResumeState::into_state).transpose()
  }

  async fn save_resume_state(&self, state: StudyResumeState) -> Result<()> {
    let updated_at = encode_dt(Utc::now());
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO etl_study_state
                  (study_accession, last_processed_gene, last_sample_index,
                   metadata_loaded, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT (study_accession) DO UPDATE SET
             last_processed_gene = excluded.last_processed_gene,
             last_sample_index   = excluded.last_sample_index,
             metadata_loaded     = excluded.metadata_loaded,
             updated_at          = excluded.updated_at",
          rusqlite::params![
            state.study_accession,
            state.last_processed_gene,
            state.last_sample_index as i64,
            state.metadata_loaded,
            updated_at,
          ],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn clear_resume_state(&self, study_accession: String) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "DELETE FROM etl_study_state WHERE study_accession = ?1",
          rusqlite::params![study_accession],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn list_resume_states(&self) -> Result<Vec<StudyResumeState>> {
    let raws = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT study_accession, last_processed_gene, last_sample_index,
                  metadata_loaded, updated_at
             FROM etl_study_state ORDER BY study_accession",
        )?;
        let rows = stmt
          .query_map([], RawResumeState::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawResumeState::into_state).collect()
  }

  // ── Facts ─────────────────────────────────────────────────────────────────

  async fn insert_expression_batch(&self, batch: ExpressionBatch) -> Result<usize> {
    let run_id = encode_uuid(batch.run_id);
    let now = encode_dt(Utc::now());

    let inserted = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut inserted = 0;
        {
          let mut stmt = tx.prepare_cached(
            "INSERT INTO fact_expression
                    (sample_key, gene_key, study_key, expression_value, run_id)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (sample_key, gene_key, study_key) DO NOTHING",
          )?;
          for f in &batch.facts {
            inserted += stmt.execute(rusqlite::params![
              f.sample_key,
              f.gene_key,
              batch.study_key,
              f.value,
              run_id,
            ])?;
          }
        }

        tx.execute(
          "INSERT INTO etl_study_state
                  (study_accession, last_processed_gene, last_sample_index,
                   metadata_loaded, updated_at)
           VALUES (?1, ?2, ?3, 1, ?4)
           ON CONFLICT (study_accession) DO UPDATE SET
             last_processed_gene = excluded.last_processed_gene,
             last_sample_index   = excluded.last_sample_index,
             metadata_loaded     = 1,
             updated_at          = excluded.updated_at",
          rusqlite::params![
            batch.study_accession,
            batch.cursor.gene_id,
            batch.cursor.sample_index as i64,
            now,
          ],
        )?;

        tx.execute(
          "INSERT INTO checkpoints
                  (run_id, study_accession, table_name, batch_index, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          rusqlite::params![
            run_id,
            batch.study_accession,
            EXPRESSION_TABLE,
            batch.batch_index as i64,
            now,
          ],
        )?;

        tx.commit()?;
        Ok(inserted)
      })
      .await?;
    Ok(inserted)
  }

  async fn load_expression_matrix(&self, study_key: StudyKey) -> Result<ExpressionMatrix> {
    let matrix = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT gene_key, sample_key, expression_value
             FROM fact_expression WHERE study_key = ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![study_key], |r| {
          Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, f64>(2)?))
        })?;
        let mut matrix = ExpressionMatrix::new();
        for row in rows {
          let (gene, sample, value) = row?;
          matrix.entry(gene).or_default().insert(sample, value);
        }
        Ok(matrix)
      })
      .await?;
    Ok(matrix)
  }

  async fn load_cohorts(&self, study_key: StudyKey) -> Result<CohortMap> {
    let cohorts = self
      .conn
      .call(move |conn| {
        let mut stmt =
          conn.prepare("SELECT sample_key, illness_key FROM dim_sample WHERE study_key = ?1")?;
        let cohorts = stmt
          .query_map(rusqlite::params![study_key], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, Option<i64>>(1)?))
          })?
          .collect::<rusqlite::Result<CohortMap>>()?;
        Ok(cohorts)
      })
      .await?;
    Ok(cohorts)
  }

  async fn replace_correlations(
    &self,
    study_key: StudyKey,
    records: Vec<CorrelationRecord>,
  ) -> Result<usize> {
    let written = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let deleted = tx.execute(
          "DELETE FROM fact_gene_pair_corr WHERE study_key = ?1",
          rusqlite::params![study_key],
        )?;
        {
          let mut stmt = tx.prepare_cached(
            "INSERT INTO fact_gene_pair_corr
                    (gene_a_key, gene_b_key, illness_key, study_key,
                     rho, p_value, q_value, n_samples, computed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
          )?;
          for r in &records {
            stmt.execute(rusqlite::params![
              r.gene_a_key,
              r.gene_b_key,
              r.illness_key,
              study_key,
              r.rho,
              r.p_value,
              r.q_value,
              r.n_samples as i64,
              encode_dt(r.computed_at),
            ])?;
          }
        }
        tx.commit()?;
        debug!(study_key, deleted, inserted = records.len(), "correlations replaced");
        Ok(records.len())
      })
      .await?;
    Ok(written)
  }

  async fn studies_with_expression(&self) -> Result<Vec<StudyDescriptor>> {
    let studies = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT s.study_key, s.gse_accession
             FROM dim_study s
            WHERE EXISTS (SELECT 1 FROM fact_expression f WHERE f.study_key = s.study_key)
            ORDER BY s.gse_accession",
        )?;
        let rows = stmt
          .query_map([], |r| {
            Ok(StudyDescriptor { study_key: r.get(0)?, accession: r.get(1)? })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(studies)
  }

  // ── Runs ──────────────────────────────────────────────────────────────────

  async fn begin_run(&self, config_hash: String) -> Result<Run> {
    let run = Run {
      run_id: Uuid::new_v4(),
      started_at: Utc::now(),
      finished_at: None,
      status: RunStatus::Running,
      config_hash,
    };

    let id_str = encode_uuid(run.run_id);
    let at_str = encode_dt(run.started_at);
    let status = run.status.as_str();
    let hash = run.config_hash.clone();

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO runs (run_id, started_at, status, config_hash) VALUES (?1, ?2, ?3, ?4)",
          rusqlite::params![id_str, at_str, status, hash],
        )?;
        Ok(())
      })
      .await?;
    Ok(run)
  }

  async fn finish_run(&self, run_id: Uuid, status: RunStatus) -> Result<()> {
    let id_str = encode_uuid(run_id);
    let at_str = encode_dt(Utc::now());
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE runs SET status = ?2, finished_at = ?3 WHERE run_id = ?1",
          rusqlite::params![id_str, status.as_str(), at_str],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>> {
    let id_str = encode_uuid(run_id);
    let raw = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT run_id, started_at, finished_at, status, config_hash
                 FROM runs WHERE run_id = ?1",
              rusqlite::params![id_str],
              RawRun::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawRun::into_run).transpose()
  }

  async fn record_metrics(
    &self,
    run_id: Uuid,
    study_accession: String,
    metrics: Vec<Metric>,
  ) -> Result<()> {
    let id_str = encode_uuid(run_id);
    let now = encode_dt(Utc::now());
    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
          let mut stmt = tx.prepare_cached(
            "INSERT INTO metrics (run_id, study_accession, metric_key, metric_value, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
          )?;
          for m in &metrics {
            stmt.execute(rusqlite::params![id_str, study_accession, m.key, m.value, now])?;
          }
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn latest_checkpoint(
    &self,
    run_id: Uuid,
    study_accession: Option<String>,
  ) -> Result<Option<Checkpoint>> {
    let id_str = encode_uuid(run_id);
    let raw = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT run_id, study_accession, table_name, batch_index, created_at
                 FROM checkpoints
                WHERE run_id = ?1 AND (?2 IS NULL OR study_accession = ?2)
                ORDER BY checkpoint_id DESC
                LIMIT 1",
              rusqlite::params![id_str, study_accession],
              RawCheckpoint::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawCheckpoint::into_checkpoint).transpose()
  }

  async fn report(&self, run_id: Uuid) -> Result<RunReport> {
    let id_str = encode_uuid(run_id);
    let (status, rows) = self
      .conn
      .call(move |conn| {
        let status: Option<String> = conn
          .query_row(
            "SELECT status FROM runs WHERE run_id = ?1",
            rusqlite::params![id_str],
            |r| r.get(0),
          )
          .optional()?;
        let mut stmt = conn.prepare(
          "SELECT study_accession, metric_key, metric_value
             FROM metrics WHERE run_id = ?1 ORDER BY metric_id",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![id_str], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, f64>(2)?))
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((status, rows))
      })
      .await?;

    let mut report = RunReport {
      run_id: status.as_ref().map(|_| run_id),
      status: status.as_deref().map(decode_run_status).transpose()?,
      ..RunReport::default()
    };
    // A metric recorded twice for a study keeps its latest value.
    for (study, key, value) in rows {
      report.studies.entry(study).or_default().insert(key, value);
    }
    Ok(report)
  }

  async fn rollback_run(&self, run_id: Uuid) -> Result<RollbackSummary> {
    let id_str = encode_uuid(run_id);
    let summary = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        // Cursors of studies this run touched would point past deleted facts.
        let resume_states = tx.execute(
          "DELETE FROM etl_study_state WHERE study_accession IN
             (SELECT study_accession FROM checkpoints WHERE run_id = ?1)",
          [&id_str],
        )?;
        let summary = RollbackSummary {
          resume_states,
          expression_facts: tx.execute("DELETE FROM fact_expression WHERE run_id = ?1", [&id_str])?,
          metrics:          tx.execute("DELETE FROM metrics WHERE run_id = ?1", [&id_str])?,
          checkpoints:      tx.execute("DELETE FROM checkpoints WHERE run_id = ?1", [&id_str])?,
          runs:             tx.execute("DELETE FROM runs WHERE run_id = ?1", [&id_str])?,
        };
        tx.commit()?;
        Ok(summary)
      })
      .await?;
    debug!(%run_id, ?summary, "run rolled back");
    Ok(summary)
  }
}
