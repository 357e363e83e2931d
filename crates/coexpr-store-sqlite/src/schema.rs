//! SQL schema for the coexpr SQLite store.
//!
//! Executed once per connection at startup. Future migrations will be gated
//! on `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `CREATE … IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- ── Dimensions ──────────────────────────────────────────────────────────────
-- Created lazily on first reference, never deleted by a rollback.

CREATE TABLE IF NOT EXISTS dim_gene (
    gene_key    INTEGER PRIMARY KEY AUTOINCREMENT,
    ensembl_id  TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS dim_study (
    study_key     INTEGER PRIMARY KEY AUTOINCREMENT,
    gse_accession TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS dim_platform (
    platform_key  INTEGER PRIMARY KEY AUTOINCREMENT,
    gpl_accession TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS dim_illness (
    illness_key INTEGER PRIMARY KEY AUTOINCREMENT,
    label       TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS dim_sample (
    sample_key    INTEGER PRIMARY KEY AUTOINCREMENT,
    gsm_accession TEXT NOT NULL,
    study_key     INTEGER NOT NULL REFERENCES dim_study(study_key),
    platform_key  INTEGER REFERENCES dim_platform(platform_key),
    illness_key   INTEGER REFERENCES dim_illness(illness_key),
    age           TEXT NOT NULL DEFAULT 'UNKNOWN',
    sex           TEXT NOT NULL DEFAULT 'UNKNOWN',
    UNIQUE (gsm_accession, study_key)
);

-- ── Runs ────────────────────────────────────────────────────────────────────

CREATE TABLE IF NOT EXISTS runs (
    run_id      TEXT PRIMARY KEY,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    status      TEXT NOT NULL,   -- 'running' | 'completed' | 'partial' | 'failed'
    config_hash TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoints (
    checkpoint_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id          TEXT NOT NULL REFERENCES runs(run_id),
    study_accession TEXT NOT NULL,
    table_name      TEXT NOT NULL,
    batch_index     INTEGER NOT NULL,
    created_at      TEXT NOT NULL,
    UNIQUE (run_id, study_accession, table_name, batch_index)
);

CREATE TABLE IF NOT EXISTS metrics (
    metric_id       INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id          TEXT NOT NULL REFERENCES runs(run_id),
    study_accession TEXT NOT NULL,
    metric_key      TEXT NOT NULL,
    metric_value    REAL NOT NULL,
    created_at      TEXT NOT NULL
);

-- Present only while a study is incomplete.
CREATE TABLE IF NOT EXISTS etl_study_state (
    study_accession     TEXT PRIMARY KEY,
    last_processed_gene TEXT,
    last_sample_index   INTEGER NOT NULL DEFAULT 0,
    metadata_loaded     INTEGER NOT NULL DEFAULT 0,
    updated_at          TEXT NOT NULL
);

-- ── Facts ───────────────────────────────────────────────────────────────────

-- Append-only within a run; rows leave only through a rollback of their run.
CREATE TABLE IF NOT EXISTS fact_expression (
    expression_id    INTEGER PRIMARY KEY AUTOINCREMENT,
    sample_key       INTEGER NOT NULL REFERENCES dim_sample(sample_key),
    gene_key         INTEGER NOT NULL REFERENCES dim_gene(gene_key),
    study_key        INTEGER NOT NULL REFERENCES dim_study(study_key),
    expression_value REAL NOT NULL,
    run_id           TEXT NOT NULL REFERENCES runs(run_id),
    UNIQUE (sample_key, gene_key, study_key)
);

-- Replaced wholesale per study on every recomputation.
CREATE TABLE IF NOT EXISTS fact_gene_pair_corr (
    corr_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    gene_a_key  INTEGER NOT NULL REFERENCES dim_gene(gene_key),
    gene_b_key  INTEGER NOT NULL REFERENCES dim_gene(gene_key),
    illness_key INTEGER REFERENCES dim_illness(illness_key),
    study_key   INTEGER NOT NULL REFERENCES dim_study(study_key),
    rho         REAL NOT NULL,
    p_value     REAL NOT NULL,
    q_value     REAL,
    n_samples   INTEGER NOT NULL,
    computed_at TEXT NOT NULL,
    CHECK (gene_a_key < gene_b_key)
);

CREATE INDEX IF NOT EXISTS sample_study_idx     ON dim_sample(study_key);
CREATE INDEX IF NOT EXISTS expression_study_idx ON fact_expression(study_key);
CREATE INDEX IF NOT EXISTS expression_run_idx   ON fact_expression(run_id);
CREATE INDEX IF NOT EXISTS checkpoints_run_idx  ON checkpoints(run_id);
CREATE INDEX IF NOT EXISTS metrics_run_idx      ON metrics(run_id);
CREATE INDEX IF NOT EXISTS corr_study_idx       ON fact_gene_pair_corr(study_key);
-- NULL illness is a cohort of its own, so fold it into the uniqueness key.
CREATE UNIQUE INDEX IF NOT EXISTS corr_pair_idx
    ON fact_gene_pair_corr(gene_a_key, gene_b_key, IFNULL(illness_key, -1), study_key);

PRAGMA user_version = 1;
";
