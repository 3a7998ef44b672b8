//! Embedded schema migration, applied at startup.

use diesel_async::AsyncPgConnection;
use diesel_async::SimpleAsyncConnection;

/// SQL migration for the benchmark results tables.
///
/// Every get-or-create path is backed by a unique constraint here; the
/// ingestion retry loop depends on those constraints firing.
pub const MIGRATION_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS manifest_reduced (
    id              BIGSERIAL PRIMARY KEY,
    hash            VARCHAR(64) NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS manifests (
    id              BIGSERIAL PRIMARY KEY,
    manifest        TEXT NOT NULL,
    manifest_hash   VARCHAR(40) NOT NULL UNIQUE,
    reduced_id      BIGINT REFERENCES manifest_reduced(id)
);

CREATE TABLE IF NOT EXISTS results (
    id                      BIGSERIAL PRIMARY KEY,
    name                    VARCHAR(256) NOT NULL,
    build_id                BIGINT NOT NULL,
    build_number            BIGINT NOT NULL DEFAULT 0,
    build_url               VARCHAR(1024) NOT NULL,
    branch_name             VARCHAR(256) NOT NULL DEFAULT '',
    gerrit_change_number    VARCHAR(256),
    gerrit_patchset_number  VARCHAR(256),
    gerrit_change_id        VARCHAR(256),
    gerrit_change_url       VARCHAR(1024),
    manifest_id             BIGINT NOT NULL REFERENCES manifests(id),
    annotation              TEXT,
    completed               BOOLEAN NOT NULL DEFAULT FALSE,
    reported                BOOLEAN NOT NULL DEFAULT FALSE,
    created_at              TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (name, build_id)
);

CREATE INDEX IF NOT EXISTS idx_results_branch_created ON results (branch_name, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_results_manifest ON results (manifest_id);

CREATE TABLE IF NOT EXISTS environments (
    id              BIGSERIAL PRIMARY KEY,
    identifier      VARCHAR(128) NOT NULL UNIQUE,
    name            VARCHAR(128) NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS benchmarks (
    id              BIGSERIAL PRIMARY KEY,
    name            VARCHAR(256) NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS test_jobs (
    id              VARCHAR(100) PRIMARY KEY,
    result_id       BIGINT NOT NULL REFERENCES results(id) ON DELETE CASCADE,
    status          VARCHAR(16) NOT NULL DEFAULT '',
    initialized     BOOLEAN NOT NULL DEFAULT FALSE,
    completed       BOOLEAN NOT NULL DEFAULT FALSE,
    resubmitted     BOOLEAN NOT NULL DEFAULT FALSE,
    environment_id  BIGINT REFERENCES environments(id),
    data            BYTEA,
    data_filetype   VARCHAR(16),
    runner_kind     VARCHAR(64) NOT NULL,
    runner_url      VARCHAR(1024) NOT NULL,
    url             VARCHAR(1024),
    definition      TEXT,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_test_jobs_result ON test_jobs (result_id);
CREATE INDEX IF NOT EXISTS idx_test_jobs_completed ON test_jobs (completed);

CREATE TABLE IF NOT EXISTS result_data (
    id              BIGSERIAL PRIMARY KEY,
    benchmark_id    BIGINT NOT NULL REFERENCES benchmarks(id),
    result_id       BIGINT NOT NULL REFERENCES results(id) ON DELETE CASCADE,
    test_job_id     VARCHAR(100) REFERENCES test_jobs(id) ON DELETE CASCADE,
    name            VARCHAR(256) NOT NULL,
    measurements    DOUBLE PRECISION[] NOT NULL CHECK (cardinality(measurements) > 0),
    board           VARCHAR(128) NOT NULL DEFAULT '',
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_result_data_result ON result_data (result_id);
CREATE INDEX IF NOT EXISTS idx_result_data_test_job ON result_data (test_job_id);

CREATE TABLE IF NOT EXISTS scheduled_tasks (
    id              BIGSERIAL PRIMARY KEY,
    kind            VARCHAR(64) NOT NULL,
    payload         JSONB NOT NULL,
    not_before      TIMESTAMPTZ NOT NULL,
    status          VARCHAR(16) NOT NULL DEFAULT 'pending',
    attempts        INTEGER NOT NULL DEFAULT 0,
    locked_by       VARCHAR(64),
    locked_at       TIMESTAMPTZ,
    last_error      TEXT,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_due ON scheduled_tasks (status, not_before);
"#;

/// Apply the schema migration.
pub async fn run_migration(conn: &mut AsyncPgConnection) -> anyhow::Result<()> {
    conn.batch_execute(MIGRATION_SQL)
        .await
        .map_err(|e| anyhow::anyhow!("benchmark schema migration failed: {e}"))?;
    Ok(())
}
