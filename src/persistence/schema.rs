//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS` so the
//! bootstrap can run on every startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS sessions (
    id              TEXT PRIMARY KEY NOT NULL,
    parent_id       TEXT,
    child_ids       TEXT NOT NULL DEFAULT '[]',
    level           TEXT NOT NULL CHECK(level IN ('meta','primary','secondary','worker')),
    depth           INTEGER NOT NULL DEFAULT 0,
    objective_ids   TEXT NOT NULL DEFAULT '[]',
    consumed_budget INTEGER NOT NULL DEFAULT 0,
    budget_limit    INTEGER NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('active','delegated','completed','failed')),
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoints (
    id                TEXT PRIMARY KEY NOT NULL,
    session_id        TEXT NOT NULL,
    type              TEXT NOT NULL CHECK(type IN ('automatic','manual','pre_delegation','error_recovery','milestone')),
    timestamp         TEXT NOT NULL,
    context_blob      BLOB NOT NULL,
    compressed        INTEGER NOT NULL DEFAULT 0,
    objectives_json   TEXT NOT NULL,
    results_json      TEXT NOT NULL,
    agent_states_json TEXT,
    size_bytes        INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS continuity_bridges (
    id                TEXT PRIMARY KEY NOT NULL,
    source_session    TEXT NOT NULL,
    target_session    TEXT NOT NULL,
    timestamp         TEXT NOT NULL,
    objective_ids_json TEXT NOT NULL,
    progress_map_json TEXT NOT NULL,
    integrity_hash    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS recovery_events (
    id              TEXT PRIMARY KEY NOT NULL,
    session_id      TEXT NOT NULL,
    checkpoint_id   TEXT NOT NULL,
    success         INTEGER NOT NULL,
    elapsed_ms      INTEGER NOT NULL,
    detail          TEXT,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS global_objectives (
    id                       TEXT PRIMARY KEY NOT NULL,
    name                     TEXT NOT NULL,
    priority                 TEXT NOT NULL CHECK(priority IN ('low','medium','high','critical')),
    target_metrics_json      TEXT NOT NULL DEFAULT '{}',
    completion_criteria_json TEXT NOT NULL DEFAULT '[]',
    progress                 REAL NOT NULL DEFAULT 0.0,
    status                   TEXT NOT NULL CHECK(status IN ('active','completed')),
    created_at               TEXT NOT NULL,
    updated_at               TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_session ON checkpoints(session_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_bridges_source ON continuity_bridges(source_session);
CREATE INDEX IF NOT EXISTS idx_recovery_session ON recovery_events(session_id);
CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
