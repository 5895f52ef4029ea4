use crate::db::connection::DbPool;
use std::fs;
use std::path::Path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS transfer_runs (
  storage TEXT PRIMARY KEY,
  kind TEXT NOT NULL CHECK(kind IN ('export','import')),
  status TEXT NOT NULL DEFAULT 'running' CHECK(status IN ('running','confirm','done','error')),
  step TEXT NOT NULL DEFAULT '',
  title TEXT NOT NULL DEFAULT '',
  message TEXT NOT NULL DEFAULT '',
  archive TEXT,
  error TEXT,
  started_at TEXT NOT NULL DEFAULT (datetime('now')),
  updated_at TEXT NOT NULL DEFAULT (datetime('now')),
  finished_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_transfer_runs_started_at ON transfer_runs(started_at DESC);
"#;

pub fn migrate(pool: &DbPool, data_dir: &Path) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    fs::create_dir_all(data_dir)?;

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    let has_column = |table: &str, column: &str| -> anyhow::Result<bool> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(columns.iter().any(|c| c == column))
    };

    // Databases created before pipelines reported the archive name
    if !has_column("transfer_runs", "archive")? {
        conn.execute_batch("ALTER TABLE transfer_runs ADD COLUMN archive TEXT")?;
    }

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}
