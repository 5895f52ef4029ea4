use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

/// One export or import run as seen by the history endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRun {
    pub storage: String,
    pub kind: String,
    pub status: String,
    pub step: String,
    pub title: String,
    pub message: String,
    pub archive: Option<String>,
    pub error: Option<String>,
    pub started_at: String,
    pub updated_at: String,
    pub finished_at: Option<String>,
}

/// Fields written on every status change.
#[derive(Debug, Clone)]
pub struct RunUpdate<'a> {
    pub storage: &'a str,
    pub kind: &'a str,
    pub status: &'a str,
    pub step: &'a str,
    pub title: &'a str,
    pub message: &'a str,
    pub archive: Option<&'a str>,
    pub error: Option<&'a str>,
    pub started_at: Option<&'a str>,
    pub terminal: bool,
}

fn row_to_run(row: &Row) -> rusqlite::Result<TransferRun> {
    Ok(TransferRun {
        storage: row.get("storage")?,
        kind: row.get("kind")?,
        status: row.get("status")?,
        step: row.get("step")?,
        title: row.get("title")?,
        message: row.get("message")?,
        archive: row.get("archive")?,
        error: row.get("error")?,
        started_at: row.get("started_at")?,
        updated_at: row.get("updated_at")?,
        finished_at: row.get("finished_at")?,
    })
}

pub fn find_recent(conn: &Connection, limit: i64) -> anyhow::Result<Vec<TransferRun>> {
    let mut stmt =
        conn.prepare("SELECT * FROM transfer_runs ORDER BY started_at DESC, rowid DESC LIMIT ?")?;
    let rows = stmt.query_map(params![limit], |row| row_to_run(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_by_storage(conn: &Connection, storage: &str) -> anyhow::Result<Option<TransferRun>> {
    let mut stmt = conn.prepare("SELECT * FROM transfer_runs WHERE storage = ?")?;
    let mut rows = stmt.query_map(params![storage], |row| row_to_run(row))?;
    Ok(rows.next().and_then(|r| r.ok()))
}

/// Insert the run on its first status, update it afterwards.
pub fn upsert(conn: &Connection, run: &RunUpdate) -> anyhow::Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    let started_at = run.started_at.map(str::to_string).unwrap_or_else(|| now.clone());
    let finished_at = run.terminal.then(|| now.clone());
    conn.execute(
        "INSERT INTO transfer_runs (storage, kind, status, step, title, message, archive, error, started_at, updated_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(storage) DO UPDATE SET
           status = excluded.status,
           step = excluded.step,
           title = excluded.title,
           message = excluded.message,
           archive = COALESCE(excluded.archive, transfer_runs.archive),
           error = excluded.error,
           updated_at = excluded.updated_at,
           finished_at = COALESCE(excluded.finished_at, transfer_runs.finished_at)",
        params![
            run.storage,
            run.kind,
            run.status,
            run.step,
            run.title,
            run.message,
            run.archive,
            run.error,
            started_at,
            now,
            finished_at,
        ],
    )?;
    Ok(())
}

pub fn delete_finished_before(conn: &Connection, cutoff: &str) -> anyhow::Result<usize> {
    let changes = conn.execute(
        "DELETE FROM transfer_runs WHERE finished_at IS NOT NULL AND finished_at < ?",
        params![cutoff],
    )?;
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE transfer_runs (
               storage TEXT PRIMARY KEY, kind TEXT NOT NULL, status TEXT NOT NULL,
               step TEXT NOT NULL DEFAULT '', title TEXT NOT NULL DEFAULT '',
               message TEXT NOT NULL DEFAULT '', archive TEXT, error TEXT,
               started_at TEXT NOT NULL, updated_at TEXT NOT NULL, finished_at TEXT)",
        )
        .unwrap();
        conn
    }

    fn update<'a>(status: &'a str, step: &'a str, archive: Option<&'a str>, terminal: bool) -> RunUpdate<'a> {
        RunUpdate {
            storage: "abc",
            kind: "export",
            status,
            step,
            title: step,
            message: "",
            archive,
            error: None,
            started_at: Some("2026-01-01T00:00:00+00:00"),
            terminal,
        }
    }

    #[test]
    fn test_upsert_keeps_one_row_per_run() {
        let conn = conn();
        upsert(&conn, &update("running", "init", None, false)).unwrap();
        upsert(&conn, &update("running", "archive", Some("site-full.zip"), false)).unwrap();
        upsert(&conn, &update("done", "cleanup", None, true)).unwrap();

        let runs = find_recent(&conn, 10).unwrap();
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert_eq!(run.status, "done");
        assert_eq!(run.step, "cleanup");
        assert_eq!(run.archive.as_deref(), Some("site-full.zip"));
        assert_eq!(run.started_at, "2026-01-01T00:00:00+00:00");
        assert!(run.finished_at.is_some());

        assert!(find_by_storage(&conn, "missing").unwrap().is_none());
        assert_eq!(delete_finished_before(&conn, "9999").unwrap(), 1);
    }
}
