use rusqlite::Connection;
use std::path::{Path, PathBuf};

pub const DB_FILE: &str = "gym.sqlite3";

pub fn db_path(workspace: &Path) -> PathBuf {
    workspace.join(DB_FILE)
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let conn = Connection::open(db_path(workspace))?;

    // Records are stored as whole JSON documents, the way the browser's
    // document store kept them, so older or malformed shapes survive until a
    // maintenance pass looks at them.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS records(
            kind TEXT NOT NULL,
            id TEXT NOT NULL,
            body TEXT NOT NULL,
            updated_at TEXT,
            PRIMARY KEY(kind, id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_records_kind ON records(kind)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

pub fn count_records(conn: &Connection, kind: &str) -> anyhow::Result<i64> {
    let n = conn.query_row(
        "SELECT COUNT(*) FROM records WHERE kind = ?",
        [kind],
        |r| r.get::<_, i64>(0),
    )?;
    Ok(n)
}
