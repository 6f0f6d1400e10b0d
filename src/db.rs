use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

/// Opens the SQLite database at `path`, creating parent directories as needed.
pub fn open(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed creating database directory: {}", parent.display())
            })?;
        }
    }
    let conn = Connection::open(path)
        .with_context(|| format!("failed opening database: {}", path.display()))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    // the server and a background delivery task may write at the same time
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Quotes an SQL identifier, doubling any embedded quote characters.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
