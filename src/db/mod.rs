pub mod jobs;
pub mod targets;

use std::path::Path;

use tokio_rusqlite::Connection;

use crate::error::Result;

/// Open (or create) the ledger database and apply the schema.
///
/// Journal mode, synchronous level, busy timeout and foreign-key enforcement
/// are part of the on-disk contract for operators inspecting the file with
/// standard tools.
pub async fn open(dsn: &str) -> Result<Connection> {
    if let Some(parent) = Path::new(dsn).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(dsn.to_owned()).await?;
    init(&conn).await?;
    Ok(conn)
}

/// In-memory ledger for tests.
pub async fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().await?;
    init(&conn).await?;
    Ok(conn)
}

async fn init(conn: &Connection) -> Result<()> {
    conn.call(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 10000;
             PRAGMA foreign_keys = ON;",
        )?;
        c.execute_batch(include_str!("schema.sql"))?;
        Ok(())
    })
    .await?;
    Ok(())
}
