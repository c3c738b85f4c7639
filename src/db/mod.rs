pub mod retry;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::error::{Error, Result};

/// Writers queue on the SQLite lock for this long before BUSY surfaces.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn create_pool(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
        .map_err(|e| Error::Fatal(format!("invalid database path {}: {e}", path.display())))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .map_err(|e| Error::Fatal(format!("cannot open store at {}: {e}", path.display())))
}

/// Starts a transaction that holds the write lock from its first statement.
///
/// A deferred transaction that reads and then writes gets BUSY on the lock
/// upgrade without waiting; `BEGIN IMMEDIATE` waits out [`BUSY_TIMEOUT`].
pub async fn begin_write(pool: &SqlitePool) -> Result<Transaction<'static, Sqlite>> {
    Ok(pool.begin_with("BEGIN IMMEDIATE").await?)
}

/// Apply the migrations embedded in ./migrations/
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
