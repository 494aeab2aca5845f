//! SQLite pooling for the chat store.
//!
//! Every pooled connection is prepared the same way: WAL journaling, foreign
//! key enforcement, and a busy timeout so concurrent writers back off instead
//! of failing immediately.

use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

/// Default busy timeout applied to every connection.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Default upper bound on pooled connections.
pub const DEFAULT_POOL_MAX_SIZE: u32 = 8;

/// Pool of SQLite connections shared across request handlers.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Tunables for the pool, fed from server configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    pub busy_timeout_ms: u64,
    pub pool_max_size: u32,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            pool_max_size: DEFAULT_POOL_MAX_SIZE,
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("could not build SQLite pool: {0}")]
    Build(#[from] r2d2::Error),
}

/// Opens (creating if absent) the database at `db_path` and returns a pool
/// whose connections are all prepared by [`prepare_connection`].
///
/// # Errors
///
/// Returns [`PoolError::Build`] when the pool cannot produce its initial
/// connection, e.g. an unwritable path.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    let busy_timeout_ms = settings.busy_timeout_ms;
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(move |conn| prepare_connection(conn, busy_timeout_ms));

    Ok(Pool::builder()
        .max_size(settings.pool_max_size)
        .build(manager)?)
}

/// Puts a fresh connection into the state the store code assumes.
///
/// SQLite answers `PRAGMA journal_mode = WAL` with the mode actually in
/// effect; in-memory databases stay on `memory`, which is fine for tests.
/// Any other answer means WAL could not be enabled and the connection is
/// rejected.
fn prepare_connection(conn: &Connection, busy_timeout_ms: u64) -> rusqlite::Result<()> {
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    if !matches!(mode.as_str(), "wal" | "memory") {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("journal_mode is '{mode}', expected wal")),
        ));
    }

    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
    Ok(())
}
