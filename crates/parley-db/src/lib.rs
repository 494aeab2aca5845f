//! Database layer for Parley.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! and embedded SQL migrations. Every table in Parley is created through
//! versioned migrations managed by this crate.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: a chat backend of this size needs no external
//!   database process. WAL mode allows concurrent readers with a single
//!   writer, which matches the access pattern (history reads dominate).
//! - **`r2d2` connection pool**: bounded connection reuse without manual
//!   lifetime management.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!`, so migrations ship with the server and cannot drift
//!   from the code that depends on them.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{
    create_pool, DbPool, DbRuntimeSettings, PoolError, DEFAULT_BUSY_TIMEOUT_MS,
    DEFAULT_POOL_MAX_SIZE,
};
