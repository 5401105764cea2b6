//! `SQLite` connection pool with WAL mode and foreign keys enabled.
//!
//! The [`SessionDbPragmas`] runs on each new connection. The busy timeout
//! matters here: several instances may share one database file, and
//! `IMMEDIATE` transactions queue on the write lock instead of failing.

use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::errors::Result;

/// Pool shared by every store handle on one database file.
pub type ConnectionPool = Pool<SqliteConnectionManager>;

/// Pool sizing and lock wait.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Connections kept open.
    pub pool_size: u32,
    /// How long a writer waits on the database lock, in ms.
    pub busy_timeout_ms: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug)]
struct SessionDbPragmas {
    busy_timeout_ms: u32,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for SessionDbPragmas {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;\
             PRAGMA busy_timeout = {};\
             PRAGMA foreign_keys = ON;\
             PRAGMA synchronous = NORMAL;",
            self.busy_timeout_ms
        ))?;
        Ok(())
    }
}

fn build(manager: SqliteConnectionManager, config: &ConnectionConfig) -> Result<ConnectionPool> {
    let pool = Pool::builder()
        .max_size(config.pool_size)
        .connection_timeout(Duration::from_secs(5))
        .connection_customizer(Box::new(SessionDbPragmas {
            busy_timeout_ms: config.busy_timeout_ms,
        }))
        .build(manager)?;
    Ok(pool)
}

/// Create an in-memory pool. Each `:memory:` connection is a separate
/// database, so the pool is capped at one connection.
pub fn new_in_memory(config: &ConnectionConfig) -> Result<ConnectionPool> {
    build(
        SqliteConnectionManager::memory(),
        &ConnectionConfig {
            pool_size: 1,
            ..config.clone()
        },
    )
}

/// Create a file-backed pool.
pub fn new_file(path: &std::path::Path, config: &ConnectionConfig) -> Result<ConnectionPool> {
    build(SqliteConnectionManager::file(path), config)
}
