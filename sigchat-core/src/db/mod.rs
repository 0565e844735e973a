//! SQLite connection pool shared by the identity directory and the message store

pub mod migrations;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Blocking task failed: {0}")]
    Task(String),
}

/// Open (or create) a database file and bring its schema up to date
pub fn open_pool(path: impl AsRef<Path>) -> DbResult<DbPool> {
    let manager = SqliteConnectionManager::file(path.as_ref())
        .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
    let pool = Pool::new(manager)?;
    migrations::migrate(&pool)?;
    Ok(pool)
}

/// Single-connection in-memory database.
///
/// Every SQLite `:memory:` connection is its own database, so the pool is capped at one.
pub fn memory_pool() -> DbResult<DbPool> {
    let manager = SqliteConnectionManager::memory()
        .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
    let pool = Pool::builder().max_size(1).build(manager)?;
    migrations::migrate(&pool)?;
    Ok(pool)
}

/// Run a synchronous database closure on the blocking pool
pub async fn blocking<T, E, F>(pool: &DbPool, f: F) -> Result<T, E>
where
    F: FnOnce(&Connection) -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<DbError> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(DbError::from)?;
        f(&conn)
    })
    .await
    .map_err(|e| E::from(DbError::Task(e.to_string())))?
}
