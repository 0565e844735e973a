//! Database migrations
//!
//! Versioned schema for users, public keys and stored messages. Each
//! migration runs in its own transaction and is recorded in `schema_version`.

use super::{DbPool, DbResult};
use rusqlite::params;
use tracing::info;

/// Current schema version
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Migration descriptor
pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    pub up_sql: &'static str,
}

/// All available migrations in order
pub fn get_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Users and public keys",
            up_sql: r#"
                CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,                    -- UserId (uuid)
                    username TEXT NOT NULL UNIQUE,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS public_keys (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT NOT NULL,
                    jwk TEXT NOT NULL,                      -- public EC JWK as JSON
                    fingerprint TEXT NOT NULL,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at INTEGER NOT NULL,
                    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
                );

                CREATE INDEX IF NOT EXISTS idx_public_keys_active ON public_keys(user_id, is_active);
            "#,
        },
        Migration {
            version: 2,
            description: "Store-and-forward messages",
            up_sql: r#"
                CREATE TABLE IF NOT EXISTS messages (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,  -- creation order
                    id TEXT NOT NULL UNIQUE,
                    sender_id TEXT NOT NULL,
                    receiver_id TEXT NOT NULL,
                    sender_username TEXT NOT NULL,
                    receiver_username TEXT NOT NULL,
                    plaintext TEXT NOT NULL,
                    message_hash TEXT NOT NULL,
                    signature_r TEXT NOT NULL,
                    signature_s TEXT NOT NULL,
                    timestamp TEXT NOT NULL,                -- signed ISO-8601 timestamp
                    status TEXT NOT NULL CHECK(status IN ('PENDING', 'DELIVERED', 'READ')),
                    created_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_messages_pending ON messages(receiver_id, status, seq);
                CREATE INDEX IF NOT EXISTS idx_messages_pair ON messages(sender_username, receiver_username, seq);
            "#,
        },
    ]
}

/// Get the current schema version (0 for a fresh database)
pub fn get_current_version(pool: &DbPool) -> DbResult<i32> {
    let conn = pool.get()?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Result<i32, _> = conn.query_row(
        "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
        [],
        |row| row.get(0),
    );

    Ok(version.unwrap_or(0))
}

/// Run all pending migrations
pub fn migrate(pool: &DbPool) -> DbResult<()> {
    let current_version = get_current_version(pool)?;
    let pending: Vec<_> = get_migrations()
        .into_iter()
        .filter(|m| m.version > current_version)
        .collect();

    if pending.is_empty() {
        return Ok(());
    }

    let conn = pool.get()?;
    for migration in pending {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.up_sql)?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
            params![migration.version, chrono::Utc::now().timestamp_millis()],
        )?;
        tx.commit()?;

        info!(
            version = migration.version,
            description = migration.description,
            "Applied migration"
        );
    }

    Ok(())
}
