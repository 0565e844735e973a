//! SQLite-backed identity directory

use super::{check_public_key, validate_username, IdentityDirectory, IdentityError, PublicKeyRecord, UserId};
use crate::crypto::EcJwk;
use crate::db::{self, DbPool};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

pub struct SqlIdentityDirectory {
    pool: DbPool,
}

impl SqlIdentityDirectory {
    /// The pool must already be migrated (see [`db::open_pool`])
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

fn row_to_key(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, String, bool, i64)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get::<_, i64>(4)? != 0,
        row.get(5)?,
    ))
}

fn into_record(
    (id, user_id, jwk, fingerprint, is_active, created_at): (i64, String, String, String, bool, i64),
) -> Result<PublicKeyRecord, IdentityError> {
    let jwk: EcJwk = serde_json::from_str(&jwk)
        .map_err(|e| IdentityError::Storage(format!("corrupt key {}: {}", id, e)))?;
    Ok(PublicKeyRecord {
        id,
        user_id: UserId(user_id),
        jwk,
        fingerprint,
        is_active,
        created_at: millis_to_datetime(created_at),
    })
}

const KEY_COLUMNS: &str = "k.id, k.user_id, k.jwk, k.fingerprint, k.is_active, k.created_at";

fn lookup_user(conn: &Connection, username: &str) -> Result<UserId, IdentityError> {
    conn.query_row(
        "SELECT id FROM users WHERE username = ?",
        params![username],
        |row| row.get::<_, String>(0),
    )
    .optional()?
    .map(UserId)
    .ok_or_else(|| IdentityError::UnknownUser(username.to_string()))
}

/// Insert `jwk` as the only active key of `user_id`
fn insert_active_key(conn: &Connection, user_id: &UserId, jwk: &EcJwk) -> Result<PublicKeyRecord, IdentityError> {
    let fingerprint = jwk
        .fingerprint()
        .map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
    let created_at = Utc::now().timestamp_millis();

    conn.execute(
        "UPDATE public_keys SET is_active = 0 WHERE user_id = ?",
        params![user_id.as_str()],
    )?;
    conn.execute(
        "INSERT INTO public_keys (user_id, jwk, fingerprint, is_active, created_at)
         VALUES (?, ?, ?, 1, ?)",
        params![user_id.as_str(), jwk.to_json(), fingerprint, created_at],
    )?;

    Ok(PublicKeyRecord {
        id: conn.last_insert_rowid(),
        user_id: user_id.clone(),
        jwk: jwk.clone(),
        fingerprint,
        is_active: true,
        created_at: millis_to_datetime(created_at),
    })
}

#[async_trait]
impl IdentityDirectory for SqlIdentityDirectory {
    async fn resolve_user_id(&self, username: &str) -> Result<UserId, IdentityError> {
        let username = username.to_string();
        db::blocking(&self.pool, move |conn| lookup_user(conn, &username)).await
    }

    async fn active_key(&self, username: &str) -> Result<PublicKeyRecord, IdentityError> {
        let username = username.to_string();
        db::blocking(&self.pool, move |conn| {
            let user_id = lookup_user(conn, &username)?;
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM public_keys k WHERE k.user_id = ? AND k.is_active = 1
                         ORDER BY k.id DESC LIMIT 1",
                        KEY_COLUMNS
                    ),
                    params![user_id.as_str()],
                    row_to_key,
                )
                .optional()?
                .ok_or_else(|| IdentityError::NoActiveKey(username.clone()))?;
            into_record(row)
        })
        .await
    }

    async fn user_count(&self) -> Result<usize, IdentityError> {
        db::blocking(&self.pool, |conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
            Ok(count.max(0) as usize)
        })
        .await
    }

    async fn register_user(&self, username: &str, public_key: &EcJwk) -> Result<UserId, IdentityError> {
        validate_username(username)?;
        let jwk = check_public_key(public_key)?;
        let username = username.to_string();

        db::blocking(&self.pool, move |conn| {
            let tx = conn.unchecked_transaction()?;
            let exists: Option<String> = tx
                .query_row(
                    "SELECT id FROM users WHERE username = ?",
                    params![username],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(IdentityError::UsernameTaken(username));
            }

            let user_id = UserId::generate();
            tx.execute(
                "INSERT INTO users (id, username, created_at) VALUES (?, ?, ?)",
                params![user_id.as_str(), username, Utc::now().timestamp_millis()],
            )?;
            insert_active_key(&tx, &user_id, &jwk)?;
            tx.commit()?;

            info!(%username, %user_id, "Registered user");
            Ok(user_id)
        })
        .await
    }

    async fn add_public_key(
        &self,
        username: &str,
        public_key: &EcJwk,
    ) -> Result<PublicKeyRecord, IdentityError> {
        let jwk = check_public_key(public_key)?;
        let username = username.to_string();

        db::blocking(&self.pool, move |conn| {
            let tx = conn.unchecked_transaction()?;
            let user_id = lookup_user(&tx, &username)?;
            let record = insert_active_key(&tx, &user_id, &jwk)?;
            tx.commit()?;
            info!(%username, key_id = record.id, "Activated new public key");
            Ok(record)
        })
        .await
    }

    async fn deactivate_key(&self, username: &str, key_id: i64) -> Result<(), IdentityError> {
        let username = username.to_string();
        db::blocking(&self.pool, move |conn| {
            let user_id = lookup_user(conn, &username)?;
            let changed = conn.execute(
                "UPDATE public_keys SET is_active = 0 WHERE id = ? AND user_id = ?",
                params![key_id, user_id.as_str()],
            )?;
            if changed == 0 {
                return Err(IdentityError::KeyNotFound(key_id));
            }
            Ok(())
        })
        .await
    }

    async fn list_keys(&self, username: &str) -> Result<Vec<PublicKeyRecord>, IdentityError> {
        let username = username.to_string();
        db::blocking(&self.pool, move |conn| {
            let user_id = lookup_user(conn, &username)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM public_keys k WHERE k.user_id = ? ORDER BY k.id ASC",
                KEY_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![user_id.as_str()], row_to_key)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(into_record).collect()
        })
        .await
    }
}
