//! SQLite-backed message store

use super::{
    check_transition, new_message_id, HistoryPage, MessageStatus, MessageStore, MessageSummary,
    NewMessage, StoreError, StoreResult, StoredMessage,
};
use crate::crypto::{EnvelopeSignature, SignedEnvelope};
use crate::db::{self, DbPool};
use crate::identity::UserId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

/// SQL-based storage for signed messages
pub struct SqlMessageStore {
    pool: DbPool,
}

impl SqlMessageStore {
    /// The pool must already be migrated (see [`db::open_pool`])
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, sender_username, receiver_username, \
     plaintext, message_hash, signature_r, signature_s, timestamp, status, created_at";

/// Raw row; status parsing happens outside the rusqlite closure
struct MessageRow {
    id: String,
    sender_id: String,
    receiver_id: String,
    envelope: SignedEnvelope,
    status: String,
    created_at: i64,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        envelope: SignedEnvelope {
            sender_username: row.get(3)?,
            receiver_username: row.get(4)?,
            plaintext_message: row.get(5)?,
            message_hash: row.get(6)?,
            signature: EnvelopeSignature {
                r: row.get(7)?,
                s: row.get(8)?,
            },
            timestamp: row.get(9)?,
        },
        status: row.get(10)?,
        created_at: row.get(11)?,
    })
}

impl TryFrom<MessageRow> for StoredMessage {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let status = row.status.parse::<MessageStatus>().map_err(|e| StoreError::Corrupt {
            id: row.id.clone(),
            reason: e.to_string(),
        })?;
        Ok(StoredMessage {
            id: row.id,
            sender_id: UserId(row.sender_id),
            receiver_id: UserId(row.receiver_id),
            envelope: row.envelope,
            status,
            created_at: DateTime::<Utc>::from_timestamp_millis(row.created_at).unwrap_or_default(),
        })
    }
}

fn collect_rows(rows: Vec<MessageRow>) -> StoreResult<Vec<StoredMessage>> {
    rows.into_iter().map(StoredMessage::try_from).collect()
}

#[async_trait]
impl MessageStore for SqlMessageStore {
    async fn create_message(&self, message: NewMessage) -> StoreResult<String> {
        db::blocking(&self.pool, move |conn| {
            let id = new_message_id();
            let env = &message.envelope;
            conn.execute(
                "INSERT INTO messages (id, sender_id, receiver_id, sender_username, receiver_username,
                    plaintext, message_hash, signature_r, signature_s, timestamp, status, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    id,
                    message.sender_id.as_str(),
                    message.receiver_id.as_str(),
                    env.sender_username,
                    env.receiver_username,
                    env.plaintext_message,
                    env.message_hash,
                    env.signature.r,
                    env.signature.s,
                    env.timestamp,
                    MessageStatus::Pending.as_str(),
                    Utc::now().timestamp_millis(),
                ],
            )?;
            Ok(id)
        })
        .await
    }

    async fn update_status(
        &self,
        id: &str,
        expected: MessageStatus,
        new: MessageStatus,
    ) -> StoreResult<bool> {
        check_transition(expected, new)?;
        let id = id.to_string();
        db::blocking(&self.pool, move |conn| {
            let changed = conn.execute(
                "UPDATE messages SET status = ? WHERE id = ? AND status = ?",
                params![new.as_str(), id, expected.as_str()],
            )?;
            if changed > 0 {
                return Ok(true);
            }
            let exists: Option<i64> = conn
                .query_row("SELECT 1 FROM messages WHERE id = ?", params![id], |row| row.get(0))
                .optional()?;
            match exists {
                Some(_) => Ok(false),
                None => Err(StoreError::NotFound(id)),
            }
        })
        .await
    }

    async fn list_pending(&self, receiver_id: &UserId) -> StoreResult<Vec<StoredMessage>> {
        let receiver_id = receiver_id.clone();
        db::blocking(&self.pool, move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages WHERE receiver_id = ? AND status = 'PENDING' ORDER BY seq ASC",
                MESSAGE_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![receiver_id.as_str()], read_row)?
                .collect::<Result<Vec<_>, _>>()?;
            collect_rows(rows)
        })
        .await
    }

    async fn get(&self, id: &str) -> StoreResult<Option<StoredMessage>> {
        let id = id.to_string();
        db::blocking(&self.pool, move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM messages WHERE id = ?", MESSAGE_COLUMNS),
                params![id],
                read_row,
            )
            .optional()?
            .map(StoredMessage::try_from)
            .transpose()
        })
        .await
    }

    async fn count_all(&self) -> StoreResult<usize> {
        db::blocking(&self.pool, |conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
            Ok(count.max(0) as usize)
        })
        .await
    }

    async fn recent(&self, limit: usize) -> StoreResult<Vec<StoredMessage>> {
        db::blocking(&self.pool, move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages ORDER BY seq DESC LIMIT ?",
                MESSAGE_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![sql_count(limit)], read_row)?
                .collect::<Result<Vec<_>, _>>()?;
            collect_rows(rows)
        })
        .await
    }

    async fn history(
        &self,
        user_a: &str,
        user_b: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<HistoryPage> {
        let (user_a, user_b) = (user_a.to_string(), user_b.to_string());
        db::blocking(&self.pool, move |conn| {
            const PAIR: &str = "(sender_username = ?1 AND receiver_username = ?2)
                 OR (sender_username = ?2 AND receiver_username = ?1)";

            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM messages WHERE {}", PAIR),
                params![user_a, user_b],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages WHERE {} ORDER BY seq ASC LIMIT ?3 OFFSET ?4",
                MESSAGE_COLUMNS, PAIR
            ))?;
            let rows = stmt
                .query_map(params![user_a, user_b, sql_count(limit), sql_count(offset)], read_row)?
                .collect::<Result<Vec<_>, _>>()?;
            let messages = collect_rows(rows)?;

            let total_count = total.max(0) as usize;
            Ok(HistoryPage {
                messages: messages.iter().map(MessageSummary::from).collect(),
                total_count,
                has_more: offset.saturating_add(limit) < total_count,
            })
        })
        .await
    }
}

/// SQLite treats a negative LIMIT as unbounded, so saturate instead of wrapping
fn sql_count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
