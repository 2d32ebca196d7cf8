//! SQLite-based message storage

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use chrono::{TimeZone, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use rusqlite_migration::{M, Migrations};

use super::traits::{MessageQuery, MessageStore, StatusCounts, UpsertStatus};
use crate::models::{MessageId, MessageRecord};

/// Column list shared by every SELECT that loads a full record
const RECORD_COLUMNS: &str = "id, subject, sender, received_at, body, raw_payload, processed";

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            CREATE TABLE messages (
                id TEXT PRIMARY KEY,
                subject TEXT NOT NULL,
                sender TEXT NOT NULL,
                received_at INTEGER NOT NULL,  -- unix seconds
                body TEXT NOT NULL,
                raw_payload BLOB,              -- zstd compressed JSON
                processed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX idx_messages_received_at ON messages(received_at DESC);
            CREATE INDEX idx_messages_processed ON messages(processed, received_at ASC);
            "#,
        ),
    ])
}

/// SQLite-based message storage
pub struct SqliteMessageStore {
    conn: Mutex<Connection>,
}

impl SqliteMessageStore {
    /// Open (or create) the database at `db_path` and run migrations
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        // WAL lets the report tool read while the poller writes.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }

    fn query_records(
        &self,
        conn: &Connection,
        sql: &str,
        values: Vec<Value>,
    ) -> Result<Vec<MessageRecord>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), StoredRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(StoredRow::into_record).collect()
    }
}

/// A raw row before timestamp and payload decoding
struct StoredRow {
    id: String,
    subject: String,
    sender: String,
    received_at: i64,
    body: String,
    raw_payload: Option<Vec<u8>>,
    processed: bool,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            subject: row.get(1)?,
            sender: row.get(2)?,
            received_at: row.get(3)?,
            body: row.get(4)?,
            raw_payload: row.get(5)?,
            processed: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<MessageRecord> {
        let received_at = Utc
            .timestamp_opt(self.received_at, 0)
            .single()
            .with_context(|| format!("Invalid received_at for message {}", self.id))?;

        let raw_payload = match self.raw_payload {
            Some(compressed) => {
                let json = zstd::decode_all(compressed.as_slice())
                    .with_context(|| format!("Failed to decompress payload of {}", self.id))?;
                serde_json::from_slice(&json)
                    .with_context(|| format!("Failed to parse payload of {}", self.id))?
            }
            None => serde_json::Value::Null,
        };

        Ok(MessageRecord {
            id: MessageId::new(self.id),
            subject: self.subject,
            sender: self.sender,
            received_at,
            body: self.body,
            raw_payload,
            processed: self.processed,
        })
    }
}

/// Translate LIMIT/OFFSET, where usize::MAX means unbounded
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(-1)
}

impl MessageStore for SqliteMessageStore {
    fn upsert_message(&self, message: MessageRecord) -> Result<UpsertStatus> {
        // zstd level 3 for the audit payload
        let raw_payload = if message.raw_payload.is_null() {
            None
        } else {
            let json = serde_json::to_vec(&message.raw_payload)?;
            Some(zstd::encode_all(json.as_slice(), 3).context("Failed to compress payload")?)
        };

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let existed: bool = tx
            .query_row(
                "SELECT 1 FROM messages WHERE id = ?",
                [message.id.as_str()],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);

        tx.execute(
            "INSERT INTO messages
             (id, subject, sender, received_at, body, raw_payload, processed)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                subject = excluded.subject,
                sender = excluded.sender,
                received_at = excluded.received_at,
                body = excluded.body,
                raw_payload = excluded.raw_payload",
            params![
                message.id.as_str(),
                message.subject,
                message.sender,
                message.received_at.timestamp(),
                message.body,
                raw_payload,
                message.processed,
            ],
        )
        .with_context(|| format!("Failed to upsert message {}", message.id))?;

        tx.commit()?;

        Ok(if existed {
            UpsertStatus::Updated
        } else {
            UpsertStatus::Inserted
        })
    }

    fn get_message(&self, id: &MessageId) -> Result<Option<MessageRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {RECORD_COLUMNS} FROM messages WHERE id = ?");
        let mut records = self.query_records(&conn, &sql, vec![Value::from(id.0.clone())])?;
        Ok(records.pop())
    }

    fn has_message(&self, id: &MessageId) -> Result<bool> {
        let conn = self.conn()?;
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?)",
                [id.as_str()],
                |row| row.get(0),
            )?;
        Ok(exists)
    }

    fn most_recent_message(&self) -> Result<Option<MessageRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM messages
             ORDER BY received_at DESC, id DESC LIMIT 1"
        );
        let mut records = self.query_records(&conn, &sql, Vec::new())?;
        Ok(records.pop())
    }

    fn all_message_ids(&self) -> Result<HashSet<MessageId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM messages")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|id| id.map(MessageId::new))
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    fn count_by_status(&self) -> Result<StatusCounts> {
        let conn = self.conn()?;
        let (total, processed): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(processed), 0) FROM messages",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(StatusCounts {
            total: total as usize,
            processed: processed as usize,
            unprocessed: (total - processed) as usize,
        })
    }

    fn list_messages(&self, query: &MessageQuery) -> Result<Vec<MessageRecord>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(since) = query.received_since {
            clauses.push("received_at >= ?");
            values.push(Value::from(since.timestamp()));
        }
        if let Some(until) = query.received_until {
            clauses.push("received_at <= ?");
            values.push(Value::from(until.timestamp()));
        }
        if let Some(needle) = &query.sender_contains {
            clauses.push("instr(lower(sender), lower(?)) > 0");
            values.push(Value::from(needle.clone()));
        }
        if let Some(processed) = query.processed {
            clauses.push("processed = ?");
            values.push(Value::from(processed));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        values.push(Value::from(sql_limit(query.limit)));
        values.push(Value::from(sql_limit(query.offset)));

        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM messages {where_clause}
             ORDER BY received_at DESC, id ASC
             LIMIT ? OFFSET ?"
        );

        let conn = self.conn()?;
        self.query_records(&conn, &sql, values)
    }

    fn list_unprocessed(&self, limit: usize) -> Result<Vec<MessageRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM messages WHERE processed = 0
             ORDER BY received_at ASC, id ASC LIMIT ?"
        );
        self.query_records(&conn, &sql, vec![Value::from(sql_limit(limit))])
    }

    fn mark_processed(&self, ids: &[MessageId]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt =
                tx.prepare("UPDATE messages SET processed = 1 WHERE id = ? AND processed = 0")?;
            for id in ids {
                changed += stmt.execute([id.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    fn clear(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM messages", [])?;
        Ok(())
    }
}
