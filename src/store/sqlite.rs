//! SQLite-backed keyspace
//!
//! Single table, one row per key. Scan walks rows in rowid order and uses the
//! last examined rowid as the cursor; upserts keep their rowid, so a key that
//! is rewritten mid-scan is neither skipped nor revisited.

use super::{KvStore, ScanPage, StoreError, TERMINAL_CURSOR};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key        TEXT PRIMARY KEY NOT NULL,
    value      TEXT NOT NULL,
    expires_at INTEGER
);
"#;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the keyspace file and ensure the schema exists
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;

        log::info!("📊 SQLite keyspace ready: {}", db_path.as_ref().display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Drop rows whose expiry has passed, returns rows removed
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now_ms()],
        )?;
        Ok(removed)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("connection mutex poisoned".to_string()))
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now_ms()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(|t| now_ms() + t.as_millis() as i64);
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            "#,
            params![key, value, expires_at],
        )?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    async fn scan(&self, cursor: &str, pattern: &str, count: usize) -> Result<ScanPage, StoreError> {
        let after: i64 = cursor
            .parse()
            .map_err(|_| StoreError::Protocol(format!("invalid cursor '{}'", cursor)))?;
        let limit = count.max(1) as i64;
        let now = now_ms();

        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT rowid, key, (key GLOB ?2) AND (expires_at IS NULL OR expires_at > ?3)
            FROM kv
            WHERE rowid > ?1
            ORDER BY rowid
            LIMIT ?4
            "#,
        )?;

        let rows = stmt.query_map(params![after, pattern, now, limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
            ))
        })?;

        let mut keys = Vec::new();
        let mut examined = 0i64;
        let mut last_rowid = after;
        for row in rows {
            let (rowid, key, matched) = row?;
            examined += 1;
            last_rowid = rowid;
            if matched {
                keys.push(key);
            }
        }

        let next_cursor = if examined < limit {
            TERMINAL_CURSOR.to_string()
        } else {
            last_rowid.to_string()
        };

        Ok(ScanPage { next_cursor, keys })
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}
