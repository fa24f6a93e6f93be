//! Embedded SQLite store for the block tree and chainstate databases.
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::store::{BatchOp, KvStore, WriteBatch};

/// Simple key/value table:
///   kv(key BLOB PRIMARY KEY, value BLOB NOT NULL)
///
/// One connection is kept open and shared behind a mutex; batches run in a
/// single transaction.
pub struct SqliteStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Creates/initializes the SQLite file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let conn = Connection::open(&path)
            .with_context(|| format!("open sqlite at {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS kv (
                key   BLOB PRIMARY KEY,
                value BLOB NOT NULL
            );
            "#,
        )
        .with_context(|| format!("init schema at {}", path.display()))?;
        debug!(target: "kvstore", path = %path.display(), "opened sqlite store");
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Convenient in-memory store (useful for tests)
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key   BLOB PRIMARY KEY,
                value BLOB NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    /// Database file location (`:memory:` for in-memory stores).
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }

    fn kv_set(conn: &Connection, key: &[u8], val: &[u8]) -> anyhow::Result<()> {
        conn.execute(
            "INSERT INTO kv(key,value) VALUES(?1,?2)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, val],
        )?;
        Ok(())
    }

    fn kv_delete(conn: &Connection, key: &[u8]) -> anyhow::Result<()> {
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let conn = self.conn()?;
        conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get::<_, Vec<u8>>(0)
        })
        .optional()
        .with_context(|| format!("read key {}", hex::encode(key)))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        let conn = self.conn()?;
        Self::kv_set(&conn, key, value)
    }

    fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        let conn = self.conn()?;
        Self::kv_delete(&conn, key)
    }

    fn write_batch(&self, batch: WriteBatch) -> anyhow::Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        for op in &batch.operations {
            match op {
                BatchOp::Put { key, value } => Self::kv_set(&tx, key, value)?,
                BatchOp::Delete { key } => Self::kv_delete(&tx, key)?,
            }
        }
        tx.commit()
            .with_context(|| format!("commit batch of {} ops", batch.len()))?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key, value FROM kv WHERE key >= ?1 ORDER BY key")?;
        let mut rows = stmt.query(params![prefix])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let key: Vec<u8> = row.get(0)?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, row.get(1)?));
        }
        Ok(out)
    }

    fn clear(&self) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM kv", [])?;
        Ok(())
    }
}
