//! Default embedded backend: every bucket lives in one B-tree table of a
//! single SQLite database, so batches are real transactions.

use super::{BatchWrite, Bucket, RawDb};
use crate::error::{Result, SeedError};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const DB_NAME: &str = "seed.db";

pub struct LocalDb {
    conn: Mutex<Connection>,
}

impl LocalDb {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join(DB_NAME))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |row| {
            row.get::<_, String>(0)
        })?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                bucket TEXT NOT NULL,
                key BLOB NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (bucket, key)
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl RawDb for LocalDb {
    async fn put(&self, bucket: Bucket, key: &[u8], value: &[u8]) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO kv (bucket, key, value) VALUES (?1, ?2, ?3)",
            params![bucket.name(), key, value],
        )?;
        Ok(())
    }

    async fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Vec<u8>> {
        let conn = self.conn.lock();
        let value: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM kv WHERE bucket = ?1 AND key = ?2",
                params![bucket.name(), key],
                |row| row.get(0),
            )
            .optional()?;
        value.ok_or(SeedError::NotExist)
    }

    async fn delete(&self, bucket: Bucket, key: &[u8]) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM kv WHERE bucket = ?1 AND key = ?2",
            params![bucket.name(), key],
        )?;
        Ok(())
    }

    async fn list_keys(&self, bucket: Bucket) -> Result<Vec<Vec<u8>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key FROM kv WHERE bucket = ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![bucket.name()], |row| row.get::<_, Vec<u8>>(0))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    async fn put_batch(&self, writes: Vec<BatchWrite>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for write in &writes {
            tx.execute(
                "INSERT OR REPLACE INTO kv (bucket, key, value) VALUES (?1, ?2, ?3)",
                params![write.bucket.name(), write.key, write.value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}
