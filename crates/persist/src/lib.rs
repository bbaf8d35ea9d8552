//! Recoon persistence: bucketed key/value storage on a single SQLite file.
//! A bucket is a partition per object type; keys are `namespace/name`.

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use metrics::histogram;
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

pub struct SqliteKv {
    db: Mutex<Connection>,
}

impl SqliteKv {
    pub fn open(path: &Path) -> Result<Self> {
        let started = Instant::now();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let db = Connection::open(path).with_context(|| format!("opening sqlite db at {}", path.display()))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        // One writer process owns the file.
        db.pragma_update(None, "locking_mode", "EXCLUSIVE").ok();
        let me = Self::init(db)?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path = %path.display(), "persist: opened");
        Ok(me)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("opening in-memory sqlite")?)
    }

    fn init(db: Connection) -> Result<Self> {
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS buckets (
                name TEXT PRIMARY KEY
            );
            CREATE TABLE IF NOT EXISTS objects (
                bucket TEXT NOT NULL,
                key    TEXT NOT NULL,
                data   BLOB NOT NULL,
                PRIMARY KEY (bucket, key)
            );",
        )
        .context("creating tables")?;
        Ok(Self { db: Mutex::new(db) })
    }

    /// Run `f` inside a transaction that is rolled back once `f` returns,
    /// whether or not it succeeded.
    pub fn read<R, E>(&self, f: impl FnOnce(&Tx<'_>) -> Result<R, E>) -> Result<R, E>
    where
        E: From<anyhow::Error>,
    {
        let mut db = self.db.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))?;
        let tx = Tx { tx: db.transaction().context("begin read")? };
        let out = f(&tx);
        tx.tx.rollback().context("rollback read")?;
        out
    }

    /// Run `f` inside a transaction committed only when `f` succeeds.
    pub fn write<R, E>(&self, f: impl FnOnce(&Tx<'_>) -> Result<R, E>) -> Result<R, E>
    where
        E: From<anyhow::Error>,
    {
        let started = Instant::now();
        let mut db = self.db.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))?;
        let tx = Tx { tx: db.transaction().context("begin write")? };
        let out = f(&tx)?;
        tx.tx.commit().context("commit")?;
        histogram!("persist_write_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}

pub struct Tx<'a> {
    tx: rusqlite::Transaction<'a>,
}

impl Tx<'_> {
    pub fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        let found: Option<i64> = self
            .tx
            .query_row("SELECT 1 FROM buckets WHERE name = ?1", [bucket], |r| r.get(0))
            .optional()
            .context("bucket lookup")?;
        Ok(found.is_some())
    }

    /// Idempotent.
    pub fn create_bucket(&self, bucket: &str) -> Result<()> {
        self.tx.execute("INSERT OR IGNORE INTO buckets(name) VALUES (?1)", [bucket]).context("create bucket")?;
        Ok(())
    }

    pub fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        self.tx
            .query_row("SELECT data FROM objects WHERE bucket = ?1 AND key = ?2", [bucket, key], |r| r.get(0))
            .optional()
            .context("get")
    }

    pub fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO objects(bucket, key, data) VALUES (?1, ?2, ?3)
                 ON CONFLICT(bucket, key) DO UPDATE SET data = excluded.data",
                (bucket, key, data),
            )
            .context("put")?;
        Ok(())
    }

    /// Returns whether a row was removed.
    pub fn delete(&self, bucket: &str, key: &str) -> Result<bool> {
        let n = self.tx.execute("DELETE FROM objects WHERE bucket = ?1 AND key = ?2", [bucket, key]).context("delete")?;
        Ok(n > 0)
    }

    /// All entries of `bucket` whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, bucket: &str, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut stmt = self
            .tx
            .prepare("SELECT key, data FROM objects WHERE bucket = ?1 AND substr(key, 1, length(?2)) = ?2 ORDER BY key")
            .context("prepare scan")?;
        let mut rows = stmt.query([bucket, prefix])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push((row.get(0)?, row.get(1)?));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_and_prefix_scan() {
        let kv = SqliteKv::open_in_memory().expect("open");
        kv.write(|tx| -> Result<()> {
            assert!(!tx.bucket_exists("v1/Repository")?);
            tx.create_bucket("v1/Repository")?;
            tx.create_bucket("v1/Repository")?;
            tx.put("v1/Repository", "default/b", b"2")?;
            tx.put("v1/Repository", "default/a", b"1")?;
            tx.put("v1/Repository", "other/a", b"3")?;
            tx.put("v1/Repository", "default/a", b"1b")?;
            Ok(())
        })
        .expect("write");
        let rows = kv.read(|tx| tx.scan_prefix("v1/Repository", "default/")).expect("scan");
        assert_eq!(rows, vec![("default/a".to_string(), b"1b".to_vec()), ("default/b".to_string(), b"2".to_vec())]);
        let all = kv.read(|tx| tx.scan_prefix("v1/Repository", "")).expect("scan");
        assert_eq!(all.len(), 3);
        // `_` and `%` are literal in prefixes
        assert!(kv.read(|tx| tx.scan_prefix("v1/Repository", "defaul_/")).expect("scan").is_empty());
    }

    #[test]
    fn failed_write_rolls_back() {
        let kv = SqliteKv::open_in_memory().expect("open");
        let res = kv.write(|tx| -> Result<()> {
            tx.create_bucket("b")?;
            tx.put("b", "ns/x", b"1")?;
            Err(anyhow!("abort"))
        });
        assert!(res.is_err());
        assert!(!kv.read(|tx| tx.bucket_exists("b")).expect("read"));
        assert_eq!(kv.read(|tx| tx.get("b", "ns/x")).expect("read"), None);
    }

    #[test]
    fn writes_inside_a_read_are_discarded() {
        let kv = SqliteKv::open_in_memory().expect("open");
        kv.write(|tx| tx.create_bucket("b")).expect("write");
        kv.read(|tx| tx.put("b", "ns/x", b"1")).expect("read");
        let res: Result<()> = kv.read(|tx| {
            tx.put("b", "ns/y", b"2")?;
            Err(anyhow!("abort"))
        });
        assert!(res.is_err());
        assert_eq!(kv.read(|tx| tx.get("b", "ns/x")).expect("read"), None);
        assert_eq!(kv.read(|tx| tx.get("b", "ns/y")).expect("read"), None);
        assert!(kv.read(|tx| tx.bucket_exists("b")).expect("read"));
    }

    #[test]
    fn delete_reports_presence_and_survives_reopen() {
        let dir = tempfile::tempdir().expect("tmp");
        let path = dir.path().join("nested").join("recoon.db");
        {
            let kv = SqliteKv::open(&path).expect("open");
            kv.write(|tx| -> Result<()> {
                tx.create_bucket("b")?;
                tx.put("b", "ns/x", b"1")?;
                tx.put("b", "ns/y", b"2")?;
                assert!(tx.delete("b", "ns/y")?);
                assert!(!tx.delete("b", "ns/zz")?);
                Ok(())
            })
            .expect("write");
        }
        let kv = SqliteKv::open(&path).expect("reopen");
        assert_eq!(kv.read(|tx| tx.get("b", "ns/x")).expect("read"), Some(b"1".to_vec()));
        assert_eq!(kv.read(|tx| tx.get("b", "ns/y")).expect("read"), None);
    }
}
