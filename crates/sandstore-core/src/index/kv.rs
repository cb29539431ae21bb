//! Ordered key-value store backing the path index.
//!
//! Keys are UTF-8 strings, values are opaque bytes. The store lives in a
//! single SQLite table clustered on the key, which gives ordered prefix
//! scans, and groups of writes go through one transaction so a
//! [`WriteBatch`] lands atomically or not at all.

use std::{
    fs,
    path::{Path, PathBuf},
};

use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use tracing::{debug, instrument, warn};

use super::error::IndexError;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS entries (
    key   TEXT PRIMARY KEY NOT NULL,
    value BLOB NOT NULL
) WITHOUT ROWID;";

/// A single mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
enum BatchOp {
    Put(String, Vec<u8>),
    Delete(String),
}

/// Group of mutations applied atomically by [`KvStore::write`].
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Put(key.into(), value.into()));
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Delete(key.into()));
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// An open key-value database file.
#[derive(Debug)]
pub struct KvStore {
    conn: Connection,
    path: PathBuf,
}

impl KvStore {
    /// Open (creating if needed) the database at `path` and verify it.
    ///
    /// A file that is not a database, or fails SQLite's quick check, is
    /// reported as [`IndexError::Corruption`].
    #[instrument(level = "debug", fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| IndexError::io(e, parent))?;
        }
        let conn = Connection::open(path).map_err(|e| attach_path(e.into(), path))?;
        conn.execute_batch("PRAGMA synchronous = FULL;")
            .map_err(|e| attach_path(e.into(), path))?;
        conn.execute_batch(SCHEMA).map_err(|e| attach_path(e.into(), path))?;

        let status: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(|e| attach_path(e.into(), path))?;
        if status != "ok" {
            return Err(IndexError::corruption(format!(
                "quick_check failed for {}: {status}",
                path.display()
            )));
        }

        debug!("Key-value store opened");
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, IndexError> {
        let value = self
            .conn
            .prepare_cached("SELECT value FROM entries WHERE key = ?1")?
            .query_row([key], |row| row.get::<_, Vec<u8>>(0))
            .optional()?;
        Ok(value)
    }

    /// Every entry whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, IndexError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT key, value FROM entries WHERE key >= ?1 ORDER BY key")?;
        let rows = stmt.query_map([prefix], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (key, value) = row?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }

    /// Snapshot of the whole store, in key order.
    pub fn scan_all(&self) -> Result<Vec<(String, Vec<u8>)>, IndexError> {
        self.scan_prefix("")
    }

    pub fn is_empty(&self) -> Result<bool, IndexError> {
        let any: bool = self
            .conn
            .query_row("SELECT EXISTS(SELECT 1 FROM entries)", [], |row| row.get(0))?;
        Ok(!any)
    }

    /// Apply every operation of `batch` in one transaction.
    pub fn write(&mut self, batch: WriteBatch) -> Result<(), IndexError> {
        let tx = self.conn.transaction()?;
        {
            let mut put = tx.prepare_cached("INSERT OR REPLACE INTO entries (key, value) VALUES (?1, ?2)")?;
            let mut delete = tx.prepare_cached("DELETE FROM entries WHERE key = ?1")?;
            for op in batch.ops {
                match op {
                    BatchOp::Put(key, value) => {
                        put.execute(params![key, value])?;
                    }
                    BatchOp::Delete(key) => {
                        delete.execute([key])?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

fn attach_path(err: IndexError, path: &Path) -> IndexError {
    match err {
        IndexError::Io { source, .. } => IndexError::io(source, path),
        other => other,
    }
}

/// Rebuild a damaged database from every row that can still be read.
///
/// Rows are copied into a fresh database next to the original, which then
/// replaces it. Returns the number of rows recovered. Fails when the file
/// cannot be read as a database at all.
#[instrument(level = "info", fields(path = %db_path.display()))]
pub fn salvage(db_path: &Path) -> Result<usize, IndexError> {
    let mut recovered = WriteBatch::new();
    let mut skipped = 0usize;
    {
        let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| attach_path(e.into(), db_path))?;
        let mut stmt = conn.prepare("SELECT key, value FROM entries")?;
        let mut rows = stmt.query([])?;
        loop {
            match rows.next() {
                Ok(Some(row)) => match (row.get::<_, String>(0), row.get::<_, Vec<u8>>(1)) {
                    (Ok(key), Ok(value)) => {
                        recovered.put(key, value);
                    }
                    _ => skipped += 1,
                },
                Ok(None) => break,
                Err(error) => {
                    warn!(%error, "Stopped reading damaged index rows");
                    break;
                }
            }
        }
    }

    let count = recovered.len();
    let dir = db_path
        .parent()
        .ok_or_else(|| IndexError::InvalidArgument(format!("{} has no parent", db_path.display())))?;
    let temp_path = dir.join(format!(".salvage.{}", uuid::Uuid::new_v4()));
    {
        let mut fresh = KvStore::open(&temp_path)?;
        fresh.write(recovered)?;
    }

    remove_database_files(db_path)?;
    fs::rename(&temp_path, db_path).map_err(|e| IndexError::io(e, db_path))?;

    warn!(recovered = count, skipped, "Index database salvaged");
    Ok(count)
}

/// Remove a database file and its rollback journal, if present.
fn remove_database_files(db_path: &Path) -> Result<(), IndexError> {
    let mut journal = db_path.as_os_str().to_owned();
    journal.push("-journal");
    for path in [db_path.to_path_buf(), PathBuf::from(journal)] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(IndexError::io(e, path)),
        }
    }
    Ok(())
}
