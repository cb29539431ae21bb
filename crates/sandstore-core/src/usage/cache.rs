//! Per-store usage file.
//!
//! Each origin+type store keeps one small file recording how many bytes it
//! uses, so quota checks do not need a tree walk. Layout (17 bytes):
//!
//! ```text
//! magic:    b"FSU5"
//! valid:    u8, 0 or 1
//! dirty:    u32 LE
//! usage:    i64 LE
//! ```
//!
//! A missing file is a cache miss, never "zero bytes used".

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use lru::LruCache;
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::UsageCacheConfig;

/// Leading bytes of every usage file.
pub const USAGE_MAGIC: &[u8; 4] = b"FSU5";

/// Exact length of a usage file.
pub const USAGE_RECORD_LEN: usize = 17;

#[derive(Error, Debug)]
pub enum UsageCacheError {
    /// No usage file exists yet; usage has to be computed.
    #[error("usage cache {0:?} does not exist")]
    Missing(PathBuf),

    #[error("usage cache {path:?} is malformed: {reason}")]
    InvalidFormat { path: PathBuf, reason: String },

    #[error("dirty count of {0:?} is already zero")]
    DirtyUnderflow(PathBuf),

    #[error("IO error on usage cache {path:?}: {source}")]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },
}

impl UsageCacheError {
    fn io(source: io::Error, path: &Path) -> Self {
        UsageCacheError::Io {
            source,
            path: path.to_path_buf(),
        }
    }
}

/// Decoded contents of a usage file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageRecord {
    pub is_valid: bool,
    pub dirty: u32,
    pub usage: i64,
}

impl UsageRecord {
    /// A trusted record with no mutation in flight.
    pub const fn clean(usage: i64) -> Self {
        Self {
            is_valid: true,
            dirty: 0,
            usage,
        }
    }

    pub fn encode(&self) -> [u8; USAGE_RECORD_LEN] {
        let mut out = [0u8; USAGE_RECORD_LEN];
        out[..4].copy_from_slice(USAGE_MAGIC);
        out[4] = u8::from(self.is_valid);
        out[5..9].copy_from_slice(&self.dirty.to_le_bytes());
        out[9..].copy_from_slice(&self.usage.to_le_bytes());
        out
    }

    /// Parse a usage file; `path` is only used for error reporting.
    pub fn decode(bytes: &[u8], path: &Path) -> Result<Self, UsageCacheError> {
        let invalid = |reason: String| UsageCacheError::InvalidFormat {
            path: path.to_path_buf(),
            reason,
        };
        let bytes: &[u8; USAGE_RECORD_LEN] = bytes
            .try_into()
            .map_err(|_| invalid(format!("expected {USAGE_RECORD_LEN} bytes, found {}", bytes.len())))?;
        if &bytes[..4] != USAGE_MAGIC {
            return Err(invalid("bad magic".to_string()));
        }
        let is_valid = match bytes[4] {
            0 => false,
            1 => true,
            other => return Err(invalid(format!("validity byte {other}"))),
        };
        let mut dirty = [0u8; 4];
        dirty.copy_from_slice(&bytes[5..9]);
        let mut usage = [0u8; 8];
        usage.copy_from_slice(&bytes[9..]);
        Ok(Self {
            is_valid,
            dirty: u32::from_le_bytes(dirty),
            usage: i64::from_le_bytes(usage),
        })
    }
}

/// Reads and writes usage files, keeping a few recently used ones open.
///
/// Open handles live in a small LRU. Every access pushes a close deadline
/// forward; the first access after the deadline closes all handles before
/// doing anything else. Handle caching never changes what is read or written.
#[derive(Debug)]
pub struct UsageCache {
    handles: LruCache<PathBuf, File>,
    close_delay: Duration,
    close_deadline: Option<Instant>,
}

impl UsageCache {
    pub fn new(config: &UsageCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_open_handles).unwrap_or(NonZeroUsize::MIN);
        Self {
            handles: LruCache::new(capacity),
            close_delay: config.close_delay(),
            close_deadline: None,
        }
    }

    /// Recorded usage, whatever the validity flag says.
    pub fn get_usage(&mut self, path: &Path) -> Result<i64, UsageCacheError> {
        Ok(self.read(path)?.usage)
    }

    pub fn get_dirty(&mut self, path: &Path) -> Result<u32, UsageCacheError> {
        Ok(self.read(path)?.dirty)
    }

    /// Whole record in one read.
    pub fn get_record(&mut self, path: &Path) -> Result<UsageRecord, UsageCacheError> {
        self.read(path)
    }

    pub fn increment_dirty(&mut self, path: &Path) -> Result<u32, UsageCacheError> {
        let mut record = self.read(path)?;
        record.dirty = record.dirty.saturating_add(1);
        self.write(path, &record)?;
        trace!(path = %path.display(), dirty = record.dirty, "Incremented dirty count");
        Ok(record.dirty)
    }

    pub fn decrement_dirty(&mut self, path: &Path) -> Result<u32, UsageCacheError> {
        let mut record = self.read(path)?;
        record.dirty = record
            .dirty
            .checked_sub(1)
            .ok_or_else(|| UsageCacheError::DirtyUnderflow(path.to_path_buf()))?;
        self.write(path, &record)?;
        trace!(path = %path.display(), dirty = record.dirty, "Decremented dirty count");
        Ok(record.dirty)
    }

    /// Mark the recorded usage as untrustworthy, keeping dirty and usage.
    pub fn invalidate(&mut self, path: &Path) -> Result<(), UsageCacheError> {
        let mut record = self.read(path)?;
        record.is_valid = false;
        self.write(path, &record)?;
        debug!(path = %path.display(), "Usage cache invalidated");
        Ok(())
    }

    /// Whether the file exists, parses and is flagged valid.
    pub fn is_valid(&mut self, path: &Path) -> bool {
        self.read(path).is_ok_and(|record| record.is_valid)
    }

    /// Overwrite with a trusted absolute value and dirty count 0, creating
    /// the file if needed.
    pub fn update_usage(&mut self, path: &Path, usage: i64) -> Result<(), UsageCacheError> {
        self.write(path, &UsageRecord::clean(usage))?;
        debug!(path = %path.display(), usage, "Usage cache updated");
        Ok(())
    }

    /// Add `delta` to the recorded usage; validity and dirty are preserved.
    pub fn atomic_update_usage_by_delta(&mut self, path: &Path, delta: i64) -> Result<i64, UsageCacheError> {
        let mut record = self.read(path)?;
        record.usage = record.usage.saturating_add(delta);
        self.write(path, &record)?;
        trace!(path = %path.display(), delta, usage = record.usage, "Usage adjusted");
        Ok(record.usage)
    }

    pub fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    /// Remove the usage file. Returns whether a file was deleted.
    pub fn delete(&mut self, path: &Path) -> Result<bool, UsageCacheError> {
        self.handles.pop(path);
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(UsageCacheError::io(e, path)),
        }
    }

    pub fn has_cache_file_handle(&self, path: &Path) -> bool {
        self.handles.contains(path)
    }

    pub fn open_handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Close every cached handle now.
    pub fn close_cache_files(&mut self) {
        if !self.handles.is_empty() {
            debug!(count = self.handles.len(), "Closing usage cache handles");
        }
        self.handles.clear();
        self.close_deadline = None;
    }

    /// When the open handles will be considered idle, if any are open.
    pub fn close_deadline(&self) -> Option<Instant> {
        self.close_deadline
    }

    /// Close every cached handle if the idle deadline has passed.
    pub fn close_expired_handles(&mut self) {
        if self.close_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            self.close_cache_files();
        }
    }

    fn read(&mut self, path: &Path) -> Result<UsageRecord, UsageCacheError> {
        let file = self.handle(path, false)?;
        file.seek(SeekFrom::Start(0)).map_err(|e| UsageCacheError::io(e, path))?;
        let mut buf = Vec::with_capacity(USAGE_RECORD_LEN + 1);
        Read::by_ref(file)
            .take(USAGE_RECORD_LEN as u64 + 1)
            .read_to_end(&mut buf)
            .map_err(|e| UsageCacheError::io(e, path))?;
        UsageRecord::decode(&buf, path)
    }

    fn write(&mut self, path: &Path, record: &UsageRecord) -> Result<(), UsageCacheError> {
        let file = self.handle(path, true)?;
        file.seek(SeekFrom::Start(0)).map_err(|e| UsageCacheError::io(e, path))?;
        file.write_all(&record.encode()).map_err(|e| UsageCacheError::io(e, path))?;
        file.set_len(USAGE_RECORD_LEN as u64)
            .map_err(|e| UsageCacheError::io(e, path))?;
        Ok(())
    }

    fn handle(&mut self, path: &Path, create: bool) -> Result<&mut File, UsageCacheError> {
        self.close_expired_handles();
        self.close_deadline = Some(Instant::now() + self.close_delay);

        if !self.handles.contains(path) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(create)
                .truncate(false)
                .open(path)
                .map_err(|e| match e.kind() {
                    io::ErrorKind::NotFound => UsageCacheError::Missing(path.to_path_buf()),
                    _ => UsageCacheError::io(e, path),
                })?;
            self.handles.put(path.to_path_buf(), file);
        }
        self.handles
            .get_mut(path)
            .ok_or_else(|| UsageCacheError::Missing(path.to_path_buf()))
    }
}
