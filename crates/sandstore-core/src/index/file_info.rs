//! Tree node records and their binary encoding.
//!
//! A [`FileInfo`] is stored under its decimal [`FileId`] key as a versioned,
//! fixed-field-order record:
//!
//! ```text
//! version: u8 (= 1)
//! parent_id: i64 LE
//! data_path: u32 LE length + UTF-8 bytes
//! name:      u32 LE length + UTF-8 bytes
//! mtime:     i64 LE microseconds since the Unix epoch, whole seconds only
//! ```
//!
//! The same [`encode_record`]/[`decode_record`] pair is used for every read
//! and write, so a record always decodes to what was encoded.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use relative_path::RelativePath;

use super::error::IndexError;

/// Record format version written by this crate.
pub const RECORD_VERSION: u8 = 1;

const MICROS_PER_SECOND: i64 = 1_000_000;

/// Stable integer handle of a node in the path index.
///
/// Ids are allocated monotonically per store; `0` is the root directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(i64);

impl FileId {
    /// The root directory.
    pub const ROOT: FileId = FileId(0);

    #[inline]
    pub const fn new(id: i64) -> Self {
        FileId(id)
    }

    #[inline]
    pub const fn get(self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn is_root(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>().map(FileId)
    }
}

/// One node of the directory tree.
///
/// `data_path` is empty for directories; for files it is the backing file's
/// path relative to the store directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub parent_id: FileId,
    pub name: String,
    pub data_path: String,
    pub modification_time: SystemTime,
}

impl FileInfo {
    /// A directory entry named `name` under `parent_id`.
    pub fn directory(parent_id: FileId, name: impl Into<String>) -> Self {
        Self {
            parent_id,
            name: name.into(),
            data_path: String::new(),
            modification_time: SystemTime::now(),
        }
    }

    /// A file entry backed by `data_path`.
    pub fn file(parent_id: FileId, name: impl Into<String>, data_path: impl Into<String>) -> Self {
        Self {
            parent_id,
            name: name.into(),
            data_path: data_path.into(),
            modification_time: SystemTime::now(),
        }
    }

    /// The synthesized root record of an empty store.
    pub fn root() -> Self {
        Self {
            parent_id: FileId::ROOT,
            name: String::new(),
            data_path: String::new(),
            modification_time: UNIX_EPOCH,
        }
    }

    #[must_use]
    pub fn with_modification_time(mut self, time: SystemTime) -> Self {
        self.modification_time = time;
        self
    }

    #[inline]
    pub fn is_directory(&self) -> bool {
        self.data_path.is_empty()
    }

    /// Absolute path of the backing file below `store_dir`.
    pub fn backing_path(&self, store_dir: &Path) -> PathBuf {
        RelativePath::new(&self.data_path).to_path(store_dir)
    }
}

/// Drop the sub-second part of a timestamp, as the record format does.
pub fn truncate_to_seconds(time: SystemTime) -> SystemTime {
    micros_to_time(time_to_micros(time)).unwrap_or(UNIX_EPOCH)
}

fn time_to_micros(time: SystemTime) -> i64 {
    let seconds = match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_secs()).unwrap_or(i64::MAX / MICROS_PER_SECOND),
        Err(before) => -i64::try_from(before.duration().as_secs()).unwrap_or(i64::MAX / MICROS_PER_SECOND),
    };
    seconds.saturating_mul(MICROS_PER_SECOND)
}

fn micros_to_time(micros: i64) -> Option<SystemTime> {
    let magnitude = Duration::from_micros(micros.unsigned_abs());
    if micros >= 0 {
        UNIX_EPOCH.checked_add(magnitude)
    } else {
        UNIX_EPOCH.checked_sub(magnitude)
    }
}

/// Serialize a record.
pub fn encode_record(info: &FileInfo) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 8 + 4 + info.data_path.len() + 4 + info.name.len() + 8);
    out.push(RECORD_VERSION);
    out.extend_from_slice(&info.parent_id.get().to_le_bytes());
    put_string(&mut out, &info.data_path);
    put_string(&mut out, &info.name);
    out.extend_from_slice(&time_to_micros(info.modification_time).to_le_bytes());
    out
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    // Component names are capped well below u32::MAX by validate_name.
    let len = u32::try_from(s.len()).unwrap_or(u32::MAX);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&s.as_bytes()[..len as usize]);
}

/// Parse a record written by [`encode_record`].
pub fn decode_record(bytes: &[u8]) -> Result<FileInfo, IndexError> {
    let mut reader = RecordReader { bytes, pos: 0 };

    let version = reader.take(1)?[0];
    if version != RECORD_VERSION {
        return Err(IndexError::corruption(format!(
            "unsupported file record version {version}"
        )));
    }
    let parent_id = FileId(reader.i64()?);
    let data_path = reader.string()?;
    let name = reader.string()?;
    let micros = reader.i64()?;
    if reader.pos != bytes.len() {
        return Err(IndexError::corruption(format!(
            "{} trailing bytes after file record",
            bytes.len() - reader.pos
        )));
    }
    let modification_time = micros_to_time(micros)
        .ok_or_else(|| IndexError::corruption(format!("modification time {micros} out of range")))?;

    Ok(FileInfo {
        parent_id,
        name,
        data_path,
        modification_time,
    })
}

struct RecordReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], IndexError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                IndexError::corruption(format!(
                    "truncated file record: wanted {len} bytes at offset {}, have {}",
                    self.pos,
                    self.bytes.len()
                ))
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn i64(&mut self) -> Result<i64, IndexError> {
        let raw: [u8; 8] = self
            .take(8)?
            .try_into()
            .map_err(|_| IndexError::corruption("short integer field"))?;
        Ok(i64::from_le_bytes(raw))
    }

    fn string(&mut self) -> Result<String, IndexError> {
        let raw: [u8; 4] = self
            .take(4)?
            .try_into()
            .map_err(|_| IndexError::corruption("short length field"))?;
        let len = u32::from_le_bytes(raw) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| IndexError::corruption(format!("file record string is not UTF-8: {e}")))
    }
}
