//! Persistent directory tree of one origin+type store.
//!
//! # Key scheme
//!
//! | key | value |
//! |-----|-------|
//! | `CHILD_OF:<parent>:<name>` | child id, ASCII decimal |
//! | `<file_id>` | [`FileInfo`] record (see [`super::file_info`]) |
//! | `LAST_FILE_ID` | last allocated id, ASCII decimal |
//! | `LAST_INTEGER` | last value handed out by [`PathIndex::get_next_integer`] |
//!
//! # Recovery
//!
//! The database is opened lazily and every operation goes through
//! [`PathIndex::init`]. When opening reports Corruption or an IO error the
//! database is salvaged once and re-validated with the
//! [`ConsistencyChecker`]; if that fails too the whole index directory is
//! deleted and recreated empty. Callers must treat that outcome as data
//! loss. An engine error seen later closes the database so the next call
//! runs the same recovery.

use std::{
    collections::HashSet,
    fs, io,
    path::{Path, PathBuf},
    time::SystemTime,
};

use relative_path::{Component, RelativePath};
use tracing::{debug, error, info, instrument, trace, warn};

use super::checker::ConsistencyChecker;
use super::error::IndexError;
use super::file_info::{FileId, FileInfo, decode_record, encode_record};
use super::kv::{self, KvStore, WriteBatch};
use crate::config::{INDEX_DIR_NAME, USAGE_FILE_NAME};
use crate::layout::StoreLayout;

pub const CHILD_LOOKUP_PREFIX: &str = "CHILD_OF:";
pub const LAST_FILE_ID_KEY: &str = "LAST_FILE_ID";
pub const LAST_INTEGER_KEY: &str = "LAST_INTEGER";

/// Longest accepted path component, in bytes.
pub const MAX_NAME_LEN: usize = 4096;

pub(crate) fn child_lookup_prefix(parent_id: FileId) -> String {
    format!("{CHILD_LOOKUP_PREFIX}{parent_id}:")
}

pub(crate) fn child_lookup_key(parent_id: FileId, name: &str) -> String {
    format!("{CHILD_LOOKUP_PREFIX}{parent_id}:{name}")
}

pub(crate) fn file_lookup_key(file_id: FileId) -> String {
    file_id.to_string()
}

pub(crate) fn parse_id(bytes: &[u8]) -> Result<FileId, IndexError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<FileId>().ok())
        .ok_or_else(|| {
            IndexError::corruption(format!("malformed id value {:?}", String::from_utf8_lossy(bytes)))
        })
}

/// Check that `name` can be used as a single path component.
pub fn validate_name(name: &str) -> Result<(), IndexError> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name == "." || name == ".." {
        "name is a relative path reference"
    } else if name.contains('/') {
        "name contains a path separator"
    } else if name.contains('\0') {
        "name contains a NUL byte"
    } else if name.len() > MAX_NAME_LEN {
        "name is too long"
    } else {
        return Ok(());
    };
    Err(IndexError::InvalidName {
        name: name.to_string(),
        reason,
    })
}

/// Whether a backing-file path is legal: relative, free of `.`/`..`
/// components, and not pointing at the index or the usage file.
pub fn is_valid_data_path(data_path: &str) -> bool {
    if data_path.is_empty() || data_path.starts_with('/') || data_path.contains('\\') {
        return false;
    }
    let path = RelativePath::new(data_path);
    let mut components = path.components().peekable();
    if let Some(Component::Normal(first)) = components.peek() {
        if *first == INDEX_DIR_NAME || (*first == USAGE_FILE_NAME && path.components().count() == 1) {
            return false;
        }
    }
    components.all(|c| matches!(c, Component::Normal(_)))
}

/// The directory tree of one store, keyed by [`FileId`].
///
/// There is no internal locking: all calls against one store must be
/// serialized by the caller.
#[derive(Debug)]
pub struct PathIndex {
    store_dir: PathBuf,
    db: Option<KvStore>,
    repairing: bool,
    recovered: bool,
    /// Data paths of every file record, loaded on first use.
    data_paths: Option<HashSet<String>>,
}

impl PathIndex {
    /// Create an index for the store rooted at `store_dir`.
    ///
    /// Nothing is touched on disk until the first operation.
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
            db: None,
            repairing: false,
            recovered: false,
            data_paths: None,
        }
    }

    /// Directory holding the store's backing files.
    #[inline]
    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    pub fn index_dir(&self) -> PathBuf {
        StoreLayout::index_dir_in(&self.store_dir)
    }

    fn db_path(&self) -> PathBuf {
        StoreLayout::index_db_in(&self.store_dir)
    }

    pub fn is_open(&self) -> bool {
        self.db.is_some()
    }

    /// Whether the database was repaired or reset since the last call.
    /// Either way the records may no longer match the backing files.
    pub fn take_recovered(&mut self) -> bool {
        std::mem::take(&mut self.recovered)
    }

    /// Drop the open database handle, if any.
    pub fn close(&mut self) {
        self.db = None;
        self.data_paths = None;
    }

    /// Delete an index directory and everything in it.
    pub fn destroy(index_dir: &Path) -> Result<(), IndexError> {
        match fs::remove_dir_all(index_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IndexError::io(e, index_dir)),
        }
    }

    /// Open the database, running repair or reset on corruption.
    #[instrument(level = "debug", skip(self), fields(store_dir = %self.store_dir.display()))]
    pub fn init(&mut self) -> Result<(), IndexError> {
        if self.db.is_some() {
            return Ok(());
        }
        let db_path = self.db_path();
        match KvStore::open(&db_path) {
            Ok(store) => {
                self.db = Some(store);
                return Ok(());
            }
            Err(e) if e.is_corruption() && !self.repairing => {
                warn!(error = %e, "Path index is unreadable, attempting repair");
            }
            Err(e) => return Err(e),
        }

        self.recovered = true;
        self.data_paths = None;
        if self.try_repair(&db_path) {
            info!("Path index repaired");
            return Ok(());
        }

        error!(index_dir = %self.index_dir().display(), "Path index could not be repaired, deleting all records");
        self.close();
        Self::destroy(&self.index_dir())?;
        self.db = Some(KvStore::open(&db_path)?);
        Ok(())
    }

    fn try_repair(&mut self, db_path: &Path) -> bool {
        self.repairing = true;
        let repaired = self.salvage_and_validate(db_path);
        self.repairing = false;
        repaired
    }

    fn salvage_and_validate(&mut self, db_path: &Path) -> bool {
        if let Err(error) = kv::salvage(db_path) {
            warn!(%error, "Salvaging the path index failed");
            return false;
        }
        match KvStore::open(db_path) {
            Ok(store) => self.db = Some(store),
            Err(error) => {
                warn!(%error, "Salvaged path index does not open");
                return false;
            }
        }
        match ConsistencyChecker::new(self).check() {
            Ok(report) => {
                debug!(?report, "Salvaged path index is consistent");
                true
            }
            Err(error) => {
                warn!(%error, "Salvaged path index is inconsistent");
                self.close();
                false
            }
        }
    }

    fn db(&mut self) -> Result<&mut KvStore, IndexError> {
        self.init()?;
        self.db
            .as_mut()
            .ok_or_else(|| IndexError::corruption("path index database is closed"))
    }

    /// Close the database after an engine-level failure so that the next
    /// call re-runs recovery.
    fn handle<T>(&mut self, result: Result<T, IndexError>) -> Result<T, IndexError> {
        if let Err(e) = &result {
            if e.is_corruption() {
                warn!(error = %e, "Path index failed, closing database");
                self.close();
            }
        }
        result
    }

    fn read(&mut self, key: &str) -> Result<Option<Vec<u8>>, IndexError> {
        let result = self.db()?.get(key);
        self.handle(result)
    }

    fn scan(&mut self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, IndexError> {
        let result = self.db()?.scan_prefix(prefix);
        self.handle(result)
    }

    fn commit(&mut self, batch: WriteBatch) -> Result<(), IndexError> {
        let result = self.db()?.write(batch);
        if result.is_err() {
            self.data_paths = None;
        }
        self.handle(result)
    }

    /// Backing-file paths referenced by file records.
    fn data_paths(&mut self) -> Result<&mut HashSet<String>, IndexError> {
        if self.data_paths.is_none() {
            let mut paths = HashSet::new();
            for (key, value) in self.scan("")? {
                if key.parse::<FileId>().is_err() {
                    continue;
                }
                let info = decode_record(&value)?;
                if !info.is_directory() {
                    paths.insert(info.data_path);
                }
            }
            self.data_paths = Some(paths);
        }
        Ok(self.data_paths.get_or_insert_with(HashSet::new))
    }

    fn verify_data_path_free(&mut self, data_path: &str) -> Result<(), IndexError> {
        if self.data_paths()?.contains(data_path) {
            return Err(IndexError::InvalidArgument(format!(
                "data path '{data_path}' is already in use"
            )));
        }
        Ok(())
    }

    /// Keep the loaded data path set in step with a committed change.
    fn note_data_paths(&mut self, removed: Option<&str>, added: Option<&str>) {
        if let Some(paths) = &mut self.data_paths {
            if let Some(removed) = removed {
                paths.remove(removed);
            }
            if let Some(added) = added {
                paths.insert(added.to_string());
            }
        }
    }

    /// Raw snapshot of every key, for the consistency checker.
    pub(crate) fn snapshot(&mut self) -> Result<Vec<(String, Vec<u8>)>, IndexError> {
        self.scan("")
    }

    // ==================== Lookups ====================

    /// Id of the child of `parent_id` called `name`, if any.
    #[instrument(level = "trace", skip(self))]
    pub fn get_child_with_name(&mut self, parent_id: FileId, name: &str) -> Result<Option<FileId>, IndexError> {
        match self.read(&child_lookup_key(parent_id, name))? {
            Some(bytes) => parse_id(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Resolve a `/`-separated path from the root, one component at a time.
    #[instrument(level = "debug", skip(self))]
    pub fn get_file_with_path(&mut self, path: &str) -> Result<Option<FileId>, IndexError> {
        let mut current = FileId::ROOT;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            match self.get_child_with_name(current, component)? {
                Some(child) => current = child,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Ids of every direct child of `parent_id`, in no meaningful order.
    #[instrument(level = "trace", skip(self))]
    pub fn list_children(&mut self, parent_id: FileId) -> Result<Vec<FileId>, IndexError> {
        self.scan(&child_lookup_prefix(parent_id))?
            .iter()
            .map(|(_, value)| parse_id(value))
            .collect()
    }

    /// Record of `file_id`.
    ///
    /// The root is synthesized when it has never been stored, so queries
    /// work on a store that has never been written.
    #[instrument(level = "trace", skip(self))]
    pub fn get_file_info(&mut self, file_id: FileId) -> Result<FileInfo, IndexError> {
        match self.read(&file_lookup_key(file_id))? {
            Some(bytes) => decode_record(&bytes),
            None if file_id.is_root() => Ok(FileInfo::root()),
            None => Err(IndexError::NotFound(file_id)),
        }
    }

    fn verify_is_directory(&mut self, file_id: FileId) -> Result<(), IndexError> {
        if file_id.is_root() {
            return Ok(());
        }
        if self.get_file_info(file_id)?.is_directory() {
            Ok(())
        } else {
            Err(IndexError::NotADirectory(file_id))
        }
    }

    // ==================== Mutations ====================

    /// Insert a new node and return its freshly allocated id.
    #[instrument(level = "debug", skip(self, info), fields(parent_id = %info.parent_id, name = %info.name))]
    pub fn add_file_info(&mut self, info: &FileInfo) -> Result<FileId, IndexError> {
        validate_name(&info.name)?;
        if !info.is_directory() && !is_valid_data_path(&info.data_path) {
            return Err(IndexError::InvalidArgument(format!(
                "illegal data path '{}'",
                info.data_path
            )));
        }
        self.verify_is_directory(info.parent_id)?;
        if self.get_child_with_name(info.parent_id, &info.name)?.is_some() {
            return Err(IndexError::AlreadyExists {
                parent_id: info.parent_id,
                name: info.name.clone(),
            });
        }
        if !info.is_directory() {
            self.verify_data_path_free(&info.data_path)?;
        }

        let file_id = FileId::new(self.get_last_file_id()?.get() + 1);
        let mut batch = WriteBatch::new();
        add_to_batch(info, file_id, &mut batch);
        batch.put(LAST_FILE_ID_KEY, file_id.to_string());
        self.commit(batch)?;
        if !info.is_directory() {
            self.note_data_paths(None, Some(info.data_path.as_str()));
        }

        trace!(%file_id, "Added file info");
        Ok(file_id)
    }

    /// Delete a node. Directories must be empty; the root cannot be removed.
    #[instrument(level = "debug", skip(self))]
    pub fn remove_file_info(&mut self, file_id: FileId) -> Result<(), IndexError> {
        if file_id.is_root() {
            return Err(IndexError::InvalidArgument("cannot remove the root directory".to_string()));
        }
        let mut batch = WriteBatch::new();
        let info = self.remove_to_batch(file_id, &mut batch)?;
        self.commit(batch)?;
        if !info.is_directory() {
            self.note_data_paths(Some(info.data_path.as_str()), None);
        }
        Ok(())
    }

    fn remove_to_batch(&mut self, file_id: FileId, batch: &mut WriteBatch) -> Result<FileInfo, IndexError> {
        let info = self.get_file_info(file_id)?;
        if info.is_directory() && !self.list_children(file_id)?.is_empty() {
            return Err(IndexError::NotEmpty(file_id));
        }
        batch.delete(child_lookup_key(info.parent_id, &info.name));
        batch.delete(file_lookup_key(file_id));
        Ok(info)
    }

    /// Rename and/or move a node, keeping its id.
    ///
    /// The new parent must be a directory, the destination name must be
    /// free, and a directory cannot be moved beneath itself.
    #[instrument(level = "debug", skip(self, new_info), fields(new_parent = %new_info.parent_id, new_name = %new_info.name))]
    pub fn update_file_info(&mut self, file_id: FileId, new_info: &FileInfo) -> Result<(), IndexError> {
        if file_id.is_root() {
            return Err(IndexError::InvalidArgument("cannot move the root directory".to_string()));
        }
        validate_name(&new_info.name)?;
        let old_info = self.get_file_info(file_id)?;
        if old_info.is_directory() != new_info.is_directory() {
            return Err(IndexError::InvalidArgument(
                "cannot change an entry between file and directory".to_string(),
            ));
        }
        if !new_info.is_directory() && !is_valid_data_path(&new_info.data_path) {
            return Err(IndexError::InvalidArgument(format!(
                "illegal data path '{}'",
                new_info.data_path
            )));
        }
        self.verify_is_directory(new_info.parent_id)?;
        let data_path_changes = !new_info.is_directory() && new_info.data_path != old_info.data_path;
        if data_path_changes {
            self.verify_data_path_free(&new_info.data_path)?;
        }

        let same_place = old_info.parent_id == new_info.parent_id && old_info.name == new_info.name;
        if !same_place {
            if self.get_child_with_name(new_info.parent_id, &new_info.name)?.is_some() {
                return Err(IndexError::AlreadyExists {
                    parent_id: new_info.parent_id,
                    name: new_info.name.clone(),
                });
            }
            if old_info.is_directory() {
                self.verify_not_descendant(new_info.parent_id, file_id)?;
            }
        }

        let mut batch = WriteBatch::new();
        batch.delete(child_lookup_key(old_info.parent_id, &old_info.name));
        batch.delete(file_lookup_key(file_id));
        add_to_batch(new_info, file_id, &mut batch);
        self.commit(batch)?;
        if data_path_changes {
            self.note_data_paths(Some(old_info.data_path.as_str()), Some(new_info.data_path.as_str()));
        }
        Ok(())
    }

    /// Fail when `candidate` is `ancestor` or lies beneath it.
    fn verify_not_descendant(&mut self, candidate: FileId, ancestor: FileId) -> Result<(), IndexError> {
        let mut seen = HashSet::new();
        let mut current = candidate;
        while !current.is_root() {
            if current == ancestor {
                return Err(IndexError::InvalidArgument(format!(
                    "cannot move directory {ancestor} beneath itself"
                )));
            }
            if !seen.insert(current) {
                return Err(IndexError::inconsistent(format!("parent cycle through {current}")));
            }
            current = self.get_file_info(current)?.parent_id;
        }
        Ok(())
    }

    #[instrument(level = "trace", skip(self))]
    pub fn update_modification_time(&mut self, file_id: FileId, time: SystemTime) -> Result<(), IndexError> {
        if file_id.is_root() {
            // Storing the synthesized root must not leave the counters unset.
            self.get_last_file_id()?;
        }
        let info = self.get_file_info(file_id)?.with_modification_time(time);
        let mut batch = WriteBatch::new();
        batch.put(file_lookup_key(file_id), encode_record(&info));
        self.commit(batch)
    }

    /// Replace `dest_id`'s content with `src_id`'s and drop `src_id`.
    ///
    /// Only `data_path` moves over; `dest_id` keeps its id, name and parent,
    /// so outstanding references to it stay valid. The caller owns deleting
    /// the destination's previous backing file.
    #[instrument(level = "debug", skip(self))]
    pub fn overwriting_move_file(&mut self, src_id: FileId, dest_id: FileId) -> Result<(), IndexError> {
        if src_id == dest_id {
            return Err(IndexError::InvalidArgument("source and destination are the same".to_string()));
        }
        let src_info = self.get_file_info(src_id)?;
        let mut dest_info = self.get_file_info(dest_id)?;
        if src_info.is_directory() {
            return Err(IndexError::NotAFile(src_id));
        }
        if dest_info.is_directory() {
            return Err(IndexError::NotAFile(dest_id));
        }
        let replaced = std::mem::replace(&mut dest_info.data_path, src_info.data_path);

        let mut batch = WriteBatch::new();
        self.remove_to_batch(src_id, &mut batch)?;
        batch.put(file_lookup_key(dest_id), encode_record(&dest_info));
        self.commit(batch)?;
        self.note_data_paths(Some(replaced.as_str()), None);
        Ok(())
    }

    // ==================== Counters ====================

    /// Last allocated file id (0 for a fresh store).
    pub fn get_last_file_id(&mut self) -> Result<FileId, IndexError> {
        match self.read(LAST_FILE_ID_KEY)? {
            Some(bytes) => parse_id(&bytes),
            None => {
                self.store_default_values()?;
                Ok(FileId::ROOT)
            }
        }
    }

    /// Next value of a persisted counter independent of file ids, used to
    /// mint unique backing-file names. Starts at 0.
    pub fn get_next_integer(&mut self) -> Result<i64, IndexError> {
        let last = match self.read(LAST_INTEGER_KEY)? {
            Some(bytes) => parse_id(&bytes)?.get(),
            None => {
                self.store_default_values()?;
                -1
            }
        };
        let next = last + 1;
        let mut batch = WriteBatch::new();
        batch.put(LAST_INTEGER_KEY, next.to_string());
        self.commit(batch)?;
        Ok(next)
    }

    /// Seed a brand-new database with the root record and both counters.
    fn store_default_values(&mut self) -> Result<(), IndexError> {
        let result = self.db()?.is_empty();
        if !self.handle(result)? {
            return Err(IndexError::inconsistent("counter missing from a non-empty path index"));
        }
        let mut batch = WriteBatch::new();
        batch.put(file_lookup_key(FileId::ROOT), encode_record(&FileInfo::root()));
        batch.put(LAST_FILE_ID_KEY, "0");
        batch.put(LAST_INTEGER_KEY, "-1");
        self.commit(batch)?;
        debug!("Stored default path index values");
        Ok(())
    }

    // ==================== Health ====================

    /// Run the consistency checker and report whether the tree is sound.
    pub fn is_file_system_consistent(&mut self) -> bool {
        match ConsistencyChecker::new(self).check() {
            Ok(_) => true,
            Err(error) => {
                warn!(%error, "Path index consistency check failed");
                false
            }
        }
    }
}

fn add_to_batch(info: &FileInfo, file_id: FileId, batch: &mut WriteBatch) {
    batch.put(child_lookup_key(info.parent_id, &info.name), file_id.to_string());
    batch.put(file_lookup_key(file_id), encode_record(info));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::file_info::truncate_to_seconds;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    fn temp_index() -> (TempDir, PathIndex) {
        let dir = TempDir::new().unwrap();
        let index = PathIndex::new(dir.path());
        (dir, index)
    }

    #[test]
    fn test_root_is_synthesized_on_empty_store() {
        let (_dir, mut index) = temp_index();
        let root = index.get_file_info(FileId::ROOT).unwrap();
        assert_eq!(root.parent_id, FileId::ROOT);
        assert_eq!(root.name, "");
        assert_eq!(root.data_path, "");
        assert!(root.is_directory());
    }

    #[test]
    fn test_add_then_get_round_trip() {
        let (_dir, mut index) = temp_index();
        let mtime = UNIX_EPOCH + Duration::from_millis(1_650_000_000_750);
        let info = FileInfo::file(FileId::ROOT, "notes.txt", "00/00000000").with_modification_time(mtime);

        let id = index.add_file_info(&info).unwrap();
        assert_eq!(id, FileId::new(1));

        let stored = index.get_file_info(id).unwrap();
        assert_eq!(stored.parent_id, info.parent_id);
        assert_eq!(stored.name, info.name);
        assert_eq!(stored.data_path, info.data_path);
        assert_eq!(stored.modification_time, truncate_to_seconds(mtime));
    }

    #[test]
    fn test_nested_path_lookup() {
        let (_dir, mut index) = temp_index();
        let a = index.add_file_info(&FileInfo::directory(FileId::ROOT, "a")).unwrap();
        let b = index.add_file_info(&FileInfo::file(a, "b", "b.dat")).unwrap();

        assert_eq!(index.get_file_with_path("a/b").unwrap(), Some(b));
        assert_eq!(index.get_file_with_path("/a/b").unwrap(), Some(b));
        assert_eq!(index.get_file_with_path("a").unwrap(), Some(a));
        assert_eq!(index.get_file_with_path("").unwrap(), Some(FileId::ROOT));
        assert_eq!(index.get_file_with_path("a/c").unwrap(), None);
        assert_eq!(index.list_children(a).unwrap(), vec![b]);
    }

    #[test]
    fn test_add_rejects_collisions_and_file_parents() {
        let (_dir, mut index) = temp_index();
        let file = index.add_file_info(&FileInfo::file(FileId::ROOT, "f", "00/00000000")).unwrap();

        let dup = index.add_file_info(&FileInfo::directory(FileId::ROOT, "f")).unwrap_err();
        assert!(matches!(dup, IndexError::AlreadyExists { .. }));

        let under_file = index.add_file_info(&FileInfo::directory(file, "x")).unwrap_err();
        assert!(matches!(under_file, IndexError::NotADirectory(id) if id == file));

        let missing_parent = index.add_file_info(&FileInfo::directory(FileId::new(99), "x")).unwrap_err();
        assert!(matches!(missing_parent, IndexError::NotFound(_)));

        let bad_name = index.add_file_info(&FileInfo::directory(FileId::ROOT, "a/b")).unwrap_err();
        assert!(matches!(bad_name, IndexError::InvalidName { .. }));

        let bad_data = index.add_file_info(&FileInfo::file(FileId::ROOT, "g", "../escape")).unwrap_err();
        assert!(matches!(bad_data, IndexError::InvalidArgument(_)));
    }

    #[test]
    fn test_remove_missing_id_leaves_others() {
        let (_dir, mut index) = temp_index();
        let a = index.add_file_info(&FileInfo::directory(FileId::ROOT, "a")).unwrap();

        assert!(matches!(index.remove_file_info(FileId::new(42)), Err(IndexError::NotFound(_))));
        assert_eq!(index.get_file_info(a).unwrap().name, "a");
        assert_eq!(index.list_children(FileId::ROOT).unwrap(), vec![a]);
    }

    #[test]
    fn test_remove_requires_empty_directory() {
        let (_dir, mut index) = temp_index();
        let a = index.add_file_info(&FileInfo::directory(FileId::ROOT, "a")).unwrap();
        let b = index.add_file_info(&FileInfo::file(a, "b", "00/00000000")).unwrap();

        assert!(matches!(index.remove_file_info(a), Err(IndexError::NotEmpty(_))));
        index.remove_file_info(b).unwrap();
        index.remove_file_info(a).unwrap();
        assert!(index.list_children(FileId::ROOT).unwrap().is_empty());
        assert!(matches!(index.remove_file_info(FileId::ROOT), Err(IndexError::InvalidArgument(_))));
    }

    #[test]
    fn test_rename_keeps_id_and_data_path() {
        let (_dir, mut index) = temp_index();
        let a = index.add_file_info(&FileInfo::directory(FileId::ROOT, "a")).unwrap();
        let b = index.add_file_info(&FileInfo::file(a, "b", "00/00000001")).unwrap();
        let d = index.add_file_info(&FileInfo::file(a, "d", "00/00000002")).unwrap();

        let mut renamed = index.get_file_info(b).unwrap();
        renamed.name = "c".to_string();
        index.update_file_info(b, &renamed).unwrap();

        assert_eq!(index.get_file_with_path("a/c").unwrap(), Some(b));
        assert_eq!(index.get_file_with_path("a/b").unwrap(), None);
        assert_eq!(index.get_file_info(b).unwrap().data_path, "00/00000001");

        let mut clash = index.get_file_info(b).unwrap();
        clash.name = "d".to_string();
        let err = index.update_file_info(b, &clash).unwrap_err();
        assert!(matches!(err, IndexError::AlreadyExists { .. }));
        assert_eq!(index.get_file_with_path("a/c").unwrap(), Some(b));
        assert_eq!(index.get_file_with_path("a/d").unwrap(), Some(d));
        assert_eq!(index.get_file_info(d).unwrap().data_path, "00/00000002");
    }

    #[test]
    fn test_move_directory_with_children_and_cycle_guard() {
        let (_dir, mut index) = temp_index();
        let a = index.add_file_info(&FileInfo::directory(FileId::ROOT, "a")).unwrap();
        let b = index.add_file_info(&FileInfo::directory(a, "b")).unwrap();
        let f = index.add_file_info(&FileInfo::file(b, "f", "00/00000000")).unwrap();

        let mut into_child = index.get_file_info(a).unwrap();
        into_child.parent_id = b;
        let err = index.update_file_info(a, &into_child).unwrap_err();
        assert!(matches!(err, IndexError::InvalidArgument(_)));

        let mut to_root = index.get_file_info(b).unwrap();
        to_root.parent_id = FileId::ROOT;
        index.update_file_info(b, &to_root).unwrap();
        assert_eq!(index.get_file_with_path("b/f").unwrap(), Some(f));
        assert!(index.list_children(a).unwrap().is_empty());
    }

    #[test]
    fn test_overwriting_move_transfers_data_path() {
        let (_dir, mut index) = temp_index();
        let src = index.add_file_info(&FileInfo::file(FileId::ROOT, "src", "00/00000001")).unwrap();
        let dest = index.add_file_info(&FileInfo::file(FileId::ROOT, "dest", "00/00000002")).unwrap();

        index.overwriting_move_file(src, dest).unwrap();

        let dest_info = index.get_file_info(dest).unwrap();
        assert_eq!(dest_info.name, "dest");
        assert_eq!(dest_info.data_path, "00/00000001");
        assert!(matches!(index.get_file_info(src), Err(IndexError::NotFound(_))));
        assert_eq!(index.get_child_with_name(FileId::ROOT, "src").unwrap(), None);
    }

    #[test]
    fn test_overwriting_move_rejects_directories() {
        let (_dir, mut index) = temp_index();
        let dir = index.add_file_info(&FileInfo::directory(FileId::ROOT, "d")).unwrap();
        let file = index.add_file_info(&FileInfo::file(FileId::ROOT, "f", "00/00000000")).unwrap();
        assert!(matches!(index.overwriting_move_file(dir, file), Err(IndexError::NotAFile(_))));
        assert!(matches!(index.overwriting_move_file(file, dir), Err(IndexError::NotAFile(_))));
    }

    #[test]
    fn test_data_paths_stay_unique() {
        let (_dir, mut index) = temp_index();
        let a = index.add_file_info(&FileInfo::file(FileId::ROOT, "a", "00/00000001")).unwrap();
        let b = index.add_file_info(&FileInfo::file(FileId::ROOT, "b", "00/00000002")).unwrap();

        let err = index
            .add_file_info(&FileInfo::file(FileId::ROOT, "c", "00/00000001"))
            .unwrap_err();
        assert!(matches!(err, IndexError::InvalidArgument(_)), "{err}");
        assert_eq!(index.get_child_with_name(FileId::ROOT, "c").unwrap(), None);

        let mut stolen = index.get_file_info(b).unwrap();
        stolen.data_path = "00/00000001".to_string();
        assert!(matches!(index.update_file_info(b, &stolen), Err(IndexError::InvalidArgument(_))));
        assert_eq!(index.get_file_info(b).unwrap().data_path, "00/00000002");

        // A freed data path can be handed out again.
        index.remove_file_info(a).unwrap();
        let c = index.add_file_info(&FileInfo::file(FileId::ROOT, "c", "00/00000001")).unwrap();
        index.overwriting_move_file(c, b).unwrap();
        assert_eq!(index.get_file_info(b).unwrap().data_path, "00/00000001");
        // The path `b` held before the move is free as well.
        index.add_file_info(&FileInfo::file(FileId::ROOT, "d", "00/00000002")).unwrap();
    }

    #[test]
    fn test_data_paths_in_use_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = PathIndex::new(dir.path());
            index.add_file_info(&FileInfo::file(FileId::ROOT, "a", "00/00000001")).unwrap();
        }
        let mut index = PathIndex::new(dir.path());
        assert!(matches!(
            index.add_file_info(&FileInfo::file(FileId::ROOT, "b", "00/00000001")),
            Err(IndexError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_counters_are_independent_and_persistent() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = PathIndex::new(dir.path());
            assert_eq!(index.get_last_file_id().unwrap(), FileId::ROOT);
            assert_eq!(index.get_next_integer().unwrap(), 0);
            assert_eq!(index.get_next_integer().unwrap(), 1);
            index.add_file_info(&FileInfo::directory(FileId::ROOT, "a")).unwrap();
        }
        let mut index = PathIndex::new(dir.path());
        assert_eq!(index.get_last_file_id().unwrap(), FileId::new(1));
        assert_eq!(index.get_next_integer().unwrap(), 2);
    }

    #[test]
    fn test_update_modification_time() {
        let (_dir, mut index) = temp_index();
        let a = index.add_file_info(&FileInfo::directory(FileId::ROOT, "a")).unwrap();
        let when = UNIX_EPOCH + Duration::from_secs(1_000_000);
        index.update_modification_time(a, when).unwrap();
        assert_eq!(index.get_file_info(a).unwrap().modification_time, when);
    }

    #[test]
    fn test_touching_root_of_fresh_index_keeps_counters() {
        let (_dir, mut index) = temp_index();
        index.update_modification_time(FileId::ROOT, UNIX_EPOCH).unwrap();
        assert_eq!(index.get_next_integer().unwrap(), 0);
        assert_eq!(
            index.add_file_info(&FileInfo::directory(FileId::ROOT, "a")).unwrap(),
            FileId::new(1)
        );
        assert!(index.is_file_system_consistent());
    }

    #[test]
    fn test_corrupted_database_resets() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = PathIndex::new(dir.path());
            index.add_file_info(&FileInfo::directory(FileId::ROOT, "a")).unwrap();
            index.add_file_info(&FileInfo::directory(FileId::ROOT, "b")).unwrap();
        }
        fs::write(StoreLayout::index_db_in(dir.path()), vec![0x5A; 8192]).unwrap();

        let mut index = PathIndex::new(dir.path());
        let root = index.get_file_info(FileId::ROOT).unwrap();
        assert!(root.is_directory());

        let id = index.add_file_info(&FileInfo::directory(FileId::ROOT, "fresh")).unwrap();
        assert_eq!(id, FileId::new(1));
        assert!(index.is_file_system_consistent());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("ok.txt").is_ok());
        assert!(validate_name("with space").is_ok());
        for bad in ["", ".", "..", "a/b", "nul\0"] {
            assert!(validate_name(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_data_path_rules() {
        assert!(is_valid_data_path("00/00000001"));
        assert!(is_valid_data_path("b.dat"));
        assert!(!is_valid_data_path(""));
        assert!(!is_valid_data_path("../x"));
        assert!(!is_valid_data_path("a/../../x"));
        assert!(!is_valid_data_path("/abs"));
        assert!(!is_valid_data_path("./x"));
        assert!(!is_valid_data_path("Paths/index.db"));
        assert!(!is_valid_data_path("FileSystem.usage"));
        assert!(is_valid_data_path("00/FileSystem.usage"));
    }
}
