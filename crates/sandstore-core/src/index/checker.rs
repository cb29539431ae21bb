//! Cross-checks a path index against itself and against the backing files.
//!
//! Runs three passes over a [`PathIndex`]:
//!
//! 1. **Records.** Every key is decoded and both counters must be present.
//!    A file record whose data path is illegal or shared with another
//!    record fails the check. One whose backing file is missing or not a
//!    plain file is removed from the index.
//! 2. **Orphans.** Every regular file under the store directory that no
//!    record references is deleted. The index directory and the usage cache
//!    are skipped.
//! 3. **Tree.** A walk from the root must reach every record exactly once
//!    through links whose `(parent, name)` agree with the child's record.
//!
//! Passes 1 and 2 repair what they can; anything else is reported as
//! [`IndexError::Inconsistent`].

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fs,
    path::Path,
};

use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use super::error::IndexError;
use super::file_info::{FileId, FileInfo, decode_record};
use super::path_index::{
    CHILD_LOOKUP_PREFIX, LAST_FILE_ID_KEY, LAST_INTEGER_KEY, PathIndex, is_valid_data_path, parse_id,
};
use crate::config::{INDEX_DIR_NAME, USAGE_FILE_NAME};

/// Outcome of a successful check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Directory records, including a stored root.
    pub directories: usize,
    pub files: usize,
    /// `CHILD_OF` links.
    pub links: usize,
    /// File records dropped because their backing file was unusable.
    pub removed_entries: usize,
    /// Unreferenced backing files deleted from disk.
    pub deleted_orphans: usize,
}

/// Decoded view of the index contents.
#[derive(Default)]
struct Snapshot {
    records: HashMap<FileId, FileInfo>,
    links: HashMap<(FileId, String), FileId>,
    last_file_id: Option<FileId>,
    last_integer: Option<i64>,
}

pub struct ConsistencyChecker<'a> {
    index: &'a mut PathIndex,
}

impl<'a> ConsistencyChecker<'a> {
    pub fn new(index: &'a mut PathIndex) -> Self {
        Self { index }
    }

    /// Run all passes, repairing what can be repaired.
    #[instrument(level = "info", skip(self), fields(store_dir = %self.index.store_dir().display()))]
    pub fn check(mut self) -> Result<CheckReport, IndexError> {
        let mut report = CheckReport::default();
        let mut snapshot = self.load()?;

        self.scan_records(&mut snapshot, &mut report)?;
        self.scan_directory(&snapshot, &mut report)?;
        verify_tree(&snapshot, &mut report)?;

        info!(
            directories = report.directories,
            files = report.files,
            removed = report.removed_entries,
            orphans = report.deleted_orphans,
            "Path index is consistent"
        );
        Ok(report)
    }

    fn load(&mut self) -> Result<Snapshot, IndexError> {
        let mut snapshot = Snapshot::default();
        for (key, value) in self.index.snapshot()? {
            if let Some(rest) = key.strip_prefix(CHILD_LOOKUP_PREFIX) {
                let (parent, name) = rest
                    .split_once(':')
                    .ok_or_else(|| IndexError::inconsistent(format!("malformed link key '{key}'")))?;
                let parent: FileId = parent
                    .parse()
                    .map_err(|_| IndexError::inconsistent(format!("malformed link key '{key}'")))?;
                snapshot.links.insert((parent, name.to_string()), parse_id(&value)?);
            } else if key == LAST_FILE_ID_KEY {
                snapshot.last_file_id = Some(parse_id(&value)?);
            } else if key == LAST_INTEGER_KEY {
                snapshot.last_integer = Some(parse_id(&value)?.get());
            } else {
                let id: FileId = key
                    .parse()
                    .map_err(|_| IndexError::inconsistent(format!("unknown key '{key}'")))?;
                let info = decode_record(&value)
                    .map_err(|e| IndexError::inconsistent(format!("record {id}: {e}")))?;
                snapshot.records.insert(id, info);
            }
        }
        Ok(snapshot)
    }

    /// Pass 1: verify counters and data paths, and drop file records whose
    /// backing file cannot be used.
    fn scan_records(&mut self, snapshot: &mut Snapshot, report: &mut CheckReport) -> Result<(), IndexError> {
        if !snapshot.records.is_empty() || !snapshot.links.is_empty() {
            let last = snapshot
                .last_file_id
                .ok_or_else(|| IndexError::inconsistent("LAST_FILE_ID missing"))?;
            if snapshot.last_integer.is_none() {
                return Err(IndexError::inconsistent("LAST_INTEGER missing"));
            }
            if let Some(max) = snapshot.records.keys().max() {
                if *max > last {
                    return Err(IndexError::inconsistent(format!(
                        "record {max} is beyond LAST_FILE_ID {last}"
                    )));
                }
            }
        }

        let store_dir = self.index.store_dir().to_path_buf();
        let mut seen_paths: HashSet<&str> = HashSet::new();
        let mut doomed = Vec::new();

        let mut ids: Vec<_> = snapshot.records.keys().copied().collect();
        ids.sort_unstable();
        for id in &ids {
            let info = &snapshot.records[id];
            if info.is_directory() {
                continue;
            }
            if !is_valid_data_path(&info.data_path) {
                return Err(IndexError::inconsistent(format!(
                    "record {id} has illegal data path '{}'",
                    info.data_path
                )));
            }
            if !seen_paths.insert(info.data_path.as_str()) {
                return Err(IndexError::inconsistent(format!(
                    "data path '{}' of record {id} is shared with another record",
                    info.data_path
                )));
            }
            if !is_regular_file(&info.backing_path(&store_dir)) {
                warn!(file_id = %id, data_path = %info.data_path, "Backing file missing, dropping file record");
                doomed.push(*id);
            }
        }

        for id in doomed {
            self.index.remove_file_info(id)?;
            if let Some(info) = snapshot.records.remove(&id) {
                snapshot.links.remove(&(info.parent_id, info.name));
            }
            report.removed_entries += 1;
        }

        for info in snapshot.records.values() {
            if info.is_directory() {
                report.directories += 1;
            } else {
                report.files += 1;
            }
        }
        report.links = snapshot.links.len();
        Ok(())
    }

    /// Pass 2: delete backing files no record points at.
    fn scan_directory(&self, snapshot: &Snapshot, report: &mut CheckReport) -> Result<(), IndexError> {
        let store_dir = self.index.store_dir();
        if !store_dir.is_dir() {
            return Ok(());
        }
        let referenced: HashSet<&str> = snapshot
            .records
            .values()
            .filter(|info| !info.is_directory())
            .map(|info| info.data_path.as_str())
            .collect();

        let walker = WalkDir::new(store_dir)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| !(entry.depth() == 1 && entry.file_name() == INDEX_DIR_NAME));

        for entry in walker {
            let entry = entry.map_err(|e| IndexError::io(e.into(), store_dir))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.depth() == 1 && entry.file_name() == USAGE_FILE_NAME {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(store_dir) else {
                continue;
            };
            let data_path = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if referenced.contains(data_path.as_str()) {
                continue;
            }
            debug!(%data_path, "Deleting orphaned backing file");
            fs::remove_file(entry.path()).map_err(|e| IndexError::io(e, entry.path()))?;
            report.deleted_orphans += 1;
        }
        Ok(())
    }
}

/// Pass 3: every record must be reachable from the root exactly once.
fn verify_tree(snapshot: &Snapshot, report: &mut CheckReport) -> Result<(), IndexError> {
    if let Some(root) = snapshot.records.get(&FileId::ROOT) {
        if !root.is_directory() || !root.parent_id.is_root() {
            return Err(IndexError::inconsistent("root record is not a top-level directory"));
        }
    }

    let mut children: HashMap<FileId, Vec<(&str, FileId)>> = HashMap::new();
    for ((parent, name), child) in &snapshot.links {
        let info = snapshot
            .records
            .get(child)
            .ok_or_else(|| IndexError::inconsistent(format!("link {parent}:{name} points at missing {child}")))?;
        if info.parent_id != *parent || info.name != *name {
            return Err(IndexError::inconsistent(format!(
                "link {parent}:{name} disagrees with record {child}"
            )));
        }
        if child.is_root() {
            return Err(IndexError::inconsistent("the root has a parent link"));
        }
        children.entry(*parent).or_default().push((name.as_str(), *child));
    }

    let mut visited = HashSet::from([FileId::ROOT]);
    let mut queue = VecDeque::from([FileId::ROOT]);
    while let Some(dir) = queue.pop_front() {
        let is_directory = dir.is_root() || snapshot.records.get(&dir).is_some_and(FileInfo::is_directory);
        let Some(entries) = children.get(&dir) else {
            continue;
        };
        if !is_directory {
            return Err(IndexError::inconsistent(format!("file {dir} has children")));
        }
        for (_, child) in entries {
            if !visited.insert(*child) {
                return Err(IndexError::inconsistent(format!("{child} is reachable twice")));
            }
            queue.push_back(*child);
        }
    }

    let root_stored = snapshot.records.contains_key(&FileId::ROOT);
    let expected = snapshot.records.len() + usize::from(!root_stored);
    if visited.len() != expected {
        return Err(IndexError::inconsistent(format!(
            "{} of {expected} records reachable from the root",
            visited.len()
        )));
    }
    if report.links + 1 != expected {
        return Err(IndexError::inconsistent(format!(
            "{} links for {expected} records",
            report.links
        )));
    }
    Ok(())
}

fn is_regular_file(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|meta| meta.file_type().is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::file_info::encode_record;
    use crate::index::kv::{KvStore, WriteBatch};
    use crate::index::path_index::child_lookup_key;
    use crate::layout::StoreLayout;
    use tempfile::TempDir;

    fn add_backed_file(index: &mut PathIndex, parent: FileId, name: &str, data_path: &str) -> FileId {
        let path = index.store_dir().join(data_path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"data").unwrap();
        index.add_file_info(&FileInfo::file(parent, name, data_path)).unwrap()
    }

    #[test]
    fn test_empty_store_is_consistent() {
        let dir = TempDir::new().unwrap();
        let mut index = PathIndex::new(dir.path());
        let report = ConsistencyChecker::new(&mut index).check().unwrap();
        assert_eq!(report, CheckReport::default());
    }

    #[test]
    fn test_counts_healthy_tree() {
        let dir = TempDir::new().unwrap();
        let mut index = PathIndex::new(dir.path());
        let a = index.add_file_info(&FileInfo::directory(FileId::ROOT, "a")).unwrap();
        add_backed_file(&mut index, a, "x", "00/00000000");
        add_backed_file(&mut index, FileId::ROOT, "y", "00/00000001");

        let report = ConsistencyChecker::new(&mut index).check().unwrap();
        assert_eq!(report.directories, 2);
        assert_eq!(report.files, 2);
        assert_eq!(report.links, 3);
        assert_eq!(report.removed_entries, 0);
    }

    #[test]
    fn test_missing_backing_file_drops_record() {
        let dir = TempDir::new().unwrap();
        let mut index = PathIndex::new(dir.path());
        let kept = add_backed_file(&mut index, FileId::ROOT, "kept", "00/00000000");
        let lost = add_backed_file(&mut index, FileId::ROOT, "lost", "00/00000001");
        fs::remove_file(dir.path().join("00/00000001")).unwrap();

        let report = ConsistencyChecker::new(&mut index).check().unwrap();
        assert_eq!(report.removed_entries, 1);
        assert_eq!(report.files, 1);
        assert!(index.get_file_info(kept).is_ok());
        assert!(matches!(index.get_file_info(lost), Err(IndexError::NotFound(_))));
    }

    #[test]
    fn test_orphan_files_are_deleted() {
        let dir = TempDir::new().unwrap();
        let mut index = PathIndex::new(dir.path());
        add_backed_file(&mut index, FileId::ROOT, "kept", "00/00000000");
        fs::write(dir.path().join("00/00000099"), b"stray").unwrap();
        fs::write(StoreLayout::usage_cache_path_in(dir.path()), b"usage").unwrap();

        let report = ConsistencyChecker::new(&mut index).check().unwrap();
        assert_eq!(report.deleted_orphans, 1);
        assert!(!dir.path().join("00/00000099").exists());
        assert!(dir.path().join("00/00000000").exists());
        assert!(StoreLayout::usage_cache_path_in(dir.path()).exists());
        assert!(StoreLayout::index_db_in(dir.path()).exists());
    }

    #[test]
    fn test_dangling_link_is_inconsistent() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = PathIndex::new(dir.path());
            index.add_file_info(&FileInfo::directory(FileId::ROOT, "a")).unwrap();
        }
        {
            let mut store = KvStore::open(&StoreLayout::index_db_in(dir.path())).unwrap();
            let mut batch = WriteBatch::new();
            batch.put(child_lookup_key(FileId::ROOT, "ghost"), "7");
            store.write(batch).unwrap();
        }
        let mut index = PathIndex::new(dir.path());
        let err = ConsistencyChecker::new(&mut index).check().unwrap_err();
        assert!(matches!(err, IndexError::Inconsistent { .. }));
        assert!(!index.is_file_system_consistent());
    }

    #[test]
    fn test_unreachable_record_is_inconsistent() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = PathIndex::new(dir.path());
            index.add_file_info(&FileInfo::directory(FileId::ROOT, "a")).unwrap();
        }
        {
            let mut store = KvStore::open(&StoreLayout::index_db_in(dir.path())).unwrap();
            let mut batch = WriteBatch::new();
            batch.put("1", encode_record(&FileInfo::directory(FileId::ROOT, "a")));
            batch.put("LAST_FILE_ID", "2");
            batch.put("2", encode_record(&FileInfo::directory(FileId::new(1), "lost")));
            store.write(batch).unwrap();
        }
        let mut index = PathIndex::new(dir.path());
        assert!(!index.is_file_system_consistent());
    }

    #[test]
    fn test_shared_data_path_fails_without_dropping_records() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = PathIndex::new(dir.path());
            add_backed_file(&mut index, FileId::ROOT, "a", "00/00000001");
            add_backed_file(&mut index, FileId::ROOT, "b", "00/00000002");
        }
        {
            let mut store = KvStore::open(&StoreLayout::index_db_in(dir.path())).unwrap();
            let mut batch = WriteBatch::new();
            batch.put("2", encode_record(&FileInfo::file(FileId::ROOT, "b", "00/00000001")));
            store.write(batch).unwrap();
        }

        let mut index = PathIndex::new(dir.path());
        let err = ConsistencyChecker::new(&mut index).check().unwrap_err();
        assert!(matches!(err, IndexError::Inconsistent { .. }), "{err}");
        assert_eq!(index.get_child_with_name(FileId::ROOT, "a").unwrap(), Some(FileId::new(1)));
        assert_eq!(index.get_child_with_name(FileId::ROOT, "b").unwrap(), Some(FileId::new(2)));
    }

    #[test]
    fn test_illegal_data_path_fails() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = PathIndex::new(dir.path());
            add_backed_file(&mut index, FileId::ROOT, "a", "00/00000001");
        }
        {
            let mut store = KvStore::open(&StoreLayout::index_db_in(dir.path())).unwrap();
            let mut batch = WriteBatch::new();
            batch.put("1", encode_record(&FileInfo::file(FileId::ROOT, "a", "../outside")));
            store.write(batch).unwrap();
        }

        let mut index = PathIndex::new(dir.path());
        assert!(matches!(
            ConsistencyChecker::new(&mut index).check(),
            Err(IndexError::Inconsistent { .. })
        ));
        assert!(index.get_file_info(FileId::new(1)).is_ok());
    }

    #[test]
    fn test_missing_integer_counter_fails() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = PathIndex::new(dir.path());
            index.add_file_info(&FileInfo::directory(FileId::ROOT, "a")).unwrap();
        }
        {
            let mut store = KvStore::open(&StoreLayout::index_db_in(dir.path())).unwrap();
            let mut batch = WriteBatch::new();
            batch.delete("LAST_INTEGER");
            store.write(batch).unwrap();
        }

        let mut index = PathIndex::new(dir.path());
        let err = ConsistencyChecker::new(&mut index).check().unwrap_err();
        assert!(err.to_string().contains("LAST_INTEGER"), "{err}");
    }
}
