//! File and directory operations over one origin+type store.
//!
//! Virtual paths are resolved through the [`PathIndex`]; file contents live
//! in backing files with opaque names (`00/00000042`) below the store
//! directory. Every mutation that can grow the store follows the same
//! sequence:
//!
//! 1. compute the growth from the current index and backing-file sizes
//! 2. reserve it with the [`QuotaCoordinator`] (denial stops here, nothing
//!    has been touched)
//! 3. raise the usage cache's dirty count
//! 4. do the backing-file I/O and the index update
//! 5. commit the realized delta, release the reservation, lower the dirty
//!    count
//!
//! Deletions skip the reservation and commit a negative delta.
//!
//! If committing fails after the I/O has happened the operation returns
//! [`StoreError::FatalInconsistency`], the usage cache is invalidated, and
//! the next mutation first runs [`ObfuscatedStore::check_consistency`].

use std::{
    collections::{HashSet, VecDeque},
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use relative_path::RelativePath;
use tokio::fs;
use tracing::{debug, error, info, instrument, trace, warn};

use super::path::VirtualPath;
use crate::config::StoreConfig;
use crate::error::{OpContext, StoreError};
use crate::index::{CheckReport, ConsistencyChecker, FileId, FileInfo, IndexError, PathIndex};
use crate::origin::{Origin, StorageType};
use crate::quota::{QuotaCoordinator, QuotaError, QuotaReservation};
use crate::usage::UsageCacheError;

/// Whether [`ObfuscatedStore::copy_or_move_file`] keeps the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOrMoveMode {
    Copy,
    Move,
}

/// What callers see of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    pub file_id: FileId,
    pub name: String,
    pub is_directory: bool,
    /// Backing-file length; 0 for directories.
    pub size: u64,
    /// Index timestamp, whole seconds.
    pub modification_time: SystemTime,
}

/// Backing-file name minted from the index's integer counter.
fn data_path_for(n: i64) -> String {
    format!("{:02}/{:08}", n / 100, n)
}

pub struct ObfuscatedStore {
    origin: Origin,
    storage_type: StorageType,
    store_dir: PathBuf,
    index: PathIndex,
    coordinator: Arc<QuotaCoordinator>,
    config: StoreConfig,
    needs_check: bool,
}

impl std::fmt::Debug for ObfuscatedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObfuscatedStore")
            .field("origin", &self.origin)
            .field("storage_type", &self.storage_type)
            .field("store_dir", &self.store_dir)
            .field("needs_check", &self.needs_check)
            .finish_non_exhaustive()
    }
}

impl ObfuscatedStore {
    /// Open the store of `origin`/`storage_type`, creating its directory.
    ///
    /// A missing usage cache is rebuilt by a full scan, and the authority is
    /// told what the store holds. A cache left dirty by an interrupted
    /// mutation is invalidated and the consistency check is scheduled before
    /// the next mutation.
    #[instrument(level = "info", skip(config, coordinator), fields(%origin, %storage_type))]
    pub async fn open(
        config: &StoreConfig,
        origin: Origin,
        storage_type: StorageType,
        coordinator: Arc<QuotaCoordinator>,
    ) -> Result<Self, StoreError> {
        let store_dir = coordinator.layout().store_dir(&origin, storage_type);
        fs::create_dir_all(&store_dir)
            .await
            .map_err(|e| StoreError::io(e, OpContext::new().with_backing_path(&store_dir)))?;

        let mut store = Self {
            index: PathIndex::new(&store_dir),
            origin,
            storage_type,
            store_dir,
            coordinator,
            config: config.clone(),
            needs_check: false,
        };

        match store.coordinator.usage_record(&store.origin, store.storage_type) {
            Ok(record) if record.dirty > 0 => {
                warn!(
                    path = %store.usage_cache_path().display(),
                    dirty = record.dirty,
                    "Usage cache was left dirty, scheduling a consistency check"
                );
                store.invalidate_usage();
                store.needs_check = true;
            }
            Ok(record) if record.is_valid => store.sync_authority(record.usage, 0).await,
            Err(QuotaError::UsageCache(UsageCacheError::Io { source, path })) => {
                return Err(StoreError::io(source, OpContext::new().with_backing_path(path)));
            }
            Ok(_) | Err(_) => {
                debug!("Usage cache missing or stale, recomputing");
                store.recompute_usage(0).await?;
            }
        }

        info!(store_dir = %store.store_dir.display(), "Store opened");
        Ok(store)
    }

    #[inline]
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    #[inline]
    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    #[inline]
    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    pub fn usage_cache_path(&self) -> PathBuf {
        self.coordinator.usage_cache_path(&self.origin, self.storage_type)
    }

    /// Whether the next mutation will run the consistency check first.
    pub fn needs_consistency_check(&self) -> bool {
        self.needs_check
    }

    // ==================== Queries ====================

    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub async fn get_metadata(&mut self, path: &VirtualPath) -> Result<EntryMetadata, StoreError> {
        path.validate()?;
        let (id, info) = self.resolve(path)?;
        metadata_for(&self.store_dir, id, info, path).await
    }

    /// Children of a directory, sorted by name.
    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub async fn read_directory(&mut self, path: &VirtualPath) -> Result<Vec<EntryMetadata>, StoreError> {
        path.validate()?;
        let (dir_id, info) = self.resolve(path)?;
        if !info.is_directory() {
            return Err(StoreError::NotADirectory {
                path: path.as_str().to_string(),
            });
        }
        let children = self
            .index
            .list_children(dir_id)
            .map_err(|e| StoreError::from_index(e, path.as_str()))?;

        let mut entries = Vec::with_capacity(children.len());
        for child in children {
            let info = self
                .index
                .get_file_info(child)
                .map_err(|e| StoreError::from_index(e, path.as_str()))?;
            let child_path = path.join(&info.name);
            entries.push(metadata_for(&self.store_dir, child, info, &child_path).await?);
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Absolute path of a file's backing file, for I/O done outside the
    /// engine.
    pub fn local_path(&mut self, path: &VirtualPath) -> Result<PathBuf, StoreError> {
        path.validate()?;
        let (_, info) = self.resolve(path)?;
        if info.is_directory() {
            return Err(StoreError::NotAFile {
                path: path.as_str().to_string(),
            });
        }
        Ok(info.backing_path(&self.store_dir))
    }

    /// Bytes used by the store: every backing file plus the path cost of
    /// every entry except the root.
    ///
    /// Served from the usage cache when it is valid and clean, otherwise
    /// recomputed and written back.
    pub async fn usage(&mut self) -> Result<i64, StoreError> {
        self.index.init().map_err(|e| StoreError::from_index(e, ""))?;
        self.note_index_recovery();
        if let Some(usage) = self.coordinator.cached_usage(&self.origin, self.storage_type) {
            return Ok(usage);
        }
        self.recompute_usage(0).await
    }

    // ==================== Mutations ====================

    /// Create a directory. With `recursive`, missing ancestors are created
    /// too and each one is charged its path cost.
    #[instrument(level = "info", skip(self), fields(path = %path))]
    pub async fn create_directory(
        &mut self,
        path: &VirtualPath,
        exclusive: bool,
        recursive: bool,
    ) -> Result<(), StoreError> {
        path.validate()?;
        self.ensure_checked().await?;

        let mut parent = FileId::ROOT;
        let mut missing: Vec<&str> = Vec::new();
        for component in path.components() {
            if !missing.is_empty() {
                missing.push(component);
                continue;
            }
            match self.child(parent, component, path)? {
                Some(id) => {
                    let info = self.file_info(id, path)?;
                    if !info.is_directory() {
                        return Err(StoreError::NotADirectory {
                            path: path.as_str().to_string(),
                        });
                    }
                    parent = id;
                }
                None => missing.push(component),
            }
        }

        if missing.is_empty() {
            return if exclusive {
                Err(StoreError::AlreadyExists {
                    path: path.as_str().to_string(),
                })
            } else {
                Ok(())
            };
        }
        if missing.len() > 1 && !recursive {
            return Err(StoreError::NotFound {
                path: path.parent().map(|p| p.as_str().to_string()).unwrap_or_default(),
            });
        }

        let growth: i64 = missing.iter().map(|name| self.config.path_cost(name)).sum();
        let reservation = self.reserve_and_begin(path, growth).await?;

        let mut realized = 0;
        let outcome = self.add_directories(parent, &missing, path, &mut realized);
        if outcome.is_ok() {
            self.touch_entry(parent);
        }
        self.finish(path, reservation, realized, outcome)
    }

    fn add_directories(
        &mut self,
        mut parent: FileId,
        names: &[&str],
        path: &VirtualPath,
        realized: &mut i64,
    ) -> Result<(), StoreError> {
        for name in names {
            parent = self
                .index
                .add_file_info(&FileInfo::directory(parent, *name))
                .map_err(|e| StoreError::from_index(e, path.as_str()))?;
            *realized += self.config.path_cost(name);
            trace!(file_id = %parent, %name, "Directory created");
        }
        Ok(())
    }

    /// Create an empty file if nothing exists at `path`.
    ///
    /// Returns whether a file was created; an existing file is left alone.
    #[instrument(level = "info", skip(self), fields(path = %path))]
    pub async fn ensure_file_exists(&mut self, path: &VirtualPath) -> Result<bool, StoreError> {
        path.validate()?;
        self.ensure_checked().await?;

        if let Some(id) = self.lookup(path)? {
            let info = self.file_info(id, path)?;
            return if info.is_directory() {
                Err(StoreError::NotAFile {
                    path: path.as_str().to_string(),
                })
            } else {
                Ok(false)
            };
        }
        let (parent_id, name) = self.resolve_parent(path)?;

        let growth = self.config.path_cost(&name);
        let reservation = self.reserve_and_begin(path, growth).await?;

        let mut realized = 0;
        let outcome = self.create_file_entry(parent_id, &name, None, path, &mut realized).await;
        if outcome.is_ok() {
            self.touch_entry(parent_id);
        }
        self.finish(path, reservation, realized, outcome.map(|_| true))
    }

    /// Mint a backing file, fill it from `source` (or leave it empty) and
    /// link it into the tree.
    async fn create_file_entry(
        &mut self,
        parent_id: FileId,
        name: &str,
        source: Option<&Path>,
        path: &VirtualPath,
        realized: &mut i64,
    ) -> Result<FileId, StoreError> {
        let n = self
            .index
            .get_next_integer()
            .map_err(|e| StoreError::from_index(e, path.as_str()))?;
        let data_path = data_path_for(n);
        let backing = RelativePath::new(&data_path).to_path(&self.store_dir);
        let context = || OpContext::new().with_virtual_path(path.as_str()).with_backing_path(&backing);

        if let Some(dir) = backing.parent() {
            fs::create_dir_all(dir).await.map_err(|e| StoreError::io(e, context()))?;
        }
        if fs::try_exists(&backing).await.unwrap_or(false) {
            warn!(backing = %backing.display(), "Removing stray backing file");
            fs::remove_file(&backing).await.map_err(|e| StoreError::io(e, context()))?;
        }

        let size = match source {
            Some(src) => match fs::copy(src, &backing).await {
                Ok(size) => size,
                Err(e) => {
                    remove_unlinked(&backing).await;
                    return Err(StoreError::io(e, context()));
                }
            },
            None => {
                fs::File::create(&backing)
                    .await
                    .map_err(|e| StoreError::io(e, context()))?;
                0
            }
        };

        match self.index.add_file_info(&FileInfo::file(parent_id, name, data_path.as_str())) {
            Ok(id) => {
                *realized += size as i64 + self.config.path_cost(name);
                trace!(file_id = %id, %data_path, size, "File created");
                Ok(id)
            }
            Err(e) => {
                remove_unlinked(&backing).await;
                Err(StoreError::from_index(e, path.as_str()))
            }
        }
    }

    /// Set a node's modification time.
    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub async fn touch(&mut self, path: &VirtualPath, modification_time: SystemTime) -> Result<(), StoreError> {
        path.validate()?;
        self.ensure_checked().await?;
        let id = self.lookup(path)?.ok_or_else(|| StoreError::NotFound {
            path: path.as_str().to_string(),
        })?;

        self.begin_mutation(path, 0).await?;
        let outcome = self
            .index
            .update_modification_time(id, modification_time)
            .map_err(|e| StoreError::from_index(e, path.as_str()));
        self.finish_without_reservation(path, 0, outcome)
    }

    /// Resize a file's backing file to `length` bytes. Only growth is
    /// reserved.
    #[instrument(level = "info", skip(self), fields(path = %path))]
    pub async fn truncate(&mut self, path: &VirtualPath, length: u64) -> Result<(), StoreError> {
        path.validate()?;
        self.ensure_checked().await?;
        let (id, info) = self.resolve_file(path)?;
        let backing = info.backing_path(&self.store_dir);
        let old_size = backing_size(&backing, path).await?;

        let growth = length as i64 - old_size as i64;
        let reservation = self.reserve_and_begin(path, growth.max(0)).await?;

        let mut realized = 0;
        let outcome = set_backing_len(path, &backing, length).await;
        if outcome.is_ok() {
            realized = growth;
            self.touch_entry(id);
        }
        self.finish(path, reservation, realized, outcome)
    }

    /// Copy a file from outside the store to `dest`, replacing an existing
    /// file there.
    #[instrument(level = "info", skip(self), fields(src = %src.display(), dest = %dest))]
    pub async fn copy_in_foreign_file(&mut self, src: &Path, dest: &VirtualPath) -> Result<(), StoreError> {
        dest.validate()?;
        self.ensure_checked().await?;
        let src_meta = fs::metadata(src).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound {
                path: src.display().to_string(),
            },
            _ => StoreError::io(e, OpContext::new().with_backing_path(src)),
        })?;
        if !src_meta.is_file() {
            return Err(StoreError::NotAFile {
                path: src.display().to_string(),
            });
        }
        let src_size = src_meta.len() as i64;

        match self.lookup(dest)? {
            Some(dest_id) => {
                let info = self.file_info(dest_id, dest)?;
                if info.is_directory() {
                    return Err(StoreError::NotAFile {
                        path: dest.as_str().to_string(),
                    });
                }
                let backing = info.backing_path(&self.store_dir);
                let dest_size = backing_size(&backing, dest).await? as i64;
                let growth = src_size - dest_size;
                let reservation = self.reserve_and_begin(dest, growth.max(0)).await?;

                let mut realized = 0;
                let outcome = match fs::copy(src, &backing).await {
                    Ok(copied) => {
                        realized = copied as i64 - dest_size;
                        self.touch_entry(dest_id);
                        Ok(())
                    }
                    Err(e) => {
                        realized = self.settle_failed_write(&backing, dest_size).await;
                        Err(StoreError::io(e, io_context(dest, &backing)))
                    }
                };
                self.finish(dest, reservation, realized, outcome)
            }
            None => {
                let (parent_id, name) = self.resolve_parent(dest)?;
                let growth = src_size + self.config.path_cost(&name);
                let reservation = self.reserve_and_begin(dest, growth).await?;

                let mut realized = 0;
                let outcome = self
                    .create_file_entry(parent_id, &name, Some(src), dest, &mut realized)
                    .await;
                if outcome.is_ok() {
                    self.touch_entry(parent_id);
                }
                self.finish(dest, reservation, realized, outcome.map(|_| ()))
            }
        }
    }

    /// Copy or move a file inside the store, replacing an existing file at
    /// `dest`. Directories can be moved, with their contents, but not
    /// copied or moved over an existing entry.
    #[instrument(level = "info", skip(self), fields(src = %src, dest = %dest))]
    pub async fn copy_or_move_file(
        &mut self,
        src: &VirtualPath,
        dest: &VirtualPath,
        mode: CopyOrMoveMode,
    ) -> Result<(), StoreError> {
        src.validate()?;
        dest.validate()?;
        self.ensure_checked().await?;
        if src == dest {
            return Err(StoreError::invalid_operation(
                "source and destination are the same",
                src.as_str(),
            ));
        }

        let (src_id, src_info) = self.resolve(src)?;
        let src_backing = src_info.backing_path(&self.store_dir);
        let src_size = if src_info.is_directory() {
            if mode == CopyOrMoveMode::Copy {
                return Err(StoreError::NotAFile {
                    path: src.as_str().to_string(),
                });
            }
            0
        } else {
            backing_size(&src_backing, src).await? as i64
        };

        let dest_existing = match self.lookup(dest)? {
            Some(_) if src_info.is_directory() => {
                return Err(StoreError::AlreadyExists {
                    path: dest.as_str().to_string(),
                });
            }
            Some(dest_id) => {
                let info = self.file_info(dest_id, dest)?;
                if info.is_directory() {
                    return Err(StoreError::NotAFile {
                        path: dest.as_str().to_string(),
                    });
                }
                let size = backing_size(&info.backing_path(&self.store_dir), dest).await? as i64;
                Some((dest_id, info, size))
            }
            None => None,
        };
        let (dest_parent, dest_name) = self.resolve_parent(dest)?;

        let mut growth = match mode {
            CopyOrMoveMode::Copy => src_size,
            CopyOrMoveMode::Move => -self.config.path_cost(&src_info.name),
        };
        growth += match &dest_existing {
            Some((_, _, dest_size)) => -dest_size,
            None => self.config.path_cost(&dest_name),
        };

        let reservation = self.reserve_and_begin(dest, growth.max(0)).await?;

        let mut realized = 0;
        let outcome = match (mode, dest_existing) {
            (CopyOrMoveMode::Copy, Some((dest_id, dest_info, dest_size))) => {
                let dest_backing = dest_info.backing_path(&self.store_dir);
                match fs::copy(&src_backing, &dest_backing).await {
                    Ok(_) => {
                        realized = growth;
                        self.touch_entry(dest_id);
                        Ok(())
                    }
                    Err(e) => {
                        realized = self.settle_failed_write(&dest_backing, dest_size).await;
                        Err(StoreError::io(e, io_context(dest, &dest_backing)))
                    }
                }
            }
            (CopyOrMoveMode::Copy, None) => self
                .create_file_entry(dest_parent, &dest_name, Some(&src_backing), dest, &mut realized)
                .await
                .map(|_| ()),
            (CopyOrMoveMode::Move, Some((dest_id, dest_info, _))) => {
                match self.index.overwriting_move_file(src_id, dest_id) {
                    Ok(()) => {
                        realized = growth;
                        let old_backing = dest_info.backing_path(&self.store_dir);
                        if let Err(e) = fs::remove_file(&old_backing).await {
                            warn!(error = %e, backing = %old_backing.display(), "Failed to delete overwritten backing file");
                        }
                        self.touch_entry(dest_id);
                        self.touch_entry(src_info.parent_id);
                        Ok(())
                    }
                    Err(e) => Err(StoreError::from_index(e, dest.as_str())),
                }
            }
            (CopyOrMoveMode::Move, None) => {
                let moved = FileInfo {
                    parent_id: dest_parent,
                    name: dest_name.clone(),
                    ..src_info.clone()
                };
                match self.index.update_file_info(src_id, &moved) {
                    Ok(()) => {
                        realized = growth;
                        self.touch_entry(src_info.parent_id);
                        Ok(())
                    }
                    Err(e) => Err(StoreError::from_index(e, dest.as_str())),
                }
            }
        };
        if outcome.is_ok() {
            self.touch_entry(dest_parent);
        }
        self.finish(dest, reservation, realized, outcome)
    }

    /// Remove a file and its backing file.
    #[instrument(level = "info", skip(self), fields(path = %path))]
    pub async fn delete_file(&mut self, path: &VirtualPath) -> Result<(), StoreError> {
        path.validate()?;
        self.ensure_checked().await?;
        let (id, info) = self.resolve_file(path)?;
        let backing = info.backing_path(&self.store_dir);
        let size = match fs::metadata(&backing).await {
            Ok(meta) => meta.len() as i64,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(backing = %backing.display(), "Backing file already missing");
                0
            }
            Err(e) => return Err(StoreError::io(e, io_context(path, &backing))),
        };

        self.begin_mutation(path, 0).await?;
        let mut realized = 0;
        let outcome = match self.index.remove_file_info(id) {
            Ok(()) => {
                realized = -(size + self.config.path_cost(&info.name));
                match fs::remove_file(&backing).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!(error = %e, backing = %backing.display(), "Failed to delete backing file"),
                }
                self.touch_entry(info.parent_id);
                Ok(())
            }
            Err(e) => Err(StoreError::from_index(e, path.as_str())),
        };
        self.finish_without_reservation(path, realized, outcome)
    }

    /// Remove an empty directory. The root cannot be removed.
    #[instrument(level = "info", skip(self), fields(path = %path))]
    pub async fn delete_directory(&mut self, path: &VirtualPath) -> Result<(), StoreError> {
        path.validate()?;
        self.ensure_checked().await?;
        if path.is_root() {
            return Err(StoreError::invalid_operation("cannot delete the root directory", path.as_str()));
        }
        let (id, info) = self.resolve(path)?;
        if !info.is_directory() {
            return Err(StoreError::NotADirectory {
                path: path.as_str().to_string(),
            });
        }

        self.begin_mutation(path, 0).await?;
        let mut realized = 0;
        let outcome = match self.index.remove_file_info(id) {
            Ok(()) => {
                realized = -self.config.path_cost(&info.name);
                self.touch_entry(info.parent_id);
                Ok(())
            }
            Err(e) => Err(StoreError::from_index(e, path.as_str())),
        };
        self.finish_without_reservation(path, realized, outcome)
    }

    // ==================== Health ====================

    /// Validate and repair the index against the backing files, then
    /// recompute usage from scratch.
    #[instrument(level = "info", skip(self), fields(origin = %self.origin, storage_type = %self.storage_type))]
    pub async fn check_consistency(&mut self) -> Result<CheckReport, StoreError> {
        let report = ConsistencyChecker::new(&mut self.index)
            .check()
            .map_err(|e| StoreError::from_index(e, ""))?;
        let usage = self.recompute_usage(0).await?;
        self.needs_check = false;
        info!(?report, usage, "Consistency check finished");
        Ok(report)
    }

    async fn ensure_checked(&mut self) -> Result<(), StoreError> {
        self.index.init().map_err(|e| StoreError::from_index(e, ""))?;
        self.note_index_recovery();
        if self.needs_check {
            warn!("Running deferred consistency check");
            self.check_consistency().await?;
        }
        Ok(())
    }

    /// A repaired or reset index no longer matches the usage cache or the
    /// backing files.
    fn note_index_recovery(&mut self) {
        if self.index.take_recovered() {
            warn!("Path index was recovered, scheduling a consistency check");
            self.invalidate_usage();
            self.needs_check = true;
        }
    }

    /// Walk the whole tree, store the result as the new cached usage and
    /// bring the authority in line with it. `pending` is growth this store
    /// has reserved and not yet released.
    async fn recompute_usage(&mut self, pending: i64) -> Result<i64, StoreError> {
        let mut total = 0i64;
        let mut visited = HashSet::from([FileId::ROOT]);
        let mut queue = VecDeque::from([FileId::ROOT]);
        while let Some(dir) = queue.pop_front() {
            let children = self.index.list_children(dir).map_err(|e| StoreError::from_index(e, ""))?;
            for child in children {
                if !visited.insert(child) {
                    return Err(StoreError::from_index(
                        IndexError::Inconsistent {
                            reason: format!("{child} is reachable twice"),
                        },
                        "",
                    ));
                }
                let info = self.index.get_file_info(child).map_err(|e| StoreError::from_index(e, ""))?;
                total += self.config.path_cost(&info.name);
                if info.is_directory() {
                    queue.push_back(child);
                } else {
                    total += fs::metadata(info.backing_path(&self.store_dir))
                        .await
                        .map_or(0, |meta| meta.len() as i64);
                }
            }
        }

        self.coordinator
            .update_usage(&self.origin, self.storage_type, total)
            .map_err(|e| StoreError::from_quota(e, ""))?;
        debug!(usage = total, "Usage recomputed");
        self.sync_authority(total, pending).await;
        Ok(total)
    }

    /// Push the store's usage to the authority. An unreachable authority is
    /// only logged here; the next reservation reports it.
    async fn sync_authority(&mut self, usage: i64, pending: i64) {
        if let Err(error) = self
            .coordinator
            .sync_authority(&self.origin, self.storage_type, usage, pending)
            .await
        {
            warn!(%error, usage, "Could not bring the quota authority up to date");
        }
    }

    /// Size change left behind by a write into `backing` that failed part
    /// way. When even that cannot be read the usage is handed to the next
    /// consistency check.
    async fn settle_failed_write(&mut self, backing: &Path, old_size: i64) -> i64 {
        match fs::metadata(backing).await {
            Ok(meta) => meta.len() as i64 - old_size,
            Err(error) => {
                warn!(%error, backing = %backing.display(), "Size after a failed write is unknown");
                self.invalidate_usage();
                self.needs_check = true;
                0
            }
        }
    }

    // ==================== Protocol plumbing ====================

    /// Reserve `growth` and open the dirty bracket. Nothing is held if this
    /// fails.
    async fn reserve_and_begin(&mut self, path: &VirtualPath, growth: i64) -> Result<QuotaReservation, StoreError> {
        let reservation = self
            .coordinator
            .reserve_quota(&self.origin, self.storage_type, growth)
            .await
            .map_err(|e| StoreError::from_quota(e, path.as_str()))?;
        if let Err(e) = self.begin_mutation(path, reservation.size).await {
            if let Err(error) = self.coordinator.release_reserved_quota(reservation) {
                warn!(%error, "Failed to release reserved quota");
            }
            return Err(e);
        }
        Ok(reservation)
    }

    /// Raise the dirty count, rebuilding a usage cache that has gone missing.
    /// `pending` is the growth already reserved for this mutation.
    async fn begin_mutation(&mut self, path: &VirtualPath, pending: i64) -> Result<(), StoreError> {
        match self.coordinator.increment_dirty_count(&self.origin, self.storage_type) {
            Ok(_) => return Ok(()),
            Err(QuotaError::UsageCache(UsageCacheError::Missing(_) | UsageCacheError::InvalidFormat { .. })) => {
                warn!("Usage cache unusable at mutation start, recomputing");
            }
            Err(e) => return Err(StoreError::from_quota(e, path.as_str())),
        }
        self.recompute_usage(pending).await?;
        self.coordinator
            .increment_dirty_count(&self.origin, self.storage_type)
            .map(|_| ())
            .map_err(|e| StoreError::from_quota(e, path.as_str()))
    }

    fn end_mutation(&self) {
        if let Err(error) = self.coordinator.decrement_dirty_count(&self.origin, self.storage_type) {
            warn!(%error, "Failed to lower the usage dirty count");
        }
    }

    /// Commit `realized`, release the reservation and close the dirty
    /// bracket. A commit failure overrides the operation's own result.
    fn finish<T>(
        &mut self,
        path: &VirtualPath,
        reservation: QuotaReservation,
        realized: i64,
        outcome: Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let committed = self.commit(path, realized);
        if let Err(error) = self.coordinator.release_reserved_quota(reservation) {
            warn!(%error, "Failed to release reserved quota");
        }
        self.end_mutation();
        committed.and(outcome)
    }

    fn finish_without_reservation<T>(
        &mut self,
        path: &VirtualPath,
        realized: i64,
        outcome: Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let committed = self.commit(path, realized);
        self.end_mutation();
        committed.and(outcome)
    }

    fn commit(&mut self, path: &VirtualPath, realized: i64) -> Result<(), StoreError> {
        match self
            .coordinator
            .commit_quota_usage(&self.origin, self.storage_type, realized)
        {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, realized, "Usage commit failed after the store was modified");
                self.invalidate_usage();
                self.needs_check = true;
                Err(StoreError::FatalInconsistency {
                    reason: e.to_string(),
                    context: OpContext::new().with_virtual_path(path.as_str()),
                })
            }
        }
    }

    fn invalidate_usage(&self) {
        if let Err(error) = self.coordinator.invalidate_usage(&self.origin, self.storage_type) {
            error!(%error, "Failed to invalidate the usage cache");
        }
    }

    // ==================== Lookup helpers ====================

    fn lookup(&mut self, path: &VirtualPath) -> Result<Option<FileId>, StoreError> {
        let found = self
            .index
            .get_file_with_path(path.as_str())
            .map_err(|e| StoreError::from_index(e, path.as_str()));
        self.note_index_recovery();
        found
    }

    fn child(&mut self, parent: FileId, name: &str, path: &VirtualPath) -> Result<Option<FileId>, StoreError> {
        self.index
            .get_child_with_name(parent, name)
            .map_err(|e| StoreError::from_index(e, path.as_str()))
    }

    fn file_info(&mut self, id: FileId, path: &VirtualPath) -> Result<FileInfo, StoreError> {
        self.index
            .get_file_info(id)
            .map_err(|e| StoreError::from_index(e, path.as_str()))
    }

    fn resolve(&mut self, path: &VirtualPath) -> Result<(FileId, FileInfo), StoreError> {
        let id = self.lookup(path)?.ok_or_else(|| StoreError::NotFound {
            path: path.as_str().to_string(),
        })?;
        Ok((id, self.file_info(id, path)?))
    }

    fn resolve_file(&mut self, path: &VirtualPath) -> Result<(FileId, FileInfo), StoreError> {
        let (id, info) = self.resolve(path)?;
        if info.is_directory() {
            return Err(StoreError::NotAFile {
                path: path.as_str().to_string(),
            });
        }
        Ok((id, info))
    }

    /// Id of the directory that would hold `path`, and `path`'s final name.
    fn resolve_parent(&mut self, path: &VirtualPath) -> Result<(FileId, String), StoreError> {
        let (parent, name) = path
            .split()
            .ok_or_else(|| StoreError::invalid_operation("the root has no parent", path.as_str()))?;
        let (parent_id, parent_info) = self.resolve(&parent)?;
        if !parent_info.is_directory() {
            return Err(StoreError::NotADirectory {
                path: parent.as_str().to_string(),
            });
        }
        Ok((parent_id, name.to_string()))
    }

    /// Stamp an entry (usually a parent directory) with the current time.
    fn touch_entry(&mut self, id: FileId) {
        if let Err(error) = self.index.update_modification_time(id, SystemTime::now()) {
            warn!(%error, file_id = %id, "Failed to update modification time");
        }
    }
}

fn io_context(path: &VirtualPath, backing: &Path) -> OpContext {
    OpContext::new()
        .with_virtual_path(path.as_str())
        .with_backing_path(backing)
}

async fn remove_unlinked(backing: &Path) {
    match fs::remove_file(backing).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(error = %e, backing = %backing.display(), "Failed to remove unlinked backing file"),
    }
}

async fn backing_size(backing: &Path, path: &VirtualPath) -> Result<u64, StoreError> {
    match fs::metadata(backing).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::Corruption {
            reason: "backing file is missing".to_string(),
            context: io_context(path, backing),
        }),
        Err(e) => Err(StoreError::io(e, io_context(path, backing))),
    }
}

async fn set_backing_len(path: &VirtualPath, backing: &Path, length: u64) -> Result<(), StoreError> {
    let file = fs::OpenOptions::new()
        .write(true)
        .open(backing)
        .await
        .map_err(|e| StoreError::io(e, io_context(path, backing)))?;
    file.set_len(length)
        .await
        .map_err(|e| StoreError::io(e, io_context(path, backing)))
}

async fn metadata_for(store_dir: &Path, id: FileId, info: FileInfo, path: &VirtualPath) -> Result<EntryMetadata, StoreError> {
    let size = if info.is_directory() {
        0
    } else {
        backing_size(&info.backing_path(store_dir), path).await?
    };
    Ok(EntryMetadata {
        file_id: id,
        is_directory: info.is_directory(),
        name: info.name,
        size,
        modification_time: info.modification_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_path_format() {
        assert_eq!(data_path_for(0), "00/00000000");
        assert_eq!(data_path_for(42), "00/00000042");
        assert_eq!(data_path_for(199), "01/00000199");
        assert_eq!(data_path_for(123_456), "1234/00123456");
    }
}
