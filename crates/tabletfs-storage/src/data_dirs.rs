//! Data directory pool
//!
//! Every canonical data root holds one data directory, `<root>/data`. Each
//! directory carries a small record naming its own uuid, the uuids of every
//! directory in the pool and the block manager that owns it. The records
//! tie the directories together: a directory moved in from another node, or
//! a pool opened with a different block manager, is detected at open.
//!
//! [`DataDirManager`] is the only authority on which directories may
//! receive new blocks. Directories found failing are marked failed and
//! excluded from placement for the rest of the process lifetime.

use crate::container;
use crate::env_util;
use crate::error_manager::FsErrorManager;
use crate::layout::DirectoryLayout;
use crate::rollback::RollbackLedger;
use crate::roots::CanonicalRoots;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tabletfs_common::{BlockManagerType, Error, Result};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Name of the per-directory record
pub const PATH_INSTANCE_FILE_NAME: &str = "block_manager_instance";

/// Magic bytes of the per-directory record
pub const PATH_INSTANCE_MAGIC: [u8; 8] = *b"TFSPATH\0";

/// Record stored in every data directory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathInstanceMetadata {
    /// This directory's uuid
    pub uuid: String,
    /// Uuids of every directory in the pool, including this one; the
    /// position of `uuid` here is the directory's index
    pub all_uuids: Vec<String>,
    /// Block manager that owns the pool
    pub block_manager_type: BlockManagerType,
}

#[derive(Clone, Copy, Debug)]
pub struct DataDirManagerOptions {
    pub read_only: bool,
    pub block_manager_type: BlockManagerType,
    /// Fsync records and the directories holding them
    pub sync: bool,
    /// Index of the directory whose record fails to be written
    #[cfg(test)]
    pub fail_pool_record: Option<usize>,
}

/// One data directory of the pool
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataDir {
    index: usize,
    root: PathBuf,
    dir: PathBuf,
    uuid: String,
}

impl DataDir {
    /// Position of this directory's uuid in the pool record
    ///
    /// Stable across renames and reordering of the data roots.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Data root this directory lives under
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the blocks
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    fn instance_path(&self) -> PathBuf {
        self.dir.join(PATH_INSTANCE_FILE_NAME)
    }
}

/// Manager of the data directory pool
pub struct DataDirManager {
    dirs: Vec<DataDir>,
    failed: RwLock<BTreeSet<usize>>,
    next: AtomicUsize,
    error_manager: Arc<FsErrorManager>,
    opts: DataDirManagerOptions,
}

impl DataDirManager {
    /// Lay out a fresh pool under the canonical data roots
    ///
    /// Every directory and record created is recorded in `ledger`.
    pub fn create_new(
        roots: &CanonicalRoots,
        opts: DataDirManagerOptions,
        error_manager: Arc<FsErrorManager>,
        ledger: &mut RollbackLedger,
    ) -> Result<Self> {
        if opts.read_only {
            return Err(Error::logic("cannot create data directories in read-only mode"));
        }

        let uuids: Vec<String> = roots
            .data_roots()
            .iter()
            .map(|_| Uuid::new_v4().simple().to_string())
            .collect();

        let mut dirs = Vec::with_capacity(uuids.len());
        for (index, (root, uuid)) in roots.data_roots().iter().zip(&uuids).enumerate() {
            let data_dir = DataDir {
                index,
                root: root.clone(),
                dir: DirectoryLayout::data_dir(root),
                uuid: uuid.clone(),
            };

            if env_util::create_dir_if_missing(&data_dir.dir)? {
                ledger.record_dir(&data_dir.dir);
                if opts.sync {
                    env_util::sync_dir(root)?;
                }
            } else if !env_util::is_dir_empty(&data_dir.dir)? {
                return Err(Error::already_exists(format!(
                    "data directory {} is not empty",
                    data_dir.dir.display()
                )));
            }

            let record = PathInstanceMetadata {
                uuid: uuid.clone(),
                all_uuids: uuids.clone(),
                block_manager_type: opts.block_manager_type,
            };
            #[cfg(test)]
            if opts.fail_pool_record == Some(index) {
                return Err(Error::io(
                    format!("writing {}", data_dir.instance_path().display()),
                    std::io::Error::other("injected failure"),
                ));
            }
            let path = data_dir.instance_path();
            ledger.record_file(&path);
            container::write_to_path(&path, &PATH_INSTANCE_MAGIC, &record, opts.sync)?;
            debug!("Created data directory {} ({})", data_dir.dir.display(), uuid);

            dirs.push(data_dir);
        }

        info!("Created {} data directories", dirs.len());
        Ok(Self::from_dirs(dirs, opts, error_manager))
    }

    /// Open the pool under the canonical data roots, checking that the
    /// directories belong together
    pub fn open_existing(
        roots: &CanonicalRoots,
        opts: DataDirManagerOptions,
        error_manager: Arc<FsErrorManager>,
    ) -> Result<Self> {
        let mut dirs = Vec::with_capacity(roots.data_roots().len());
        let mut expected: Option<(Vec<String>, PathBuf)> = None;

        for root in roots.data_roots() {
            let dir = DirectoryLayout::data_dir(root);
            let path = dir.join(PATH_INSTANCE_FILE_NAME);
            let record: PathInstanceMetadata =
                container::read_from_path(&path, &PATH_INSTANCE_MAGIC)
                    .map_err(|e| e.prepend("could not open data directory"))?;

            if record.block_manager_type != opts.block_manager_type {
                return Err(Error::invalid_config(format!(
                    "data directory {} belongs to block manager '{}', but '{}' is configured",
                    dir.display(),
                    record.block_manager_type,
                    opts.block_manager_type
                )));
            }

            let Some(index) = record.all_uuids.iter().position(|u| *u == record.uuid) else {
                return Err(Error::corruption(format!(
                    "data directory {} has uuid {} which is not in its own pool {:?}",
                    dir.display(),
                    record.uuid,
                    record.all_uuids
                )));
            };
            if let Some((pool, first)) = &expected {
                if *pool != record.all_uuids {
                    return Err(Error::corruption(format!(
                        "data directories {} and {} disagree on pool membership: {:?} vs. {:?}",
                        first.display(),
                        dir.display(),
                        pool,
                        record.all_uuids
                    )));
                }
            } else {
                expected = Some((record.all_uuids.clone(), dir.clone()));
            }

            dirs.push(DataDir {
                index,
                root: root.clone(),
                dir,
                uuid: record.uuid,
            });
        }

        if let Some((pool, _)) = &expected
            && pool.len() != dirs.len()
        {
            return Err(Error::corruption(format!(
                "data directory pool has {} members but {} data roots are configured",
                pool.len(),
                dirs.len()
            )));
        }
        let distinct: BTreeSet<&str> = dirs.iter().map(|d| d.uuid.as_str()).collect();
        if distinct.len() != dirs.len() {
            return Err(Error::corruption(
                "two data directories claim the same uuid",
            ));
        }

        // Indices are now a permutation of 0..n; dirs[i] has index i.
        dirs.sort_by_key(|d| d.index);

        info!("Opened {} data directories", dirs.len());
        Ok(Self::from_dirs(dirs, opts, error_manager))
    }

    fn from_dirs(
        dirs: Vec<DataDir>,
        opts: DataDirManagerOptions,
        error_manager: Arc<FsErrorManager>,
    ) -> Self {
        Self {
            dirs,
            failed: RwLock::new(BTreeSet::new()),
            next: AtomicUsize::new(0),
            error_manager,
            opts,
        }
    }

    /// All data directories, by index
    #[must_use]
    pub fn dirs(&self) -> &[DataDir] {
        &self.dirs
    }

    /// Paths of all data directories
    #[must_use]
    pub fn data_dirs(&self) -> Vec<PathBuf> {
        self.dirs.iter().map(|d| d.dir.clone()).collect()
    }

    /// Data directories not marked failed
    #[must_use]
    pub fn healthy_dirs(&self) -> Vec<&DataDir> {
        let failed = self.failed.read();
        self.dirs
            .iter()
            .filter(|d| !failed.contains(&d.index))
            .collect()
    }

    #[must_use]
    pub fn dir(&self, index: usize) -> Option<&DataDir> {
        self.dirs.get(index)
    }

    #[must_use]
    pub fn is_dir_failed(&self, index: usize) -> bool {
        self.failed.read().contains(&index)
    }

    #[must_use]
    pub const fn options(&self) -> &DataDirManagerOptions {
        &self.opts
    }

    /// Mark a directory failed
    ///
    /// The error notification callback fires the first time a given
    /// directory is marked. Returns whether this call marked it.
    pub fn mark_dir_failed(&self, index: usize, reason: &str) -> bool {
        let Some(dir) = self.dirs.get(index) else {
            return false;
        };
        let newly_failed = self.failed.write().insert(index);
        if newly_failed {
            error!("Data directory {} failed: {}", dir.dir.display(), reason);
            self.error_manager.run_error_notification_cb(&dir.dir);
        }
        newly_failed
    }

    /// Mark the directory failed if `result` is a disk failure
    pub fn check_io<T>(&self, index: usize, result: Result<T>) -> Result<T> {
        if let Err(e) = &result
            && e.is_disk_failure()
        {
            self.mark_dir_failed(index, &e.to_string());
        }
        result
    }

    /// Pick the directory for a new block
    ///
    /// Blocks of the same tablet land in the same directory while it is
    /// healthy; without a tablet, directories are used round-robin.
    pub fn next_dir_for_block(&self, tablet_id: Option<&str>) -> Result<&DataDir> {
        let healthy = self.healthy_dirs();
        if healthy.is_empty() {
            return Err(Error::io(
                "selecting a data directory for a new block",
                std::io::Error::other("no healthy data directories available"),
            ));
        }
        let slot = match tablet_id {
            Some(id) => crc32c::crc32c(id.as_bytes()) as usize,
            None => self.next.fetch_add(1, Ordering::Relaxed),
        };
        Ok(healthy[slot % healthy.len()])
    }
}

impl std::fmt::Debug for DataDirManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataDirManager")
            .field("dirs", &self.dirs)
            .field("failed", &*self.failed.read())
            .finish_non_exhaustive()
    }
}
