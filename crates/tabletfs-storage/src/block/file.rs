//! One file per block
//!
//! The top 16 bits of a block id name the data directory holding it; the
//! remaining 48 bits are random. A block lives at
//! `<data dir>/<b2>/<b3>/<id>`, where `b2` and `b3` are the first two bytes
//! of the random part in hex, keeping directories small.
//!
//! A block is written to `<id>.tmp` and renamed into place on close, so a
//! block file that exists is always complete.

use super::{BlockManager, BlockManagerOptions, CreateBlockOptions, ReadableBlock, WritableBlock};
use crate::data_dirs::{DataDir, DataDirManager};
use crate::env_util;
use crate::report::{Anomaly, FsReport};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabletfs_common::{BlockId, BlockManagerType, Error, IoResultExt, Result};
use tracing::{debug, info, warn};

const DIR_INDEX_SHIFT: u32 = 48;
const RANDOM_MASK: u64 = (1 << DIR_INDEX_SHIFT) - 1;
const MAX_ID_ATTEMPTS: usize = 16;

/// Physical location of a block
#[derive(Clone, Debug)]
struct BlockLocation {
    dir_index: usize,
    path: PathBuf,
}

impl BlockLocation {
    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(env_util::TMP_INFIX);
        PathBuf::from(name)
    }
}

fn id_for(dir_index: usize, random: u64) -> BlockId {
    BlockId::new(((dir_index as u64) << DIR_INDEX_SHIFT) | (random & RANDOM_MASK))
}

fn block_path(dir: &Path, id: BlockId) -> PathBuf {
    let hex = id.to_hex();
    dir.join(&hex[4..6]).join(&hex[6..8]).join(hex)
}

/// Remove the fan-out directories above `path` if they are empty
///
/// Failures are ignored; a directory another writer is using is not empty.
fn remove_empty_block_dirs(path: &Path) {
    let Some(leaf_dir) = path.parent() else {
        return;
    };
    if fs::remove_dir(leaf_dir).is_ok()
        && let Some(mid_dir) = leaf_dir.parent()
    {
        let _ = fs::remove_dir(mid_dir);
    }
}

/// Block manager storing each block in its own file
pub struct FileBlockManager {
    dd_manager: Arc<DataDirManager>,
    opts: BlockManagerOptions,
}

impl FileBlockManager {
    pub fn new(dd_manager: Arc<DataDirManager>, opts: BlockManagerOptions) -> Self {
        Self { dd_manager, opts }
    }

    fn locate(&self, id: BlockId) -> Option<BlockLocation> {
        let dir_index = usize::try_from(id.as_u64() >> DIR_INDEX_SHIFT).ok()?;
        let dir = self.dd_manager.dir(dir_index)?;
        Some(BlockLocation {
            dir_index,
            path: block_path(dir.dir(), id),
        })
    }

    fn locate_existing(&self, id: BlockId) -> Result<BlockLocation> {
        self.locate(id)
            .ok_or_else(|| Error::not_found(format!("block {id} not found")))
    }

    /// Create the two levels of subdirectories above a block file
    fn create_block_dirs(&self, path: &Path) -> Result<()> {
        let Some(leaf_dir) = path.parent() else {
            return Ok(());
        };
        let Some(mid_dir) = leaf_dir.parent() else {
            return Ok(());
        };
        for dir in [mid_dir, leaf_dir] {
            if env_util::create_dir_if_missing(dir)?
                && self.opts.sync
                && let Some(parent) = dir.parent()
            {
                env_util::sync_dir(parent)?;
            }
        }
        Ok(())
    }

    fn allocate(&self, dir: &DataDir) -> Result<FileWritableBlock> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = id_for(dir.index(), rand::random::<u64>());
            let location = BlockLocation {
                dir_index: dir.index(),
                path: block_path(dir.dir(), id),
            };
            self.create_block_dirs(&location.path)?;

            let tmp_path = location.tmp_path();
            if location.path.exists() {
                continue;
            }
            match OpenOptions::new().write(true).create_new(true).open(&tmp_path) {
                Ok(file) => {
                    return Ok(FileWritableBlock {
                        id,
                        location,
                        file: Some(file),
                        bytes_appended: 0,
                        sync: self.opts.sync,
                        dd_manager: Arc::clone(&self.dd_manager),
                    });
                }
                // NotFound: an aborting writer removed the empty fan-out
                // directory in between.
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::AlreadyExists | std::io::ErrorKind::NotFound
                    ) => {}
                Err(e) => return Err(Error::from_io_at("creating block", &tmp_path, e)),
            }
        }
        Err(Error::io(
            format!("allocating a block id in {}", dir.dir().display()),
            std::io::Error::other("too many id collisions"),
        ))
    }

    /// Walk one data directory, collecting block stats and temp files
    fn scan_dir(&self, dir: &DataDir, report: &mut FsReport) -> Result<()> {
        for l1 in env_util::list_dir_sorted(dir.dir())? {
            let mid_dir = dir.dir().join(&l1);
            if !mid_dir.is_dir() {
                continue;
            }
            for l2 in env_util::list_dir_sorted(&mid_dir)? {
                let leaf_dir = mid_dir.join(&l2);
                if !leaf_dir.is_dir() {
                    continue;
                }
                for name in env_util::list_dir_sorted(&leaf_dir)? {
                    let path = leaf_dir.join(&name);
                    if env_util::is_tmp_file_name(&name) {
                        let repaired = !self.opts.read_only
                            && match fs::remove_file(&path) {
                                Ok(()) => true,
                                Err(e) => {
                                    warn!("Failed to delete {}: {}", path.display(), e);
                                    false
                                }
                            };
                        report.anomalies.push(Anomaly::OrphanedTempFile { path, repaired });
                    } else if name.parse::<BlockId>().is_ok() {
                        let len = fs::metadata(&path).at_path("reading size of", &path)?.len();
                        report.stats.live_block_count += 1;
                        report.stats.live_block_bytes += len;
                    } else {
                        debug!("Ignoring unexpected file {}", path.display());
                    }
                }
            }
        }
        Ok(())
    }
}

impl BlockManager for FileBlockManager {
    fn open(&self) -> Result<FsReport> {
        let mut report = FsReport {
            data_dirs: self.dd_manager.data_dirs(),
            ..Default::default()
        };
        for dir in self.dd_manager.dirs() {
            let result = self.scan_dir(dir, &mut report);
            self.dd_manager.check_io(dir.index(), result)?;
        }
        info!(
            "Opened file block manager: {} blocks, {} bytes",
            report.stats.live_block_count, report.stats.live_block_bytes
        );
        Ok(report)
    }

    fn create_block(&self, opts: &CreateBlockOptions) -> Result<Box<dyn WritableBlock>> {
        if self.opts.read_only {
            return Err(super::read_only_error("create block"));
        }
        let dir = self.dd_manager.next_dir_for_block(opts.tablet_id.as_deref())?;
        let block = self.allocate(dir);
        let block = self.dd_manager.check_io(dir.index(), block)?;
        debug!("Creating block {} at {}", block.id, block.location.path.display());
        Ok(Box::new(block))
    }

    fn open_block(&self, id: BlockId) -> Result<Box<dyn ReadableBlock>> {
        let location = self.locate_existing(id)?;
        let file = File::open(&location.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(format!("block {id} not found"))
            } else {
                Error::from_io_at("opening block", &location.path, e)
            }
        });
        let file = self.dd_manager.check_io(location.dir_index, file)?;
        Ok(Box::new(FileReadableBlock {
            id,
            file,
            location,
            dd_manager: Arc::clone(&self.dd_manager),
        }))
    }

    fn delete_block(&self, id: BlockId) -> Result<()> {
        if self.opts.read_only {
            return Err(super::read_only_error("delete block"));
        }
        let location = self.locate_existing(id)?;
        match fs::remove_file(&location.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(format!("block {id} not found")));
            }
            Err(e) => {
                let err = Error::from_io_at("deleting block", &location.path, e);
                return self.dd_manager.check_io(location.dir_index, Err(err));
            }
        }
        if self.opts.sync
            && let Some(parent) = location.path.parent()
        {
            let synced = env_util::sync_dir(parent);
            self.dd_manager.check_io(location.dir_index, synced)?;
        }
        debug!("Deleted block {}", id);
        Ok(())
    }

    fn block_exists(&self, id: BlockId) -> bool {
        self.locate(id).is_some_and(|l| l.path.is_file())
    }

    fn all_block_ids(&self) -> Result<Vec<BlockId>> {
        let mut ids = Vec::new();
        for dir in self.dd_manager.dirs() {
            for l1 in env_util::list_dir_sorted(dir.dir())? {
                let mid_dir = dir.dir().join(l1);
                if !mid_dir.is_dir() {
                    continue;
                }
                for l2 in env_util::list_dir_sorted(&mid_dir)? {
                    let leaf_dir = mid_dir.join(l2);
                    if !leaf_dir.is_dir() {
                        continue;
                    }
                    ids.extend(
                        env_util::list_dir_sorted(&leaf_dir)?
                            .iter()
                            .filter_map(|name| name.parse::<BlockId>().ok()),
                    );
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn kind(&self) -> BlockManagerType {
        BlockManagerType::File
    }
}

struct FileWritableBlock {
    id: BlockId,
    location: BlockLocation,
    /// `None` once closed or aborted
    file: Option<File>,
    bytes_appended: u64,
    sync: bool,
    dd_manager: Arc<DataDirManager>,
}

impl FileWritableBlock {
    fn finish(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Err(Error::logic(format!("block {} already finished", self.id)));
        };
        let tmp_path = self.location.tmp_path();
        if self.sync {
            file.sync_all().at_path("syncing block", &tmp_path)?;
        }
        drop(file);
        fs::rename(&tmp_path, &self.location.path).at_path("renaming block", &tmp_path)?;
        if self.sync
            && let Some(parent) = self.location.path.parent()
        {
            env_util::sync_dir(parent)?;
        }
        Ok(())
    }

    fn remove_tmp(&mut self) -> Result<()> {
        self.file = None;
        let tmp_path = self.location.tmp_path();
        match fs::remove_file(&tmp_path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                return Err(Error::from_io_at("aborting block", &tmp_path, e));
            }
            _ => {}
        }
        remove_empty_block_dirs(&self.location.path);
        Ok(())
    }
}

impl WritableBlock for FileWritableBlock {
    fn id(&self) -> BlockId {
        self.id
    }

    fn append(&mut self, data: &[u8]) -> Result<()> {
        let tmp_path = self.location.tmp_path();
        let Some(file) = self.file.as_mut() else {
            return Err(Error::logic(format!("block {} already finished", self.id)));
        };
        let written = file.write_all(data).at_path("writing block", &tmp_path);
        self.dd_manager.check_io(self.location.dir_index, written)?;
        self.bytes_appended += data.len() as u64;
        Ok(())
    }

    fn bytes_appended(&self) -> u64 {
        self.bytes_appended
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        let finished = self.finish();
        if finished.is_err() {
            let _ = self.remove_tmp();
        }
        self.dd_manager.check_io(self.location.dir_index, finished)?;
        debug!("Closed block {} ({} bytes)", self.id, self.bytes_appended);
        Ok(())
    }

    fn abort(mut self: Box<Self>) -> Result<()> {
        let removed = self.remove_tmp();
        self.dd_manager.check_io(self.location.dir_index, removed)
    }
}

impl Drop for FileWritableBlock {
    fn drop(&mut self) {
        if self.file.is_some() {
            warn!("Block {} dropped without close or abort; discarding", self.id);
            let _ = self.remove_tmp();
        }
    }
}

struct FileReadableBlock {
    id: BlockId,
    file: File,
    location: BlockLocation,
    dd_manager: Arc<DataDirManager>,
}

impl ReadableBlock for FileReadableBlock {
    fn id(&self) -> BlockId {
        self.id
    }

    fn size(&self) -> Result<u64> {
        let metadata = self.file.metadata().at_path("reading size of", &self.location.path);
        Ok(self.dd_manager.check_io(self.location.dir_index, metadata)?.len())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let size = self.size()?;
        if offset.saturating_add(buf.len() as u64) > size {
            return Err(Error::logic(format!(
                "read of {} bytes at offset {} is past the end of block {} ({} bytes)",
                buf.len(),
                offset,
                self.id,
                size
            )));
        }
        let read = self
            .file
            .read_exact_at(buf, offset)
            .at_path("reading block", &self.location.path);
        self.dd_manager.check_io(self.location.dir_index, read)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util;
    use super::*;
    use tabletfs_common::ErrorKind;
    use tempfile::tempdir;

    fn write_block(bm: &FileBlockManager, data: &[u8]) -> BlockId {
        let mut block = bm.create_block(&CreateBlockOptions::default()).unwrap();
        block.append(data).unwrap();
        assert_eq!(block.bytes_appended(), data.len() as u64);
        let id = block.id();
        block.close().unwrap();
        id
    }

    #[test]
    fn test_write_and_read() {
        let base = tempdir().unwrap();
        let dd = test_util::data_dirs(&base, 2, BlockManagerType::File);
        let bm = FileBlockManager::new(Arc::clone(&dd), test_util::opts(false));
        bm.open().unwrap();

        let id = write_block(&bm, b"hello world");
        assert!(bm.block_exists(id));

        let block = bm.open_block(id).unwrap();
        assert_eq!(block.size().unwrap(), 11);
        assert_eq!(&block.read_all().unwrap()[..], b"hello world");
        let mut buf = [0u8; 5];
        block.read_at(6, &mut buf).unwrap();
        assert_eq!(&buf, b"world");
        assert_eq!(block.read_at(8, &mut buf).unwrap_err().kind(), ErrorKind::LogicError);

        let dir_index = usize::try_from(id.as_u64() >> DIR_INDEX_SHIFT).unwrap();
        assert!(block_path(dd.dirs()[dir_index].dir(), id).is_file());
    }

    #[test]
    fn test_abort_and_drop() {
        let base = tempdir().unwrap();
        let dd = test_util::data_dirs(&base, 1, BlockManagerType::File);
        let bm = FileBlockManager::new(Arc::clone(&dd), test_util::opts(false));

        let mut block = bm.create_block(&CreateBlockOptions::default()).unwrap();
        block.append(b"doomed").unwrap();
        let id = block.id();
        block.abort().unwrap();
        assert!(!bm.block_exists(id));

        let block = bm.create_block(&CreateBlockOptions::default()).unwrap();
        let id = block.id();
        drop(block);
        assert!(!bm.block_exists(id));

        let report = bm.open().unwrap();
        assert!(report.is_clean());
        assert_eq!(report.stats.live_block_count, 0);

        // No empty fan-out directories are left behind.
        assert_eq!(
            env_util::list_dir_sorted(dd.dirs()[0].dir()).unwrap(),
            vec![crate::data_dirs::PATH_INSTANCE_FILE_NAME.to_string()]
        );
    }

    #[test]
    fn test_abort_keeps_shared_fan_out_dirs() {
        let base = tempdir().unwrap();
        let dd = test_util::data_dirs(&base, 1, BlockManagerType::File);
        let bm = FileBlockManager::new(Arc::clone(&dd), test_util::opts(false));
        let kept = write_block(&bm, b"kept");

        // An aborted block in the same leaf directory as a live one.
        let kept_path = block_path(dd.dirs()[0].dir(), kept);
        let sibling = BlockLocation {
            dir_index: 0,
            path: kept_path.with_file_name(id_for(0, kept.as_u64() ^ 1).to_hex()),
        };
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(sibling.tmp_path())
            .unwrap();
        let block = FileWritableBlock {
            id: id_for(0, kept.as_u64() ^ 1),
            location: sibling,
            file: Some(file),
            bytes_appended: 0,
            sync: false,
            dd_manager: Arc::clone(&dd),
        };
        Box::new(block).abort().unwrap();

        assert!(kept_path.is_file());
        assert_eq!(&bm.open_block(kept).unwrap().read_all().unwrap()[..], b"kept");
    }

    #[test]
    fn test_delete() {
        let base = tempdir().unwrap();
        let dd = test_util::data_dirs(&base, 2, BlockManagerType::File);
        let bm = FileBlockManager::new(dd, test_util::opts(false));

        let id = write_block(&bm, b"data");
        bm.delete_block(id).unwrap();
        assert!(!bm.block_exists(id));
        assert!(bm.open_block(id).err().unwrap().is_not_found());
        assert!(bm.delete_block(id).unwrap_err().is_not_found());

        // An id naming a directory that does not exist.
        let bogus = BlockId::new(u64::MAX);
        assert!(!bm.block_exists(bogus));
        assert!(bm.open_block(bogus).err().unwrap().is_not_found());
    }

    #[test]
    fn test_read_only() {
        let base = tempdir().unwrap();
        let dd = test_util::data_dirs(&base, 1, BlockManagerType::File);
        let bm = FileBlockManager::new(Arc::clone(&dd), test_util::opts(false));
        let id = write_block(&bm, b"data");

        let ro = FileBlockManager::new(
            test_util::reopen(&dd, BlockManagerType::File, true),
            test_util::opts(true),
        );
        ro.open().unwrap();
        let err = ro.create_block(&CreateBlockOptions::default()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::LogicError);
        assert_eq!(ro.delete_block(id).unwrap_err().kind(), ErrorKind::LogicError);
        assert_eq!(&ro.open_block(id).unwrap().read_all().unwrap()[..], b"data");
    }

    #[test]
    fn test_open_reports_orphaned_tmp_files() {
        let base = tempdir().unwrap();
        let dd = test_util::data_dirs(&base, 1, BlockManagerType::File);
        let bm = FileBlockManager::new(Arc::clone(&dd), test_util::opts(false));
        let id = write_block(&bm, b"abc");
        let ids = bm.all_block_ids().unwrap();
        assert_eq!(ids, vec![id]);

        // Simulate a crash in the middle of a write.
        let mut block = bm.create_block(&CreateBlockOptions::default()).unwrap();
        block.append(b"partial").unwrap();
        std::mem::forget(block);

        let ro = FileBlockManager::new(
            test_util::reopen(&dd, BlockManagerType::File, true),
            test_util::opts(true),
        );
        let report = ro.open().unwrap();
        assert_eq!(report.anomalies.len(), 1);
        assert!(!report.anomalies[0].repaired());

        let report = bm.open().unwrap();
        assert_eq!(report.stats.live_block_count, 1);
        assert_eq!(report.stats.live_block_bytes, 3);
        assert_eq!(report.anomalies.len(), 1);
        assert!(report.anomalies[0].repaired());

        assert!(bm.open().unwrap().is_clean());
    }

    #[test]
    fn test_tablet_blocks_share_a_dir() {
        let base = tempdir().unwrap();
        let dd = test_util::data_dirs(&base, 3, BlockManagerType::File);
        let bm = FileBlockManager::new(dd, test_util::opts(false));

        let opts = CreateBlockOptions::for_tablet("tablet-1");
        let dirs: std::collections::BTreeSet<u64> = (0..4)
            .map(|_| {
                let block = bm.create_block(&opts).unwrap();
                let id = block.id();
                block.close().unwrap();
                id.as_u64() >> DIR_INDEX_SHIFT
            })
            .collect();
        assert_eq!(dirs.len(), 1);
    }
}
