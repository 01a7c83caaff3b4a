//! Log-structured block storage
//!
//! Blocks are packed into containers. A container is a pair of files in a
//! data directory:
//!
//! - `<container-id>.data`: block bytes, each block starting on a 4 KiB
//!   boundary
//! - `<container-id>.metadata`: append-only log of records, replayed at
//!   open to rebuild the block index
//!
//! Record format:
//! ```text
//! +-------+--------+---------+--------+
//! | Magic | Length | Payload | CRC32C |
//! | 4B    | 4B     | var     | 4B     |
//! +-------+--------+---------+--------+
//! ```
//!
//! A writable block holds its container exclusively, so each container has
//! at most one writer. Deleted blocks leave a hole in the data file, punched
//! once the last reader of the block is gone.

use super::{BlockManager, BlockManagerOptions, CreateBlockOptions, ReadableBlock, WritableBlock};
use crate::data_dirs::{DataDir, DataDirManager};
use crate::env_util;
use crate::report::{Anomaly, FsReport};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tabletfs_common::{BlockId, BlockManagerType, Error, IoResultExt, Result};
use tracing::{debug, info, warn};

/// Magic number of a metadata record
const RECORD_MAGIC: u32 = 0x4C42_4654; // "TFBL"

/// Record header size (magic + length)
const RECORD_HEADER_SIZE: usize = 8;

/// Block alignment within a data file
const ALIGNMENT: u64 = 4096;

const DATA_FILE_SUFFIX: &str = ".data";
const METADATA_FILE_SUFFIX: &str = ".metadata";

/// Entry of a container's metadata log
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum ContainerRecord {
    Create {
        block_id: BlockId,
        offset: u64,
        length: u64,
    },
    Delete {
        block_id: BlockId,
    },
}

impl ContainerRecord {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|e| Error::corruption(format!("failed to serialize container record: {e}")))?;
        let len = u32::try_from(payload.len())
            .map_err(|_| Error::corruption("container record too large"))?;

        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len() + 4);
        buf.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&payload);
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }
}

/// Records read from a metadata file
#[derive(Debug, Default)]
struct ReplayedLog {
    records: Vec<ContainerRecord>,
    /// Length of the intact prefix
    valid_len: u64,
    /// A torn record follows the intact prefix
    torn: bool,
}

/// Parse a metadata log
///
/// A record that runs past the end of the data, or whose checksum fails
/// while being the last thing in the file, is a torn trailing write. Any
/// other malformed record is corruption.
fn parse_records(path: &Path, data: &[u8]) -> Result<ReplayedLog> {
    let mut log = ReplayedLog::default();
    let mut pos = 0usize;

    while pos < data.len() {
        let rest = &data[pos..];
        if rest.len() < RECORD_HEADER_SIZE + 4 {
            log.torn = true;
            break;
        }
        let magic = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
        if magic != RECORD_MAGIC {
            return Err(Error::corruption(format!(
                "{}: invalid record magic at offset {pos}",
                path.display()
            )));
        }
        let len = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let end = RECORD_HEADER_SIZE + len;
        if rest.len() < end + 4 {
            log.torn = true;
            break;
        }

        let stored_crc = u32::from_le_bytes([rest[end], rest[end + 1], rest[end + 2], rest[end + 3]]);
        let computed_crc = crc32c::crc32c(&rest[..end]);
        if stored_crc != computed_crc {
            if rest.len() == end + 4 {
                log.torn = true;
                break;
            }
            return Err(Error::corruption(format!(
                "{}: record checksum mismatch at offset {pos}: computed={computed_crc:08x}, stored={stored_crc:08x}",
                path.display()
            )));
        }

        let record = bincode::deserialize(&rest[RECORD_HEADER_SIZE..end]).map_err(|e| {
            Error::corruption(format!(
                "{}: failed to parse record at offset {pos}: {e}",
                path.display()
            ))
        })?;
        log.records.push(record);
        pos += end + 4;
    }

    log.valid_len = pos as u64;
    Ok(log)
}

#[inline]
const fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Punch a hole over a deleted block, keeping the file size
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn punch_hole(file: &File, offset: u64, len: u64) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let (Ok(offset), Ok(len)) = (libc::off_t::try_from(offset), libc::off_t::try_from(len)) else {
        return Err(std::io::Error::from(std::io::ErrorKind::InvalidInput));
    };
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let ret = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset,
            len,
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
fn punch_hole(_file: &File, _offset: u64, _len: u64) -> std::io::Result<()> {
    Ok(())
}

/// A data file and its metadata log
struct Container {
    id: String,
    dir_index: usize,
    data_path: PathBuf,
    metadata_path: PathBuf,
    data_file: File,
    metadata_file: Mutex<File>,
    /// Offset of the next block; only advanced by the exclusive writer
    next_offset: AtomicU64,
    full: AtomicBool,
    /// Set when a failed append could not be undone; no more records
    /// may be appended
    dead: AtomicBool,
    #[cfg(test)]
    fail_next_append: AtomicBool,
}

impl Container {
    fn paths(dir: &Path, id: &str) -> (PathBuf, PathBuf) {
        (
            dir.join(format!("{id}{DATA_FILE_SUFFIX}")),
            dir.join(format!("{id}{METADATA_FILE_SUFFIX}")),
        )
    }

    fn create(dir: &DataDir, sync: bool) -> Result<Self> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let (data_path, metadata_path) = Self::paths(dir.dir(), &id);

        let open_new = |path: &Path| {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(path)
                .at_path("creating container file", path)
        };
        let data_file = open_new(&data_path)?;
        let metadata_file = match open_new(&metadata_path) {
            Ok(f) => f,
            Err(e) => {
                let _ = fs::remove_file(&data_path);
                return Err(e);
            }
        };
        if sync {
            env_util::sync_dir(dir.dir())?;
        }
        debug!("Created container {} in {}", id, dir.dir().display());

        Ok(Self {
            id,
            dir_index: dir.index(),
            data_path,
            metadata_path,
            data_file,
            metadata_file: Mutex::new(metadata_file),
            next_offset: AtomicU64::new(0),
            full: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            #[cfg(test)]
            fail_next_append: AtomicBool::new(false),
        })
    }

    /// Append a record to the metadata log
    ///
    /// On failure the log is cut back to its previous length, so a partial
    /// record never ends up in front of later ones. If that fails too the
    /// container is marked dead.
    fn append_record(&self, record: &ContainerRecord, sync: bool) -> Result<()> {
        let buf = record.to_bytes()?;
        let mut file = self.metadata_file.lock();
        if self.dead.load(Ordering::Acquire) {
            return Err(Error::io(
                format!("appending record to {}", self.metadata_path.display()),
                std::io::Error::other("metadata log is no longer writable"),
            ));
        }
        let start = file
            .stream_position()
            .at_path("seeking", &self.metadata_path)?;

        let appended = self.write_record(&mut file, &buf, sync);
        if appended.is_err() {
            let restored = file
                .set_len(start)
                .and_then(|()| file.seek(SeekFrom::Start(start)));
            if let Err(e) = restored {
                warn!(
                    "Failed to cut {} back to {} bytes, retiring the container: {}",
                    self.metadata_path.display(),
                    start,
                    e
                );
                self.dead.store(true, Ordering::Release);
            }
        }
        appended
    }

    fn write_record(&self, file: &mut File, buf: &[u8], sync: bool) -> Result<()> {
        #[cfg(test)]
        if self.fail_next_append.swap(false, Ordering::AcqRel) {
            file.write_all(&buf[..buf.len() / 2])
                .at_path("appending record to", &self.metadata_path)?;
            return Err(Error::io(
                format!("appending record to {}", self.metadata_path.display()),
                std::io::Error::other("injected write failure"),
            ));
        }
        file.write_all(buf)
            .at_path("appending record to", &self.metadata_path)?;
        if sync {
            file.sync_data().at_path("syncing", &self.metadata_path)?;
        }
        Ok(())
    }

    fn is_full(&self) -> bool {
        self.full.load(Ordering::Acquire)
    }
}

/// A live block in a container
struct LogBlock {
    id: BlockId,
    container: Arc<Container>,
    offset: u64,
    length: u64,
    deleted: AtomicBool,
}

impl Drop for LogBlock {
    fn drop(&mut self) {
        if !self.deleted.load(Ordering::Acquire) || self.length == 0 {
            return;
        }
        if let Err(e) = punch_hole(&self.container.data_file, self.offset, self.length) {
            warn!(
                "Failed to punch hole for deleted block {} in {}: {}",
                self.id,
                self.container.data_path.display(),
                e
            );
        }
    }
}

/// State rebuilt while replaying containers
#[derive(Default)]
struct Replay {
    live: HashMap<BlockId, Arc<LogBlock>>,
    containers: Vec<Arc<Container>>,
    /// Highest id of any replayed create, deleted blocks included
    max_block_id: Option<u64>,
}

struct Inner {
    dd_manager: Arc<DataDirManager>,
    opts: BlockManagerOptions,
    blocks: RwLock<HashMap<BlockId, Arc<LogBlock>>>,
    /// Containers accepting new blocks, not currently held by a writer
    available: Mutex<VecDeque<Arc<Container>>>,
    next_block_id: AtomicU64,
}

impl Inner {
    fn check_io<T>(&self, container: &Container, result: Result<T>) -> Result<T> {
        self.dd_manager.check_io(container.dir_index, result)
    }

    /// Take an available container in `dir`, or create one
    fn claim_container(&self, dir: &DataDir) -> Result<Arc<Container>> {
        {
            let mut available = self.available.lock();
            if let Some(pos) = available
                .iter()
                .position(|c| c.dir_index == dir.index() && !c.is_full())
                && let Some(container) = available.remove(pos)
            {
                return Ok(container);
            }
        }
        let created = Container::create(dir, self.opts.sync);
        Ok(Arc::new(self.dd_manager.check_io(dir.index(), created)?))
    }

    /// Put a container back into the pool unless it is full
    fn release_container(&self, container: Arc<Container>) {
        if container.next_offset.load(Ordering::Acquire) >= self.opts.log_container_max_size {
            container.full.store(true, Ordering::Release);
            info!("Container {} is full", container.data_path.display());
            return;
        }
        self.available.lock().push_back(container);
    }

    /// Replay one container into `replay`
    fn load_container(
        &self,
        dir: &DataDir,
        id: &str,
        replay: &mut Replay,
        report: &mut FsReport,
    ) -> Result<()> {
        let read_only = self.opts.read_only;
        let (data_path, metadata_path) = Container::paths(dir.dir(), id);
        let metadata = fs::read(&metadata_path).at_path("reading", &metadata_path)?;
        let log = parse_records(&metadata_path, &metadata)?;

        if log.records.is_empty() {
            // Crashed before the first block was committed.
            let repaired = !read_only && remove_container_files(&data_path, &metadata_path);
            report.anomalies.push(Anomaly::IncompleteContainer {
                path: metadata_path,
                repaired,
            });
            return Ok(());
        }

        let data_file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&data_path)
            .at_path("opening", &data_path)?;
        let metadata_file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&metadata_path)
            .at_path("opening", &metadata_path)?;

        if log.torn {
            let repaired = !read_only
                && match metadata_file.set_len(log.valid_len) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Failed to truncate {}: {}", metadata_path.display(), e);
                        false
                    }
                };
            report.anomalies.push(Anomaly::PartialRecord {
                container: metadata_path.clone(),
                offset: log.valid_len,
                repaired,
            });
        }
        let mut metadata_file = metadata_file;
        if !read_only {
            // New records go after the intact prefix.
            metadata_file
                .seek(SeekFrom::End(0))
                .at_path("seeking", &metadata_path)?;
        }

        let data_len = data_file.metadata().at_path("reading size of", &data_path)?.len();
        let mut extents: BTreeMap<BlockId, (u64, u64)> = BTreeMap::new();
        let mut deleted = Vec::new();
        for record in log.records {
            match record {
                ContainerRecord::Create {
                    block_id,
                    offset,
                    length,
                } => {
                    replay.max_block_id = replay.max_block_id.max(Some(block_id.as_u64()));
                    if extents.insert(block_id, (offset, length)).is_some() {
                        return Err(Error::corruption(format!(
                            "{}: block {block_id} created twice",
                            metadata_path.display()
                        )));
                    }
                }
                ContainerRecord::Delete { block_id } => {
                    let Some(extent) = extents.remove(&block_id) else {
                        return Err(Error::corruption(format!(
                            "{}: delete of unknown block {block_id}",
                            metadata_path.display()
                        )));
                    };
                    deleted.push(extent);
                }
            }
        }

        // Holes of blocks deleted before a crash were never punched.
        if !read_only {
            for (offset, length) in deleted {
                if length == 0 || offset >= data_len {
                    continue;
                }
                if let Err(e) = punch_hole(&data_file, offset, length.min(data_len - offset)) {
                    warn!("Failed to punch hole in {}: {}", data_path.display(), e);
                }
            }
        }

        let container = Arc::new(Container {
            id: id.to_string(),
            dir_index: dir.index(),
            data_path,
            metadata_path,
            data_file,
            metadata_file: Mutex::new(metadata_file),
            next_offset: AtomicU64::new(align_up(data_len, ALIGNMENT)),
            full: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            #[cfg(test)]
            fail_next_append: AtomicBool::new(false),
        });

        for (block_id, (offset, length)) in extents {
            if offset.saturating_add(length) > data_len {
                // New blocks would land on the lost extent.
                container.full.store(true, Ordering::Release);
                let repaired = !read_only
                    && match container
                        .append_record(&ContainerRecord::Delete { block_id }, self.opts.sync)
                    {
                        Ok(()) => true,
                        Err(e) => {
                            warn!("Failed to drop missing block {}: {}", block_id, e);
                            false
                        }
                    };
                report.anomalies.push(Anomaly::MissingBlockData {
                    container: container.data_path.clone(),
                    block_id,
                    repaired,
                });
                continue;
            }
            let block = Arc::new(LogBlock {
                id: block_id,
                container: Arc::clone(&container),
                offset,
                length,
                deleted: AtomicBool::new(false),
            });
            if replay.live.insert(block_id, block).is_some() {
                return Err(Error::corruption(format!(
                    "block {block_id} found in more than one container (last seen in {})",
                    container.metadata_path.display()
                )));
            }
            report.stats.live_block_count += 1;
            report.stats.live_block_bytes += length;
        }

        report.stats.container_count += 1;
        replay.containers.push(container);
        Ok(())
    }

    fn load_dir(&self, dir: &DataDir, replay: &mut Replay, report: &mut FsReport) -> Result<()> {
        let mut data_ids = BTreeSet::new();
        let mut metadata_ids = BTreeSet::new();
        for name in env_util::list_dir_sorted(dir.dir())? {
            if let Some(id) = name.strip_suffix(DATA_FILE_SUFFIX) {
                data_ids.insert(id.to_string());
            } else if let Some(id) = name.strip_suffix(METADATA_FILE_SUFFIX) {
                metadata_ids.insert(id.to_string());
            }
        }

        for id in &data_ids {
            if !metadata_ids.contains(id) {
                let path = dir.dir().join(format!("{id}{DATA_FILE_SUFFIX}"));
                let repaired = !self.opts.read_only && remove_container_files(&path, Path::new(""));
                report.anomalies.push(Anomaly::IncompleteContainer { path, repaired });
            }
        }
        for id in &metadata_ids {
            if !data_ids.contains(id) {
                let path = dir.dir().join(format!("{id}{METADATA_FILE_SUFFIX}"));
                let repaired = !self.opts.read_only && remove_container_files(Path::new(""), &path);
                report.anomalies.push(Anomaly::IncompleteContainer { path, repaired });
                continue;
            }
            self.load_container(dir, id, replay, report)?;
        }
        Ok(())
    }
}

/// Remove whichever of the two container files exist; empty paths are skipped
fn remove_container_files(data_path: &Path, metadata_path: &Path) -> bool {
    let mut ok = true;
    for path in [data_path, metadata_path] {
        if path.as_os_str().is_empty() {
            continue;
        }
        match fs::remove_file(path) {
            Ok(()) => info!("Deleted incomplete container file {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Failed to delete {}: {}", path.display(), e);
                ok = false;
            }
        }
    }
    ok
}

/// Block manager packing blocks into container files
pub struct LogBlockManager {
    inner: Arc<Inner>,
}

impl LogBlockManager {
    pub fn new(dd_manager: Arc<DataDirManager>, opts: BlockManagerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                dd_manager,
                opts,
                blocks: RwLock::new(HashMap::new()),
                available: Mutex::new(VecDeque::new()),
                next_block_id: AtomicU64::new(0),
            }),
        }
    }
}

impl BlockManager for LogBlockManager {
    fn open(&self) -> Result<FsReport> {
        let inner = &self.inner;
        let mut report = FsReport {
            data_dirs: inner.dd_manager.data_dirs(),
            ..Default::default()
        };
        let mut replay = Replay::default();

        for dir in inner.dd_manager.dirs() {
            let result = inner.load_dir(dir, &mut replay, &mut report);
            inner.dd_manager.check_io(dir.index(), result)?;
        }

        // Ids of deleted blocks are never handed out again.
        let next_id = replay
            .max_block_id
            .map_or_else(|| rand::random::<u64>() >> 16, |max| max + 1);
        inner.next_block_id.store(next_id, Ordering::Release);

        let mut available = VecDeque::new();
        for container in replay.containers {
            if container.is_full()
                || container.next_offset.load(Ordering::Acquire) >= inner.opts.log_container_max_size
            {
                container.full.store(true, Ordering::Release);
                report.stats.full_container_count += 1;
            } else if !inner.opts.read_only {
                available.push_back(container);
            }
        }
        *inner.available.lock() = available;
        *inner.blocks.write() = replay.live;

        info!(
            "Opened log block manager: {} blocks, {} bytes in {} containers ({} full)",
            report.stats.live_block_count,
            report.stats.live_block_bytes,
            report.stats.container_count,
            report.stats.full_container_count
        );
        Ok(report)
    }

    fn create_block(&self, opts: &CreateBlockOptions) -> Result<Box<dyn WritableBlock>> {
        let inner = &self.inner;
        if inner.opts.read_only {
            return Err(super::read_only_error("create block"));
        }
        let dir = inner.dd_manager.next_dir_for_block(opts.tablet_id.as_deref())?;
        let container = inner.claim_container(dir)?;
        let id = BlockId::new(inner.next_block_id.fetch_add(1, Ordering::AcqRel));
        let offset = container.next_offset.load(Ordering::Acquire);
        debug!("Creating block {} in container {} at offset {}", id, container.id, offset);

        Ok(Box::new(LogWritableBlock {
            inner: Arc::clone(inner),
            container: Some(container),
            id,
            offset,
            bytes_appended: 0,
        }))
    }

    fn open_block(&self, id: BlockId) -> Result<Box<dyn ReadableBlock>> {
        let block = self
            .inner
            .blocks
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("block {id} not found")))?;
        Ok(Box::new(LogReadableBlock {
            inner: Arc::clone(&self.inner),
            block,
        }))
    }

    fn delete_block(&self, id: BlockId) -> Result<()> {
        let inner = &self.inner;
        if inner.opts.read_only {
            return Err(super::read_only_error("delete block"));
        }
        let block = inner
            .blocks
            .write()
            .remove(&id)
            .ok_or_else(|| Error::not_found(format!("block {id} not found")))?;

        let record = ContainerRecord::Delete { block_id: id };
        if let Err(e) = block.container.append_record(&record, inner.opts.sync) {
            let container = Arc::clone(&block.container);
            inner.blocks.write().insert(id, block);
            return inner.check_io(&container, Err(e));
        }
        block.deleted.store(true, Ordering::Release);
        debug!("Deleted block {}", id);
        Ok(())
    }

    fn block_exists(&self, id: BlockId) -> bool {
        self.inner.blocks.read().contains_key(&id)
    }

    fn all_block_ids(&self) -> Result<Vec<BlockId>> {
        let mut ids: Vec<BlockId> = self.inner.blocks.read().keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn kind(&self) -> BlockManagerType {
        BlockManagerType::Log
    }
}

struct LogWritableBlock {
    inner: Arc<Inner>,
    /// `None` once closed or aborted
    container: Option<Arc<Container>>,
    id: BlockId,
    offset: u64,
    bytes_appended: u64,
}

impl LogWritableBlock {
    fn container(&self) -> Result<&Arc<Container>> {
        self.container
            .as_ref()
            .ok_or_else(|| Error::logic(format!("block {} already finished", self.id)))
    }

    fn commit(&self, container: &Arc<Container>) -> Result<()> {
        let sync = self.inner.opts.sync;
        if sync {
            container
                .data_file
                .sync_data()
                .at_path("syncing", &container.data_path)?;
        }
        container.append_record(
            &ContainerRecord::Create {
                block_id: self.id,
                offset: self.offset,
                length: self.bytes_appended,
            },
            sync,
        )
    }

    /// Drop the appended bytes and return the container to the pool
    fn rollback(&mut self) -> Result<()> {
        let Some(container) = self.container.take() else {
            return Ok(());
        };
        let truncated = container
            .data_file
            .set_len(self.offset)
            .at_path("truncating", &container.data_path);
        // On failure the container stays out of the pool.
        self.inner.check_io(&container, truncated)?;
        self.inner.release_container(container);
        Ok(())
    }
}

impl WritableBlock for LogWritableBlock {
    fn id(&self) -> BlockId {
        self.id
    }

    fn append(&mut self, data: &[u8]) -> Result<()> {
        let container = self.container()?;
        let written = container
            .data_file
            .write_all_at(data, self.offset + self.bytes_appended)
            .at_path("writing block to", &container.data_path);
        self.inner.check_io(container, written)?;
        self.bytes_appended += data.len() as u64;
        Ok(())
    }

    fn bytes_appended(&self) -> u64 {
        self.bytes_appended
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        let Some(container) = self.container.take() else {
            return Err(Error::logic(format!("block {} already finished", self.id)));
        };
        let committed = self.commit(&container);
        // On failure the container stays out of the pool.
        self.inner.check_io(&container, committed)?;

        let block = Arc::new(LogBlock {
            id: self.id,
            container: Arc::clone(&container),
            offset: self.offset,
            length: self.bytes_appended,
            deleted: AtomicBool::new(false),
        });
        self.inner.blocks.write().insert(self.id, block);

        let end = self.offset + self.bytes_appended;
        container
            .next_offset
            .store(align_up(end, ALIGNMENT), Ordering::Release);
        self.inner.release_container(container);
        debug!("Closed block {} ({} bytes)", self.id, self.bytes_appended);
        Ok(())
    }

    fn abort(mut self: Box<Self>) -> Result<()> {
        self.rollback()
    }
}

impl Drop for LogWritableBlock {
    fn drop(&mut self) {
        if self.container.is_some() {
            warn!("Block {} dropped without close or abort; discarding", self.id);
            if let Err(e) = self.rollback() {
                warn!("Failed to discard block {}: {}", self.id, e);
            }
        }
    }
}

struct LogReadableBlock {
    inner: Arc<Inner>,
    block: Arc<LogBlock>,
}

impl ReadableBlock for LogReadableBlock {
    fn id(&self) -> BlockId {
        self.block.id
    }

    fn size(&self) -> Result<u64> {
        Ok(self.block.length)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let block = &self.block;
        if offset.saturating_add(buf.len() as u64) > block.length {
            return Err(Error::logic(format!(
                "read of {} bytes at offset {} is past the end of block {} ({} bytes)",
                buf.len(),
                offset,
                block.id,
                block.length
            )));
        }
        let read = block
            .container
            .data_file
            .read_exact_at(buf, block.offset + offset)
            .at_path("reading block from", &block.container.data_path);
        self.inner.check_io(&block.container, read)
    }
}
