//! Block storage
//!
//! A block is an opaque, immutable run of bytes addressed by a [`BlockId`].
//! Callers create blocks through a [`WritableBlock`], read them through any
//! number of [`ReadableBlock`]s, and delete them by id. How blocks map to
//! files is up to the [`BlockManager`] implementation:
//!
//! - [`FileBlockManager`]: one file per block
//! - [`LogBlockManager`]: blocks packed into append-only containers (Linux)
//!
//! The implementation is chosen once, at open, by [`create_block_manager`].

mod file;
mod log;

pub use file::FileBlockManager;
pub use log::LogBlockManager;

use crate::data_dirs::DataDirManager;
use crate::report::FsReport;
use bytes::Bytes;
use std::sync::Arc;
use tabletfs_common::{BlockId, BlockManagerType, Error, Result};

/// Block being written; exclusively owned until closed or aborted
pub trait WritableBlock: Send {
    fn id(&self) -> BlockId;

    /// Append bytes to the block
    fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Number of bytes appended so far
    fn bytes_appended(&self) -> u64;

    /// Make the block durable and readable
    fn close(self: Box<Self>) -> Result<()>;

    /// Discard the block; its id never becomes readable
    fn abort(self: Box<Self>) -> Result<()>;
}

/// Handle to a finished block; safe to share between readers
pub trait ReadableBlock: Send + Sync {
    fn id(&self) -> BlockId;

    /// Size of the block in bytes
    fn size(&self) -> Result<u64>;

    /// Fill `buf` with the bytes starting at `offset`
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Read the whole block
    fn read_all(&self) -> Result<Bytes> {
        let size = usize::try_from(self.size()?)
            .map_err(|_| Error::corruption(format!("block {} too large to read", self.id())))?;
        let mut buf = vec![0u8; size];
        self.read_at(0, &mut buf)?;
        Ok(Bytes::from(buf))
    }
}

/// Placement hints for a new block
#[derive(Clone, Debug, Default)]
pub struct CreateBlockOptions {
    /// Tablet the block belongs to; blocks of one tablet share a directory
    pub tablet_id: Option<String>,
}

impl CreateBlockOptions {
    #[must_use]
    pub fn for_tablet(tablet_id: impl Into<String>) -> Self {
        Self {
            tablet_id: Some(tablet_id.into()),
        }
    }
}

/// Options shared by the block managers
#[derive(Clone, Copy, Debug)]
pub struct BlockManagerOptions {
    pub read_only: bool,
    /// Fsync block data and the directories holding it
    pub sync: bool,
    /// Size at which a log container stops accepting blocks
    pub log_container_max_size: u64,
}

/// Mapping of block ids to physical storage
pub trait BlockManager: Send + Sync {
    /// Scan the data directories, repairing what can be repaired unless
    /// read-only, and index the live blocks
    fn open(&self) -> Result<FsReport>;

    /// Start a new block; fails with `LogicError` when read-only
    fn create_block(&self, opts: &CreateBlockOptions) -> Result<Box<dyn WritableBlock>>;

    /// Open a block for reading; `NotFound` if unknown
    fn open_block(&self, id: BlockId) -> Result<Box<dyn ReadableBlock>>;

    /// Delete a block; the id is unreadable once this returns
    fn delete_block(&self, id: BlockId) -> Result<()>;

    /// Check whether a block exists; never fails
    fn block_exists(&self, id: BlockId) -> bool;

    /// Ids of all live blocks, sorted
    fn all_block_ids(&self) -> Result<Vec<BlockId>>;

    fn kind(&self) -> BlockManagerType;
}

/// Build the block manager of the given type over a data directory pool
pub fn create_block_manager(
    kind: BlockManagerType,
    dd_manager: Arc<DataDirManager>,
    opts: BlockManagerOptions,
) -> Result<Box<dyn BlockManager>> {
    if !kind.is_supported() {
        return Err(Error::invalid_config(format!(
            "block manager '{kind}' is not supported on this platform"
        )));
    }
    Ok(match kind {
        BlockManagerType::File => Box::new(FileBlockManager::new(dd_manager, opts)),
        BlockManagerType::Log => Box::new(LogBlockManager::new(dd_manager, opts)),
    })
}

fn read_only_error(op: &str) -> Error {
    Error::logic(format!("cannot {op}: block manager is read-only"))
}
