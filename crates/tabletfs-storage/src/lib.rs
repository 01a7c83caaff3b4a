//! TabletFS Storage - local filesystem layout and block storage
//!
//! This crate owns everything a node keeps on local disk:
//! - Canonicalization and validation of the configured roots
//! - The per-root instance identity record
//! - The directory layout for WALs, tablet metadata and consensus metadata
//! - The data directory pool and its per-directory metadata
//! - Pluggable block managers (one file per block, or log-structured containers)
//! - The [`FsManager`] coordinating bootstrap and open of all of the above

pub mod block;
pub mod container;
pub mod data_dirs;
pub mod env_util;
pub mod error_manager;
pub mod fs_manager;
pub mod instance;
pub mod layout;
pub mod report;
pub mod rollback;
pub mod roots;

// Re-exports
pub use block::{
    BlockManager, BlockManagerOptions, CreateBlockOptions, FileBlockManager, LogBlockManager,
    ReadableBlock, WritableBlock, create_block_manager,
};
pub use data_dirs::{DataDir, DataDirManager, DataDirManagerOptions, PathInstanceMetadata};
pub use error_manager::{ErrorNotificationCb, FsErrorManager};
pub use fs_manager::{FsManager, FsState};
pub use instance::InstanceMetadata;
pub use layout::DirectoryLayout;
pub use report::{Anomaly, FsReport, ReportStats};
pub use rollback::{RollbackLedger, UndoAction};
pub use roots::CanonicalRoots;
pub use tabletfs_common::{BlockId, BlockManagerType, Error, ErrorKind, FsManagerOptions, Result};
