//! Configuration types for TabletFS
//!
//! [`FsManagerOptions`] is the one configuration surface of the local
//! filesystem layer. It is deserializable from a config file, built once at
//! startup and validated by [`FsManagerOptions::validate`] before the
//! filesystem manager is constructed; after that it is never mutated.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default maximum size of a log block manager container (10 GiB)
pub const DEFAULT_LOG_CONTAINER_MAX_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Block storage strategy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockManagerType {
    /// One file per block
    File,
    /// Blocks packed into append-only container files (Linux only)
    Log,
}

impl BlockManagerType {
    /// Get the block manager type name
    pub const fn name(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Log => "log",
        }
    }

    /// Check whether this strategy can run on the current platform
    pub const fn is_supported(&self) -> bool {
        match self {
            Self::File => true,
            Self::Log => cfg!(target_os = "linux"),
        }
    }
}

impl Default for BlockManagerType {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            Self::Log
        } else {
            Self::File
        }
    }
}

impl std::fmt::Display for BlockManagerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for BlockManagerType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" => Ok(Self::File),
            "log" => Ok(Self::Log),
            _ => Err(format!(
                "unknown block manager type: {s} (valid options are 'file' and 'log')"
            )),
        }
    }
}

/// Options for the local filesystem manager
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FsManagerOptions {
    /// Root holding the write-ahead logs. Required.
    pub wal_root: String,
    /// Roots holding data blocks. If empty, the WAL root is the sole data root.
    pub data_roots: Vec<String>,
    /// Root holding tablet and consensus metadata. Defaults to the WAL root.
    pub metadata_root: Option<String>,
    /// Which block manager to use for storage
    pub block_manager: BlockManagerType,
    /// Open without ever writing to disk
    pub read_only: bool,
    /// Fsync data blocks, metadata and their parent directories.
    ///
    /// Disabling this is unsafe: a system crash may lose or corrupt data,
    /// including a freshly bootstrapped layout.
    pub enable_data_block_fsync: bool,
    /// Size at which a log block manager container stops accepting new blocks
    pub log_container_max_size: u64,
}

impl Default for FsManagerOptions {
    fn default() -> Self {
        Self {
            wal_root: String::new(),
            data_roots: Vec::new(),
            metadata_root: None,
            block_manager: BlockManagerType::default(),
            read_only: false,
            enable_data_block_fsync: true,
            log_container_max_size: DEFAULT_LOG_CONTAINER_MAX_SIZE,
        }
    }
}

impl FsManagerOptions {
    /// Options for a single root used for WAL, metadata and data alike
    pub fn with_root(root: impl Into<String>) -> Self {
        Self {
            wal_root: root.into(),
            ..Default::default()
        }
    }

    /// Set the data roots
    #[must_use]
    pub fn data_roots<I, S>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.data_roots = roots.into_iter().map(Into::into).collect();
        self
    }

    /// Set the block manager type
    #[must_use]
    pub const fn block_manager(mut self, block_manager: BlockManagerType) -> Self {
        self.block_manager = block_manager;
        self
    }

    /// Set read-only mode
    #[must_use]
    pub const fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Parse a comma-separated list of data roots, skipping empty entries
    pub fn parse_data_roots(list: &str) -> Vec<String> {
        list.split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Validate option values that do not depend on the filesystem
    ///
    /// Root syntax is checked later, when the roots are canonicalized.
    pub fn validate(&self) -> Result<()> {
        if self.wal_root.is_empty() {
            return Err(Error::invalid_config(
                "write-ahead log root (wal_root) not provided",
            ));
        }
        if !self.block_manager.is_supported() {
            return Err(Error::invalid_config(format!(
                "block manager '{}' is not supported on this platform; only 'file' is available",
                self.block_manager
            )));
        }
        if self.log_container_max_size == 0 {
            return Err(Error::invalid_config(
                "log_container_max_size must be greater than zero",
            ));
        }
        Ok(())
    }
}
