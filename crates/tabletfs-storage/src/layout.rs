//! Directory layout definitions
//!
//! Layout:
//! ```text
//! <root>/instance                          Instance identity, one per root
//! <wal-root>/wals/                         WAL root
//! <wal-root>/wals/<tablet>/wal-000000001   WAL segments
//! <wal-root>/wals/<tablet>.recovery/       WAL recovery staging area
//! <meta-root>/tablet-meta/<tablet>         Tablet metadata
//! <meta-root>/consensus-meta/<tablet>      Consensus metadata
//! <data-root>/data/                        Block storage
//! ```
//!
//! Every path here is derived from the canonical roots on demand; none of
//! them is stored separately.

use crate::roots::CanonicalRoots;
use std::path::{Path, PathBuf};

/// WAL root directory name
pub const WAL_DIR_NAME: &str = "wals";

/// Prefix of WAL segment file names
pub const WAL_FILE_NAME_PREFIX: &str = "wal";

/// Suffix of per-tablet WAL recovery directories
pub const WALS_RECOVERY_DIR_SUFFIX: &str = ".recovery";

/// Tablet metadata directory name
pub const TABLET_METADATA_DIR_NAME: &str = "tablet-meta";

/// Consensus metadata directory name
pub const CONSENSUS_METADATA_DIR_NAME: &str = "consensus-meta";

/// Block storage directory name under each data root
pub const DATA_DIR_NAME: &str = "data";

/// Instance identity file name under each root
pub const INSTANCE_METADATA_FILE_NAME: &str = "instance";

/// Paths derived from the canonical roots
#[derive(Clone, Debug)]
pub struct DirectoryLayout {
    roots: CanonicalRoots,
}

impl DirectoryLayout {
    /// Create a layout over canonical roots
    #[must_use]
    pub const fn new(roots: CanonicalRoots) -> Self {
        Self { roots }
    }

    /// The canonical roots this layout derives from
    #[must_use]
    pub const fn roots(&self) -> &CanonicalRoots {
        &self.roots
    }

    /// Directory holding all WALs
    #[must_use]
    pub fn wals_root_dir(&self) -> PathBuf {
        self.roots.wal_root().join(WAL_DIR_NAME)
    }

    /// WAL directory of one tablet
    #[must_use]
    pub fn tablet_wal_dir(&self, tablet_id: &str) -> PathBuf {
        self.wals_root_dir().join(tablet_id)
    }

    /// WAL recovery directory of one tablet
    #[must_use]
    pub fn tablet_wal_recovery_dir(&self, tablet_id: &str) -> PathBuf {
        self.wals_root_dir()
            .join(format!("{tablet_id}{WALS_RECOVERY_DIR_SUFFIX}"))
    }

    /// Path of a WAL segment, e.g. `wals/<tablet>/wal-000000042`
    #[must_use]
    pub fn wal_segment_file_name(&self, tablet_id: &str, sequence_number: u64) -> PathBuf {
        self.tablet_wal_dir(tablet_id)
            .join(format!("{WAL_FILE_NAME_PREFIX}-{sequence_number:09}"))
    }

    /// Directory holding tablet metadata files
    #[must_use]
    pub fn tablet_metadata_dir(&self) -> PathBuf {
        self.roots.metadata_root().join(TABLET_METADATA_DIR_NAME)
    }

    /// Metadata file of one tablet
    #[must_use]
    pub fn tablet_metadata_path(&self, tablet_id: &str) -> PathBuf {
        self.tablet_metadata_dir().join(tablet_id)
    }

    /// Directory holding consensus metadata files
    #[must_use]
    pub fn consensus_metadata_dir(&self) -> PathBuf {
        self.roots.metadata_root().join(CONSENSUS_METADATA_DIR_NAME)
    }

    /// Consensus metadata file of one tablet
    #[must_use]
    pub fn consensus_metadata_path(&self, tablet_id: &str) -> PathBuf {
        self.consensus_metadata_dir().join(tablet_id)
    }

    /// Instance identity file under `root`
    #[must_use]
    pub fn instance_metadata_path(root: &Path) -> PathBuf {
        root.join(INSTANCE_METADATA_FILE_NAME)
    }

    /// Block storage directory under a data root
    #[must_use]
    pub fn data_dir(data_root: &Path) -> PathBuf {
        data_root.join(DATA_DIR_NAME)
    }

    /// Directories created next to the roots at bootstrap, in creation order
    #[must_use]
    pub fn ancillary_dirs(&self) -> [PathBuf; 3] {
        [
            self.wals_root_dir(),
            self.tablet_metadata_dir(),
            self.consensus_metadata_dir(),
        ]
    }
}
