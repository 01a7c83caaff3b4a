//! Canonicalization of the configured filesystem roots
//!
//! Every root must be an absolute path with no leading or trailing
//! whitespace whose parent directory exists. Only the parent is resolved
//! (symlinks, `..`); the last component is kept as configured because the
//! root itself may not exist until the initial layout is created.
//! Deduplication happens on the canonical form, so two spellings of the
//! same physical directory count as one root.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tabletfs_common::{Error, Result};
use tracing::{debug, info};

/// The canonical, deduplicated set of roots
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CanonicalRoots {
    wal_root: PathBuf,
    metadata_root: PathBuf,
    data_roots: Vec<PathBuf>,
    all_roots: BTreeSet<PathBuf>,
    by_original: BTreeMap<String, PathBuf>,
}

impl CanonicalRoots {
    /// Validate and canonicalize the configured roots
    ///
    /// With no data roots the WAL root is the sole data root. With no
    /// metadata root the WAL root holds tablet and consensus metadata.
    pub fn canonicalize(
        wal_root: &str,
        data_roots: &[String],
        metadata_root: Option<&str>,
    ) -> Result<Self> {
        if wal_root.is_empty() {
            return Err(Error::invalid_config(
                "write-ahead log root (wal_root) not provided",
            ));
        }

        let mut originals: BTreeSet<&str> = BTreeSet::new();
        originals.insert(wal_root);
        originals.extend(data_roots.iter().map(String::as_str));
        originals.extend(metadata_root);

        // Check syntax of every root before touching the filesystem.
        for root in &originals {
            validate_syntax(root)?;
        }

        let mut by_original = BTreeMap::new();
        for root in originals {
            by_original.insert(root.to_string(), canonicalize_root(root)?);
        }

        let lookup = |root: &str| by_original[root].clone();
        let wal = lookup(wal_root);
        let metadata = metadata_root.map_or_else(|| wal.clone(), lookup);
        let data: BTreeSet<PathBuf> = if data_roots.is_empty() {
            info!("Data roots not provided; using the write-ahead log root as the data root");
            BTreeSet::from([wal.clone()])
        } else {
            data_roots.iter().map(|r| lookup(r)).collect()
        };
        let all: BTreeSet<PathBuf> = by_original.values().cloned().collect();

        debug!("WAL root: {}", wal.display());
        debug!("Metadata root: {}", metadata.display());
        debug!("Data roots: {:?}", data);
        debug!("All roots: {:?}", all);

        Ok(Self {
            wal_root: wal,
            metadata_root: metadata,
            data_roots: data.into_iter().collect(),
            all_roots: all,
            by_original,
        })
    }

    /// Canonical WAL root
    #[must_use]
    pub fn wal_root(&self) -> &Path {
        &self.wal_root
    }

    /// Canonical root holding tablet and consensus metadata
    #[must_use]
    pub fn metadata_root(&self) -> &Path {
        &self.metadata_root
    }

    /// Canonical data roots, sorted and deduplicated
    #[must_use]
    pub fn data_roots(&self) -> &[PathBuf] {
        &self.data_roots
    }

    /// Every distinct canonical root
    #[must_use]
    pub const fn all_roots(&self) -> &BTreeSet<PathBuf> {
        &self.all_roots
    }

    /// Canonical form of a root as it was originally configured
    #[must_use]
    pub fn canonical_of(&self, original: &str) -> Option<&Path> {
        self.by_original.get(original).map(PathBuf::as_path)
    }
}

fn validate_syntax(root: &str) -> Result<()> {
    if root.is_empty() {
        return Err(Error::invalid_config(
            "empty string provided for filesystem root",
        ));
    }
    if root.trim() != root {
        return Err(Error::invalid_config(format!(
            "filesystem root '{root}' contains illegal whitespace"
        )));
    }
    if !Path::new(root).is_absolute() {
        return Err(Error::invalid_config(format!(
            "relative path {root} provided for filesystem root"
        )));
    }
    Ok(())
}

fn canonicalize_root(root: &str) -> Result<PathBuf> {
    let path = Path::new(root);
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = std::fs::canonicalize(parent).map_err(|e| {
                Error::invalid_config(format!(
                    "cannot resolve parent directory {} of filesystem root {root}: {e}",
                    parent.display()
                ))
            })?;
            Ok(parent.join(name))
        }
        // "/" or a path ending in "..": resolve the whole thing.
        _ => std::fs::canonicalize(path).map_err(|e| {
            Error::invalid_config(format!("cannot resolve filesystem root {root}: {e}"))
        }),
    }
}
