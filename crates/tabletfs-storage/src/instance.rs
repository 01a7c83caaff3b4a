//! Node identity persisted under every root
//!
//! A node has exactly one UUID. A copy of [`InstanceMetadata`] lives at
//! `<root>/instance` for every canonical root, and all copies must agree
//! when the filesystem is opened.

use crate::container;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tabletfs_common::{Error, Result};
use tracing::debug;
use uuid::Uuid;

/// Magic bytes of an instance file
pub const INSTANCE_MAGIC: [u8; 8] = *b"TFSINST\0";

/// Identity of a node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    /// 32 lowercase hex digits
    pub uuid: String,
    /// When and where the filesystem was formatted
    pub format_stamp: String,
}

impl InstanceMetadata {
    /// Create a new identity
    ///
    /// A supplied uuid may be hyphenated or not; it is stored in simple
    /// lowercase form. Without one, a random v4 uuid is generated.
    pub fn create(uuid: Option<&str>) -> Result<Self> {
        let uuid = match uuid {
            Some(s) => Uuid::parse_str(s)
                .map_err(|e| Error::invalid_config(format!("invalid uuid {s}: {e}")))?,
            None => Uuid::new_v4(),
        };
        Ok(Self {
            uuid: uuid.simple().to_string(),
            format_stamp: format_stamp(),
        })
    }

    /// Write this identity to `path`; never overwrites an existing file
    pub fn persist(&self, path: &Path, sync: bool) -> Result<()> {
        container::write_to_path(path, &INSTANCE_MAGIC, self, sync)?;
        debug!("Wrote instance metadata to {}: {:?}", path.display(), self);
        Ok(())
    }

    /// Read an identity from `path`
    pub fn load(path: &Path) -> Result<Self> {
        container::read_from_path(path, &INSTANCE_MAGIC)
    }

    /// Load every copy and check that all of them carry the same uuid
    ///
    /// The first copy read is returned.
    pub fn load_and_verify<'a, I>(paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a PathBuf>,
    {
        let mut first: Option<(Self, &Path)> = None;
        for path in paths {
            let metadata = Self::load(path)?;
            if let Some((expected, expected_path)) = &first {
                if expected.uuid != metadata.uuid {
                    return Err(Error::corruption(format!(
                        "Mismatched UUIDs across filesystem roots: {} vs. {} ({} vs. {})",
                        expected.uuid,
                        metadata.uuid,
                        expected_path.display(),
                        path.display()
                    )));
                }
            } else {
                first = Some((metadata, path.as_path()));
            }
        }
        first
            .map(|(metadata, _)| metadata)
            .ok_or_else(|| Error::not_found("no instance metadata paths to load"))
    }
}

fn format_stamp() -> String {
    let hostname = gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "<unknown host>".to_string());
    format!(
        "Formatted at {} on {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        hostname
    )
}
