//! Checksummed, length-prefixed container for small metadata records
//!
//! Used for the per-root instance file and the per-directory pool metadata.
//!
//! Format:
//! ```text
//! +---------+---------+--------+---------+--------+
//! | Magic   | Version | Length | Payload | CRC32C |
//! | 8B      | 4B      | 4B     | var     | 4B     |
//! +---------+---------+--------+---------+--------+
//! ```
//! The payload is bincode; the CRC covers everything before it.

use crate::env_util;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tabletfs_common::{Error, IoResultExt, Result};

/// Current container format version
pub const CONTAINER_VERSION: u32 = 1;

/// Header size (magic + version + length)
const HEADER_SIZE: usize = 16;

/// Serialize a message into a container
pub fn encode<T: Serialize>(magic: &[u8; 8], msg: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(msg)
        .map_err(|e| Error::corruption(format!("failed to serialize record: {e}")))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::corruption("record too large for container"))?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + 4);
    buf.extend_from_slice(magic);
    buf.extend_from_slice(&CONTAINER_VERSION.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);

    let crc = crc32c::crc32c(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Parse a container, verifying magic, version and checksum
pub fn decode<T: DeserializeOwned>(magic: &[u8; 8], data: &[u8]) -> Result<T> {
    if data.len() < HEADER_SIZE + 4 {
        return Err(Error::corruption(format!(
            "container too small: {} bytes",
            data.len()
        )));
    }
    if &data[0..8] != magic {
        return Err(Error::corruption("invalid container magic"));
    }

    let version = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    if version != CONTAINER_VERSION {
        return Err(Error::corruption(format!(
            "unsupported container version: {version}"
        )));
    }

    let len = u32::from_le_bytes([data[12], data[13], data[14], data[15]]) as usize;
    let end = HEADER_SIZE + len;
    if data.len() != end + 4 {
        return Err(Error::corruption(format!(
            "container length mismatch: header says {len} payload bytes, file has {}",
            data.len().saturating_sub(HEADER_SIZE + 4)
        )));
    }

    let stored_crc = u32::from_le_bytes([data[end], data[end + 1], data[end + 2], data[end + 3]]);
    let computed_crc = crc32c::crc32c(&data[..end]);
    if stored_crc != computed_crc {
        return Err(Error::corruption(format!(
            "container checksum mismatch: computed={computed_crc:08x}, stored={stored_crc:08x}"
        )));
    }

    bincode::deserialize(&data[HEADER_SIZE..end])
        .map_err(|e| Error::corruption(format!("failed to parse record: {e}")))
}

/// Write a container to `path`, failing if the file already exists
///
/// The data goes to a temporary sibling first and is hard-linked into place,
/// so a crash never leaves a partially written file at `path`. With `sync`
/// the file and its parent directory are fsynced.
pub fn write_to_path<T: Serialize>(path: &Path, magic: &[u8; 8], msg: &T, sync: bool) -> Result<()> {
    let buf = encode(magic, msg)?;
    let tmp_path = tmp_path_for(path);

    let written = write_tmp(&tmp_path, &buf, sync).and_then(|()| {
        fs::hard_link(&tmp_path, path).map_err(|e| Error::from_io_at("writing", path, e))
    });
    // The temp file is either linked into place or garbage; remove it both ways.
    let _ = fs::remove_file(&tmp_path);
    written?;

    if sync && let Some(parent) = path.parent() {
        env_util::sync_dir(parent)?;
    }
    Ok(())
}

/// Read and decode a container from `path`
pub fn read_from_path<T: DeserializeOwned>(path: &Path, magic: &[u8; 8]) -> Result<T> {
    let data = fs::read(path).at_path("reading", path)?;
    decode(magic, &data).map_err(|e| e.prepend(format!("{}", path.display())))
}

fn write_tmp(tmp_path: &Path, buf: &[u8], sync: bool) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(tmp_path)
        .at_path("creating", tmp_path)?;
    file.write_all(buf).at_path("writing", tmp_path)?;
    if sync {
        file.sync_all().at_path("syncing", tmp_path)?;
    }
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!("{}.{}", env_util::TMP_INFIX, uuid::Uuid::new_v4().simple()));
    path.with_file_name(name)
}
