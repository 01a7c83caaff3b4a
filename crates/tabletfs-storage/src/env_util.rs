//! Filesystem helpers shared by the layout, the data directory pool and the
//! block managers

use std::fs::{self, File};
use std::path::Path;
use tabletfs_common::{Error, IoResultExt, Result};
use tracing::{debug, info, warn};

/// Any file or directory whose name contains this infix is a temporary
/// artifact of an interrupted write and may be deleted at startup
pub const TMP_INFIX: &str = ".tmp";

/// Check whether a file name denotes a temporary file
#[must_use]
pub fn is_tmp_file_name(name: &str) -> bool {
    name.contains(TMP_INFIX)
}

/// Create `path` as a directory unless it already is one
///
/// Returns `true` if the directory was created by this call.
pub fn create_dir_if_missing(path: &Path) -> Result<bool> {
    match fs::create_dir(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            if path.is_dir() {
                Ok(false)
            } else {
                Err(Error::already_exists(format!(
                    "{} exists and is not a directory",
                    path.display()
                )))
            }
        }
        Err(e) => Err(Error::from_io_at("creating directory", path, e)),
    }
}

/// Fsync a directory so that entries created or removed in it are durable
pub fn sync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path).at_path("opening directory for sync", path)?;
    dir.sync_all().at_path("syncing directory", path)
}

/// Check whether a directory has no entries
pub fn is_dir_empty(path: &Path) -> Result<bool> {
    let mut entries = fs::read_dir(path).at_path("listing directory", path)?;
    Ok(entries.next().is_none())
}

/// List the entry names of a directory, sorted
pub fn list_dir_sorted(path: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(path).at_path("listing directory", path)? {
        let entry = entry.at_path("listing directory", path)?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

/// Recursively delete temporary files and directories under `root`
///
/// Failures to delete individual entries are logged and skipped. Returns the
/// number of entries deleted.
pub fn delete_tmp_files_recursively(root: &Path) -> Result<usize> {
    let mut deleted = 0;
    for entry in fs::read_dir(root).at_path("listing directory", root)? {
        let entry = entry.at_path("listing directory", root)?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let file_type = entry.file_type().at_path("reading file type of", &path)?;

        if is_tmp_file_name(&name) {
            let removed = if file_type.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match removed {
                Ok(()) => {
                    info!("Deleted tmp file {}", path.display());
                    deleted += 1;
                }
                Err(e) => warn!("Failed to delete tmp file {}: {}", path.display(), e),
            }
        } else if file_type.is_dir() {
            deleted += delete_tmp_files_recursively(&path)?;
        }
    }
    Ok(deleted)
}

/// Make sure the permission bits of `path` do not grant anything the
/// process umask would have masked off, tightening them if needed
#[cfg(unix)]
pub fn ensure_file_mode_adheres_to_umask(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let umask = current_umask();
    let metadata = fs::metadata(path).at_path("reading permissions of", path)?;
    let mode = metadata.permissions().mode() & 0o7777;
    if mode & umask == 0 {
        return Ok(());
    }

    let new_mode = mode & !umask;
    info!(
        "Path {} has permissions {:o} which do not adhere to umask {:o}; changing to {:o}",
        path.display(),
        mode,
        umask,
        new_mode
    );
    fs::set_permissions(path, fs::Permissions::from_mode(new_mode))
        .at_path("changing permissions of", path)
}

#[cfg(not(unix))]
pub fn ensure_file_mode_adheres_to_umask(_path: &Path) -> Result<()> {
    Ok(())
}

/// Read the process umask
///
/// There is no way to read the umask without setting it, so it is set to
/// zero and immediately restored.
#[cfg(unix)]
fn current_umask() -> u32 {
    use nix::sys::stat::{Mode, umask};

    let old = umask(Mode::empty());
    umask(old);
    let bits = u32::from(old.bits());
    debug!("Process umask is {:o}", bits);
    bits
}
