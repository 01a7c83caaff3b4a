//! Undo ledger for the bootstrap sequence
//!
//! Every file or directory created while laying out a fresh filesystem is
//! recorded here. On success the ledger is committed and forgotten; on
//! failure it is rolled back, deleting the recorded paths in reverse order
//! of creation.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One compensating action
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UndoAction {
    /// Delete a file
    RemoveFile(PathBuf),
    /// Delete a directory and whatever ended up inside it
    RemoveDir(PathBuf),
}

impl UndoAction {
    fn path(&self) -> &Path {
        match self {
            Self::RemoveFile(p) | Self::RemoveDir(p) => p,
        }
    }

    fn run(&self) -> std::io::Result<()> {
        let result = match self {
            Self::RemoveFile(p) => std::fs::remove_file(p),
            Self::RemoveDir(p) => std::fs::remove_dir_all(p),
        };
        match result {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Ordered record of undo actions, consumed exactly once
#[derive(Debug, Default)]
pub struct RollbackLedger {
    actions: Vec<UndoAction>,
    consumed: bool,
}

impl RollbackLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a created file
    pub fn record_file(&mut self, path: impl Into<PathBuf>) {
        self.actions.push(UndoAction::RemoveFile(path.into()));
    }

    /// Record a created directory
    pub fn record_dir(&mut self, path: impl Into<PathBuf>) {
        self.actions.push(UndoAction::RemoveDir(path.into()));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Recorded actions in creation order
    #[must_use]
    pub fn actions(&self) -> &[UndoAction] {
        &self.actions
    }

    /// Keep everything that was created
    pub fn commit(mut self) {
        debug!("Committing bootstrap ({} paths created)", self.actions.len());
        self.consumed = true;
    }

    /// Delete everything that was created, newest first
    ///
    /// Failures are logged and do not stop the remaining actions.
    pub fn rollback(mut self) {
        self.consumed = true;
        for action in self.actions.iter().rev() {
            match action.run() {
                Ok(()) => debug!("Rolled back {}", action.path().display()),
                Err(e) => warn!("Failed to roll back {}: {}", action.path().display(), e),
            }
        }
    }
}

impl Drop for RollbackLedger {
    fn drop(&mut self) {
        if !self.consumed && !self.actions.is_empty() {
            warn!(
                "Rollback ledger dropped with {} pending actions; created paths are kept",
                self.actions.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_rollback_in_reverse() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        let sub = root.join("sub");
        let file = sub.join("instance");

        let mut ledger = RollbackLedger::new();
        fs::create_dir(&root).unwrap();
        ledger.record_dir(&root);
        fs::create_dir(&sub).unwrap();
        ledger.record_dir(&sub);
        fs::write(&file, b"x").unwrap();
        ledger.record_file(&file);
        // Never created; rollback must tolerate it.
        ledger.record_file(root.join("ghost"));

        assert_eq!(ledger.len(), 4);
        assert_eq!(ledger.actions()[0], UndoAction::RemoveDir(root.clone()));

        ledger.rollback();
        assert!(!root.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_commit_keeps_paths() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        let mut ledger = RollbackLedger::new();
        fs::create_dir(&root).unwrap();
        ledger.record_dir(&root);

        ledger.commit();
        assert!(root.is_dir());
    }
}
