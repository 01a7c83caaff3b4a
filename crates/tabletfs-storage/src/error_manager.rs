//! Disk failure notification
//!
//! Higher layers register one callback that is invoked with the path of a
//! data directory whenever that directory is found to be failing.

use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info};

/// Callback invoked with the failed directory
pub type ErrorNotificationCb = Arc<dyn Fn(&Path) + Send + Sync>;

/// Holder of the error notification callback
#[derive(Default)]
pub struct FsErrorManager {
    cb: RwLock<Option<ErrorNotificationCb>>,
    notifications: AtomicU64,
}

impl FsErrorManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the callback, replacing any previous one
    pub fn set_notification_cb(&self, cb: ErrorNotificationCb) {
        *self.cb.write() = Some(cb);
        info!("Disk error notification callback registered");
    }

    /// Remove the callback
    pub fn unset_notification_cb(&self) {
        *self.cb.write() = None;
    }

    /// Report a failed directory
    ///
    /// The callback runs outside the lock, so it may call back into the
    /// filesystem layer.
    pub fn run_error_notification_cb(&self, dir: &Path) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
        error!("Disk failure detected in {}", dir.display());
        let cb = self.cb.read().clone();
        if let Some(cb) = cb {
            cb(dir);
        }
    }

    /// Number of failures reported so far
    pub fn notifications(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for FsErrorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsErrorManager")
            .field("has_cb", &self.cb.read().is_some())
            .field("notifications", &self.notifications())
            .finish()
    }
}
