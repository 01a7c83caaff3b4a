//! Local filesystem manager
//!
//! [`FsManager`] ties the configured roots, the node identity, the data
//! directory pool and the block manager together. Its lifecycle:
//!
//! ```text
//! Unconfigured --init--> Initialized --create_initial_layout--> Bootstrapped
//!                             |                                     |
//!                             +----------------open-----------------+--> Opened
//! ```
//!
//! Lifecycle transitions take `&mut self`; once opened the manager is shared
//! behind an `Arc` and block operations take `&self`.

use crate::block::{
    BlockManager, BlockManagerOptions, CreateBlockOptions, ReadableBlock, WritableBlock,
    create_block_manager,
};
use crate::data_dirs::{DataDirManager, DataDirManagerOptions};
use crate::env_util;
use crate::error_manager::{ErrorNotificationCb, FsErrorManager};
use crate::instance::InstanceMetadata;
use crate::layout::DirectoryLayout;
use crate::report::FsReport;
use crate::rollback::RollbackLedger;
use crate::roots::CanonicalRoots;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tabletfs_common::{BlockId, Error, FsManagerOptions, IoResultExt, Result};
use tracing::{debug, info, warn};

/// Lifecycle state of an [`FsManager`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FsState {
    /// Constructed; roots not yet canonicalized
    Unconfigured,
    /// Roots canonicalized; path queries available
    Initialized,
    /// Fresh layout created on disk
    Bootstrapped,
    /// Identity verified and block manager open
    Opened,
}

/// Manager of the local filesystem layout and block storage
pub struct FsManager {
    opts: FsManagerOptions,
    state: FsState,
    layout: Option<DirectoryLayout>,
    metadata: Option<InstanceMetadata>,
    error_manager: Arc<FsErrorManager>,
    dd_manager: Option<Arc<DataDirManager>>,
    block_manager: Option<Box<dyn BlockManager>>,
    /// Index of the ancillary directory whose creation fails
    #[cfg(test)]
    fail_ancillary_dir: Option<usize>,
    /// Index of the data directory whose pool record fails to be written
    #[cfg(test)]
    fail_pool_record: Option<usize>,
}

impl FsManager {
    /// Create a manager; nothing is touched on disk
    pub fn new(opts: FsManagerOptions) -> Result<Self> {
        opts.validate()?;
        Ok(Self {
            opts,
            state: FsState::Unconfigured,
            layout: None,
            metadata: None,
            error_manager: Arc::new(FsErrorManager::new()),
            dd_manager: None,
            block_manager: None,
            #[cfg(test)]
            fail_ancillary_dir: None,
            #[cfg(test)]
            fail_pool_record: None,
        })
    }

    /// Canonicalize and validate the configured roots
    ///
    /// Idempotent. Fails with `InvalidConfig` before anything on disk is
    /// created or modified.
    pub fn init(&mut self) -> Result<()> {
        if self.layout.is_some() {
            return Ok(());
        }
        let roots = CanonicalRoots::canonicalize(
            &self.opts.wal_root,
            &self.opts.data_roots,
            self.opts.metadata_root.as_deref(),
        )?;
        self.layout = Some(DirectoryLayout::new(roots));
        self.state = FsState::Initialized;
        Ok(())
    }

    /// Lay out a fresh filesystem under the configured roots
    ///
    /// Every root must be missing or empty. On failure everything created
    /// so far is removed again.
    pub fn create_initial_layout(&mut self, uuid: Option<&str>) -> Result<()> {
        self.init()?;
        if self.opts.read_only {
            return Err(Error::logic("cannot create a filesystem layout in read-only mode"));
        }
        if self.state != FsState::Initialized {
            return Err(Error::logic(format!(
                "cannot create a filesystem layout in state {:?}",
                self.state
            )));
        }
        let layout = self.require_layout()?.clone();

        for root in layout.roots().all_roots() {
            ensure_empty_or_missing(root)?;
        }

        let metadata = InstanceMetadata::create(uuid)?;
        let mut ledger = RollbackLedger::new();
        match self.bootstrap(&layout, &metadata, &mut ledger) {
            Ok(dd_manager) => {
                ledger.commit();
                info!(
                    "Generated new instance metadata in {} roots: uuid {}, {}",
                    layout.roots().all_roots().len(),
                    metadata.uuid,
                    metadata.format_stamp
                );
                self.dd_manager = Some(Arc::new(dd_manager));
                self.metadata = Some(metadata);
                self.state = FsState::Bootstrapped;
                Ok(())
            }
            Err(e) => {
                warn!("Creating the filesystem layout failed, rolling back: {}", e);
                ledger.rollback();
                Err(e.prepend("could not create the filesystem layout"))
            }
        }
    }

    fn bootstrap(
        &self,
        layout: &DirectoryLayout,
        metadata: &InstanceMetadata,
        ledger: &mut RollbackLedger,
    ) -> Result<DataDirManager> {
        let sync = self.opts.enable_data_block_fsync;
        let mut to_sync: BTreeSet<PathBuf> = BTreeSet::new();

        for root in layout.roots().all_roots() {
            if env_util::create_dir_if_missing(root)? {
                ledger.record_dir(root);
                if let Some(parent) = root.parent() {
                    to_sync.insert(parent.to_path_buf());
                }
            }
            let path = DirectoryLayout::instance_metadata_path(root);
            ledger.record_file(&path);
            metadata.persist(&path, sync)?;
        }

        for (index, dir) in layout.ancillary_dirs().iter().enumerate() {
            #[cfg(test)]
            if self.fail_ancillary_dir == Some(index) {
                return Err(Error::io(
                    format!("creating directory {}", dir.display()),
                    std::io::Error::other("injected failure"),
                ));
            }
            if env_util::create_dir_if_missing(dir)? {
                ledger.record_dir(dir);
                if let Some(parent) = dir.parent() {
                    to_sync.insert(parent.to_path_buf());
                }
            }
            debug!("Created ancillary directory {} ({})", dir.display(), index);
        }

        if sync {
            for dir in &to_sync {
                env_util::sync_dir(dir)?;
            }
        }

        DataDirManager::create_new(
            layout.roots(),
            self.dd_options(),
            Arc::clone(&self.error_manager),
            ledger,
        )
    }

    /// Open the filesystem laid out by an earlier [`create_initial_layout`]
    ///
    /// [`create_initial_layout`]: Self::create_initial_layout
    pub fn open(&mut self) -> Result<FsReport> {
        self.init()?;
        if self.state == FsState::Opened {
            return Err(Error::logic("filesystem is already open"));
        }
        let layout = self.require_layout()?.clone();

        let paths: Vec<PathBuf> = layout
            .roots()
            .all_roots()
            .iter()
            .map(|root| DirectoryLayout::instance_metadata_path(root))
            .collect();
        let metadata = InstanceMetadata::load_and_verify(&paths)?;

        if !self.opts.read_only {
            self.clean_tmp_files(&layout);
            self.check_and_fix_permissions(&layout);
        }

        let dd_manager = match &self.dd_manager {
            Some(dd) => Arc::clone(dd),
            None => {
                let start = Instant::now();
                let dd = DataDirManager::open_existing(
                    layout.roots(),
                    self.dd_options(),
                    Arc::clone(&self.error_manager),
                )?;
                info!("Opened directory manager in {:?}", start.elapsed());
                let dd = Arc::new(dd);
                self.dd_manager = Some(Arc::clone(&dd));
                dd
            }
        };

        let start = Instant::now();
        let block_manager = create_block_manager(
            self.opts.block_manager,
            dd_manager,
            BlockManagerOptions {
                read_only: self.opts.read_only,
                sync: self.opts.enable_data_block_fsync,
                log_container_max_size: self.opts.log_container_max_size,
            },
        )?;
        let report = block_manager.open()?;
        info!(
            "Opened {} block manager in {:?}",
            block_manager.kind(),
            start.elapsed()
        );

        info!("Opened local filesystem: uuid {}", metadata.uuid);
        debug!("{}", metadata.format_stamp);
        self.metadata = Some(metadata);
        self.block_manager = Some(block_manager);
        self.state = FsState::Opened;
        Ok(report)
    }

    fn dd_options(&self) -> DataDirManagerOptions {
        DataDirManagerOptions {
            read_only: self.opts.read_only,
            block_manager_type: self.opts.block_manager,
            sync: self.opts.enable_data_block_fsync,
            #[cfg(test)]
            fail_pool_record: self.fail_pool_record,
        }
    }

    fn clean_tmp_files(&self, layout: &DirectoryLayout) {
        for dir in layout.ancillary_dirs() {
            match env_util::delete_tmp_files_recursively(&dir) {
                Ok(0) => {}
                Ok(n) => info!("Deleted {} tmp files under {}", n, dir.display()),
                Err(e) => warn!("Failed to clean tmp files under {}: {}", dir.display(), e),
            }
        }
    }

    fn check_and_fix_permissions(&self, layout: &DirectoryLayout) {
        for root in layout.roots().all_roots() {
            if let Err(e) = env_util::ensure_file_mode_adheres_to_umask(root) {
                warn!("Failed to check permissions of {}: {}", root.display(), e);
            }
        }
    }

    // --- Error notification ---

    /// Register the callback run when a data directory fails
    pub fn set_error_notification_cb(&self, cb: ErrorNotificationCb) {
        self.error_manager.set_notification_cb(cb);
    }

    pub fn unset_error_notification_cb(&self) {
        self.error_manager.unset_notification_cb();
    }

    // --- State ---

    #[must_use]
    pub const fn state(&self) -> FsState {
        self.state
    }

    #[must_use]
    pub const fn read_only(&self) -> bool {
        self.opts.read_only
    }

    #[must_use]
    pub const fn options(&self) -> &FsManagerOptions {
        &self.opts
    }

    /// Layout, once initialized
    #[must_use]
    pub const fn layout(&self) -> Option<&DirectoryLayout> {
        self.layout.as_ref()
    }

    /// Node uuid, once bootstrapped or opened
    #[must_use]
    pub fn uuid(&self) -> Option<&str> {
        self.metadata.as_ref().map(|m| m.uuid.as_str())
    }

    /// Identity record, once bootstrapped or opened
    #[must_use]
    pub const fn instance_metadata(&self) -> Option<&InstanceMetadata> {
        self.metadata.as_ref()
    }

    #[must_use]
    pub fn data_dir_manager(&self) -> Option<&Arc<DataDirManager>> {
        self.dd_manager.as_ref()
    }

    // --- Paths ---

    fn require_layout(&self) -> Result<&DirectoryLayout> {
        self.layout
            .as_ref()
            .ok_or_else(|| Error::logic("filesystem manager is not initialized"))
    }

    pub fn wals_root_dir(&self) -> Result<PathBuf> {
        Ok(self.require_layout()?.wals_root_dir())
    }

    pub fn tablet_wal_dir(&self, tablet_id: &str) -> Result<PathBuf> {
        Ok(self.require_layout()?.tablet_wal_dir(tablet_id))
    }

    pub fn tablet_wal_recovery_dir(&self, tablet_id: &str) -> Result<PathBuf> {
        Ok(self.require_layout()?.tablet_wal_recovery_dir(tablet_id))
    }

    pub fn wal_segment_file_name(&self, tablet_id: &str, sequence_number: u64) -> Result<PathBuf> {
        Ok(self
            .require_layout()?
            .wal_segment_file_name(tablet_id, sequence_number))
    }

    pub fn tablet_metadata_dir(&self) -> Result<PathBuf> {
        Ok(self.require_layout()?.tablet_metadata_dir())
    }

    pub fn tablet_metadata_path(&self, tablet_id: &str) -> Result<PathBuf> {
        Ok(self.require_layout()?.tablet_metadata_path(tablet_id))
    }

    pub fn consensus_metadata_dir(&self) -> Result<PathBuf> {
        Ok(self.require_layout()?.consensus_metadata_dir())
    }

    pub fn consensus_metadata_path(&self, tablet_id: &str) -> Result<PathBuf> {
        Ok(self.require_layout()?.consensus_metadata_path(tablet_id))
    }

    /// Instance file of every root
    pub fn instance_metadata_paths(&self) -> Result<Vec<PathBuf>> {
        Ok(self
            .require_layout()?
            .roots()
            .all_roots()
            .iter()
            .map(|root| DirectoryLayout::instance_metadata_path(root))
            .collect())
    }

    /// Block storage directory of every data root
    pub fn data_root_dirs(&self) -> Result<Vec<PathBuf>> {
        Ok(self
            .require_layout()?
            .roots()
            .data_roots()
            .iter()
            .map(|root| DirectoryLayout::data_dir(root))
            .collect())
    }

    /// Ids of the tablets with a metadata file, sorted
    pub fn list_tablet_ids(&self) -> Result<Vec<String>> {
        let dir = self.tablet_metadata_dir()?;
        Ok(env_util::list_dir_sorted(&dir)
            .map_err(|e| e.prepend("could not list tablets"))?
            .into_iter()
            .filter(|name| !name.starts_with('.') && !env_util::is_tmp_file_name(name))
            .collect())
    }

    /// Write the directory tree under every root to `out`
    pub fn dump_file_system_tree(&self, out: &mut dyn Write) -> Result<()> {
        for root in self.require_layout()?.roots().all_roots() {
            writeln!(out, "File-System Root: {}", root.display())
                .io_context(|| "writing file system tree".to_string())?;
            dump_tree(out, "|-", root)?;
        }
        Ok(())
    }

    // --- Blocks ---

    fn require_block_manager(&self) -> Result<&dyn BlockManager> {
        self.block_manager
            .as_deref()
            .ok_or_else(|| Error::logic("filesystem is not open"))
    }

    /// Start writing a new block
    pub fn create_new_block(&self, opts: &CreateBlockOptions) -> Result<Box<dyn WritableBlock>> {
        if self.opts.read_only {
            return Err(Error::logic("cannot create a block: filesystem is read-only"));
        }
        self.require_block_manager()?.create_block(opts)
    }

    pub fn open_block(&self, id: BlockId) -> Result<Box<dyn ReadableBlock>> {
        self.require_block_manager()?.open_block(id)
    }

    pub fn delete_block(&self, id: BlockId) -> Result<()> {
        if self.opts.read_only {
            return Err(Error::logic("cannot delete a block: filesystem is read-only"));
        }
        self.require_block_manager()?.delete_block(id)
    }

    /// Whether a block exists; `false` while the filesystem is not open
    #[must_use]
    pub fn block_exists(&self, id: BlockId) -> bool {
        self.block_manager
            .as_ref()
            .is_some_and(|bm| bm.block_exists(id))
    }

    pub fn all_block_ids(&self) -> Result<Vec<BlockId>> {
        self.require_block_manager()?.all_block_ids()
    }
}

impl std::fmt::Debug for FsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsManager")
            .field("state", &self.state)
            .field("opts", &self.opts)
            .field("uuid", &self.uuid())
            .finish_non_exhaustive()
    }
}

fn ensure_empty_or_missing(root: &Path) -> Result<()> {
    match std::fs::metadata(root) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::from_io_at("checking root", root, e)),
        Ok(m) if !m.is_dir() => Err(Error::already_exists(format!(
            "root {} exists and is not a directory",
            root.display()
        ))),
        Ok(_) if !env_util::is_dir_empty(root)? => Err(Error::already_exists(format!(
            "root {} is not empty",
            root.display()
        ))),
        Ok(_) => Ok(()),
    }
}

fn dump_tree(out: &mut dyn Write, prefix: &str, dir: &Path) -> Result<()> {
    for name in env_util::list_dir_sorted(dir)? {
        let path = dir.join(&name);
        if path.is_dir() {
            writeln!(out, "{prefix}{name}/").io_context(|| "writing file system tree".to_string())?;
            dump_tree(out, &format!("{prefix}---"), &path)?;
        } else {
            writeln!(out, "{prefix}{name}").io_context(|| "writing file system tree".to_string())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabletfs_common::{BlockManagerType, ErrorKind};
    use tempfile::{TempDir, tempdir};

    fn s(p: &Path) -> String {
        p.to_str().unwrap().to_string()
    }

    fn options(base: &TempDir) -> FsManagerOptions {
        FsManagerOptions::with_root(s(&base.path().join("wal")))
            .data_roots([s(&base.path().join("d0")), s(&base.path().join("d1"))])
            .block_manager(BlockManagerType::File)
    }

    fn tree(base: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        let mut stack = vec![base.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path.clone());
                }
                out.push(path);
            }
        }
        out.sort();
        out
    }

    #[test]
    fn test_failed_bootstrap_leaves_nothing_behind() {
        let base = tempdir().unwrap();
        // One root exists up front and must survive, empty.
        std::fs::create_dir(base.path().join("d1")).unwrap();

        let mut fs = FsManager::new(options(&base)).unwrap();
        fs.fail_ancillary_dir = Some(2);
        let err = fs.create_initial_layout(None).unwrap_err();
        assert!(err.is_disk_failure());
        assert_eq!(fs.state(), FsState::Initialized);
        assert!(fs.uuid().is_none());

        assert_eq!(tree(base.path()), vec![base.path().join("d1")]);

        // A retry without the fault succeeds.
        fs.fail_ancillary_dir = None;
        fs.create_initial_layout(None).unwrap();
        assert_eq!(fs.state(), FsState::Bootstrapped);
    }

    #[test]
    fn test_failed_data_dir_creation_leaves_nothing_behind() {
        let base = tempdir().unwrap();
        let mut fs = FsManager::new(options(&base)).unwrap();
        // The first data directory is complete, the second fails midway.
        fs.fail_pool_record = Some(1);
        let err = fs.create_initial_layout(None).unwrap_err();
        assert!(err.is_disk_failure());
        assert_eq!(fs.state(), FsState::Initialized);
        assert!(tree(base.path()).is_empty(), "{:?}", tree(base.path()));

        fs.fail_pool_record = None;
        fs.create_initial_layout(None).unwrap();
        fs.open().unwrap();
        assert_eq!(fs.data_root_dirs().unwrap().len(), 2);
    }

    #[test]
    fn test_non_empty_root_is_rejected() {
        let base = tempdir().unwrap();
        let d0 = base.path().join("d0");
        std::fs::create_dir(&d0).unwrap();
        std::fs::write(d0.join("precious"), b"keep me").unwrap();

        let mut fs = FsManager::new(options(&base)).unwrap();
        let err = fs.create_initial_layout(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(tree(base.path()), vec![d0.clone(), d0.join("precious")]);
    }

    #[test]
    fn test_state_machine() {
        let base = tempdir().unwrap();
        let mut fs = FsManager::new(options(&base)).unwrap();
        assert_eq!(fs.state(), FsState::Unconfigured);
        assert_eq!(fs.wals_root_dir().unwrap_err().kind(), ErrorKind::LogicError);
        assert_eq!(
            fs.create_new_block(&CreateBlockOptions::default()).err().unwrap().kind(),
            ErrorKind::LogicError
        );

        fs.init().unwrap();
        fs.init().unwrap();
        assert_eq!(fs.state(), FsState::Initialized);
        assert!(fs.wals_root_dir().unwrap().ends_with("wal/wals"));
        assert!(fs.open().unwrap_err().is_not_found());

        fs.create_initial_layout(None).unwrap();
        let err = fs.create_initial_layout(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LogicError);
        assert!(!fs.block_exists(BlockId::new(1)));

        fs.open().unwrap();
        assert_eq!(fs.state(), FsState::Opened);
        assert_eq!(fs.open().unwrap_err().kind(), ErrorKind::LogicError);
    }

    #[test]
    fn test_read_only_bootstrap_is_rejected() {
        let base = tempdir().unwrap();
        let mut fs = FsManager::new(options(&base).read_only(true)).unwrap();
        let err = fs.create_initial_layout(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LogicError);
        assert!(tree(base.path()).is_empty());
    }

    #[test]
    fn test_open_cleans_tmp_files() {
        let base = tempdir().unwrap();
        let mut fs = FsManager::new(options(&base)).unwrap();
        fs.create_initial_layout(None).unwrap();
        let stray = fs.tablet_metadata_dir().unwrap().join("tablet-1.tmp.abc");
        std::fs::write(&stray, b"").unwrap();
        let wal_tmp = fs.tablet_wal_dir("tablet-1").unwrap();
        std::fs::create_dir(&wal_tmp).unwrap();
        std::fs::write(wal_tmp.join("wal-000000001.tmp"), b"").unwrap();

        let mut ro = FsManager::new(options(&base).read_only(true)).unwrap();
        ro.open().unwrap();
        assert!(stray.exists());

        let mut fs = FsManager::new(options(&base)).unwrap();
        fs.open().unwrap();
        assert!(!stray.exists());
        assert!(!wal_tmp.join("wal-000000001.tmp").exists());
        assert!(wal_tmp.is_dir());
    }

    #[test]
    fn test_list_tablet_ids() {
        let base = tempdir().unwrap();
        let mut fs = FsManager::new(options(&base)).unwrap();
        fs.create_initial_layout(None).unwrap();
        for name in ["b", "a", ".hidden", "c.tmp.1"] {
            std::fs::write(fs.tablet_metadata_path(name).unwrap(), b"").unwrap();
        }
        assert_eq!(fs.list_tablet_ids().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_dump_file_system_tree() {
        let base = tempdir().unwrap();
        let opts = FsManagerOptions::with_root(s(&base.path().join("wal")))
            .block_manager(BlockManagerType::File);
        let mut fs = FsManager::new(opts).unwrap();
        fs.create_initial_layout(None).unwrap();
        std::fs::create_dir(fs.tablet_wal_dir("t1").unwrap()).unwrap();

        let mut out = Vec::new();
        fs.dump_file_system_tree(&mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        let root = fs.layout().unwrap().roots().wal_root().to_path_buf();
        let expected = format!(
            "File-System Root: {}\n\
             |-consensus-meta/\n\
             |-data/\n\
             |----block_manager_instance\n\
             |-instance\n\
             |-tablet-meta/\n\
             |-wals/\n\
             |----t1/\n",
            root.display()
        );
        assert_eq!(out, expected);
    }

    #[test]
    fn test_error_notification_cb() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let base = tempdir().unwrap();
        let mut fs = FsManager::new(options(&base)).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        fs.set_error_notification_cb(Arc::new(move |_: &Path| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        fs.create_initial_layout(None).unwrap();
        fs.open().unwrap();

        let dd = fs.data_dir_manager().unwrap();
        dd.mark_dir_failed(0, "injected");
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        fs.unset_error_notification_cb();
        dd.mark_dir_failed(1, "injected");
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Both directories failed: no room for new blocks.
        let err = fs.create_new_block(&CreateBlockOptions::default()).err().unwrap();
        assert!(err.is_disk_failure());
    }
}
