//! End-to-end tests of the filesystem manager lifecycle

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use tabletfs_storage::{
    BlockManagerType, CreateBlockOptions, ErrorKind, FsManager, FsManagerOptions, FsState,
    InstanceMetadata,
};
use tempfile::{TempDir, tempdir};

fn s(p: &Path) -> String {
    p.to_str().unwrap().to_string()
}

fn block_managers() -> Vec<BlockManagerType> {
    if cfg!(target_os = "linux") {
        vec![BlockManagerType::File, BlockManagerType::Log]
    } else {
        vec![BlockManagerType::File]
    }
}

fn options(base: &TempDir, kind: BlockManagerType) -> FsManagerOptions {
    FsManagerOptions::with_root(s(&base.path().join("wal")))
        .data_roots([s(&base.path().join("d0")), s(&base.path().join("d1"))])
        .block_manager(kind)
}

fn formatted(base: &TempDir, kind: BlockManagerType) -> FsManager {
    let mut fs = FsManager::new(options(base, kind)).unwrap();
    fs.create_initial_layout(None).unwrap();
    fs.open().unwrap();
    fs
}

#[test]
fn test_duplicate_roots_collapse() {
    let base = tempdir().unwrap();
    std::fs::create_dir(base.path().join("sub")).unwrap();
    let b = s(base.path());

    let spellings = [
        format!("{b}/d0"),
        format!("{b}/sub/../d0"),
        format!("{b}/./d0"),
        format!("{b}/d1"),
        format!("{b}/d1/"),
    ];
    let mut reversed = spellings.clone();
    reversed.reverse();

    let mut dirs = Vec::new();
    for data_roots in [spellings, reversed] {
        let opts = FsManagerOptions::with_root(format!("{b}/wal"))
            .data_roots(data_roots)
            .block_manager(BlockManagerType::File);
        let mut fs = FsManager::new(opts).unwrap();
        fs.init().unwrap();
        let layout = fs.layout().unwrap();
        assert_eq!(layout.roots().all_roots().len(), 3);
        dirs.push(fs.data_root_dirs().unwrap());
    }
    assert_eq!(dirs[0].len(), 2);
    assert_eq!(dirs[0], dirs[1]);
}

#[test]
fn test_bootstrap_then_open_keeps_uuid() {
    for kind in block_managers() {
        let base = tempdir().unwrap();
        let mut fs = FsManager::new(options(&base, kind)).unwrap();
        fs.create_initial_layout(Some("6ba7b810-9dad-11d1-80b4-00c04fd430c8"))
            .unwrap();
        let report = fs.open().unwrap();
        assert!(report.is_clean());
        assert_eq!(report.data_dirs.len(), 2);
        assert_eq!(fs.uuid(), Some("6ba7b8109dad11d180b400c04fd430c8"));
        drop(fs);

        let mut fs = FsManager::new(options(&base, kind)).unwrap();
        fs.open().unwrap();
        assert_eq!(fs.state(), FsState::Opened);
        assert_eq!(fs.uuid(), Some("6ba7b8109dad11d180b400c04fd430c8"));
    }
}

#[test]
fn test_mismatched_uuids_are_corruption() {
    let base = tempdir().unwrap();
    let fs = formatted(&base, BlockManagerType::File);
    let uuid = fs.uuid().unwrap().to_string();
    let d1_instance = fs.layout().unwrap().roots().data_roots()[1].join("instance");
    drop(fs);

    std::fs::remove_file(&d1_instance).unwrap();
    let foreign = InstanceMetadata::create(None).unwrap();
    foreign.persist(&d1_instance, false).unwrap();

    let mut fs = FsManager::new(options(&base, BlockManagerType::File)).unwrap();
    let err = fs.open().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corruption);
    let msg = err.to_string();
    assert!(msg.contains(&uuid), "{msg}");
    assert!(msg.contains(&foreign.uuid), "{msg}");
    assert_ne!(fs.state(), FsState::Opened);
}

#[test]
fn test_invalid_roots_fail_before_mutation() {
    let base = tempdir().unwrap();
    let good = s(&base.path().join("wal"));
    let bad_roots = [
        String::new(),
        "relative/d0".to_string(),
        format!(" {good}-d0"),
        format!("{good}-d0\t"),
    ];
    for bad in bad_roots {
        let opts = FsManagerOptions::with_root(good.clone())
            .data_roots([bad.clone()])
            .block_manager(BlockManagerType::File);
        let mut fs = FsManager::new(opts).unwrap();
        let err = fs.init().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig, "root {bad:?}");
        let err = fs.create_initial_layout(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig, "root {bad:?}");
        assert_eq!(fs.state(), FsState::Unconfigured);
    }
    assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);

    let err = FsManager::new(FsManagerOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
}

#[test]
fn test_read_only_rejects_mutation() {
    for kind in block_managers() {
        let base = tempdir().unwrap();
        let fs = formatted(&base, kind);
        let mut block = fs.create_new_block(&CreateBlockOptions::default()).unwrap();
        block.append(b"payload").unwrap();
        let id = block.id();
        block.close().unwrap();
        drop(fs);

        let mut fs = FsManager::new(options(&base, kind).read_only(true)).unwrap();
        fs.open().unwrap();
        assert!(fs.read_only());
        let err = fs.create_new_block(&CreateBlockOptions::default()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::LogicError);
        assert_eq!(fs.delete_block(id).unwrap_err().kind(), ErrorKind::LogicError);
        assert_eq!(&fs.open_block(id).unwrap().read_all().unwrap()[..], b"payload");
    }
}

#[test]
fn test_block_lifecycle() {
    for kind in block_managers() {
        let base = tempdir().unwrap();
        let fs = formatted(&base, kind);

        let mut ids = Vec::new();
        for i in 0..8u8 {
            let opts = CreateBlockOptions::for_tablet(format!("tablet-{}", i % 3));
            let mut block = fs.create_new_block(&opts).unwrap();
            block.append(&[i; 1000]).unwrap();
            block.append(&[i; 24]).unwrap();
            ids.push(block.id());
            block.close().unwrap();
        }
        for (i, id) in ids.iter().enumerate() {
            let data = fs.open_block(*id).unwrap().read_all().unwrap();
            assert_eq!(data.len(), 1024);
            assert!(data.iter().all(|b| usize::from(*b) == i));
        }

        let mut listed = fs.all_block_ids().unwrap();
        listed.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(listed, expected);

        fs.delete_block(ids[0]).unwrap();
        assert!(!fs.block_exists(ids[0]));
        assert!(fs.open_block(ids[0]).err().unwrap().kind() == ErrorKind::NotFound);
        drop(fs);

        let mut fs = FsManager::new(options(&base, kind)).unwrap();
        let report = fs.open().unwrap();
        assert!(report.is_clean(), "{report}");
        assert_eq!(report.stats.live_block_count, 7);
        assert_eq!(report.stats.live_block_bytes, 7 * 1024);
        assert!(!fs.block_exists(ids[0]));
        assert!(fs.block_exists(ids[1]));
    }
}

#[test]
fn test_concurrent_delete_is_visible_to_all() {
    for kind in block_managers() {
        let base = tempdir().unwrap();
        let fs = Arc::new(formatted(&base, kind));

        let ids: Vec<_> = (0..32u8)
            .map(|i| {
                let mut block = fs.create_new_block(&CreateBlockOptions::default()).unwrap();
                block.append(&[i; 16]).unwrap();
                let id = block.id();
                block.close().unwrap();
                id
            })
            .collect();

        let handles: Vec<_> = ids
            .chunks(8)
            .map(|chunk| {
                let fs = Arc::clone(&fs);
                let chunk = chunk.to_vec();
                thread::spawn(move || {
                    for id in chunk {
                        fs.delete_block(id).unwrap();
                        assert!(!fs.block_exists(id));
                    }
                })
            })
            .collect();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let fs = Arc::clone(&fs);
                let ids = ids.clone();
                thread::spawn(move || {
                    for id in ids {
                        // Either still readable in full or already gone.
                        match fs.open_block(id) {
                            Ok(block) => assert_eq!(block.read_all().unwrap().len(), 16),
                            Err(e) => assert!(e.is_not_found()),
                        }
                    }
                })
            })
            .collect();
        for h in handles.into_iter().chain(readers) {
            h.join().unwrap();
        }

        for id in &ids {
            assert!(!fs.block_exists(*id));
        }
        assert!(fs.all_block_ids().unwrap().is_empty());
    }
}

#[test]
fn test_lookups_after_delete_returns_see_not_found() {
    for kind in block_managers() {
        let base = tempdir().unwrap();
        let fs = Arc::new(formatted(&base, kind));
        let ids: Vec<_> = (0..16u8)
            .map(|i| {
                let mut block = fs.create_new_block(&CreateBlockOptions::default()).unwrap();
                block.append(&[i; 32]).unwrap();
                let id = block.id();
                block.close().unwrap();
                id
            })
            .collect();

        // deleted[i] is set only after delete_block(ids[i]) has returned.
        let deleted: Arc<Vec<AtomicBool>> =
            Arc::new(ids.iter().map(|_| AtomicBool::new(false)).collect());
        let start = Arc::new(Barrier::new(5));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let (fs, ids, deleted, start) = (
                    Arc::clone(&fs),
                    ids.clone(),
                    Arc::clone(&deleted),
                    Arc::clone(&start),
                );
                thread::spawn(move || {
                    start.wait();
                    while !deleted.iter().all(|d| d.load(Ordering::Acquire)) {
                        for (i, id) in ids.iter().enumerate() {
                            let was_deleted = deleted[i].load(Ordering::Acquire);
                            let opened = fs.open_block(*id);
                            if was_deleted {
                                assert!(opened.err().unwrap().is_not_found(), "{id} reopened");
                                assert!(!fs.block_exists(*id), "{id} still exists");
                            }
                        }
                    }
                })
            })
            .collect();

        start.wait();
        for (i, id) in ids.iter().enumerate() {
            fs.delete_block(*id).unwrap();
            deleted[i].store(true, Ordering::Release);
        }
        for reader in readers {
            reader.join().unwrap();
        }
        assert!(fs.all_block_ids().unwrap().is_empty());
    }
}

#[test]
fn test_file_blocks_survive_data_root_rename() {
    let base = tempdir().unwrap();
    let fs = formatted(&base, BlockManagerType::File);
    let ids: Vec<_> = (0..4u8)
        .map(|i| {
            let mut block = fs.create_new_block(&CreateBlockOptions::default()).unwrap();
            block.append(&[i; 10]).unwrap();
            let id = block.id();
            block.close().unwrap();
            id
        })
        .collect();
    drop(fs);

    // d0 now sorts after d1.
    std::fs::rename(base.path().join("d0"), base.path().join("z0")).unwrap();
    let opts = FsManagerOptions::with_root(s(&base.path().join("wal")))
        .data_roots([s(&base.path().join("d1")), s(&base.path().join("z0"))])
        .block_manager(BlockManagerType::File);
    let mut fs = FsManager::new(opts).unwrap();
    let report = fs.open().unwrap();
    assert_eq!(report.stats.live_block_count, 4);
    for (i, id) in ids.iter().enumerate() {
        assert!(fs.block_exists(*id), "{id}");
        let data = fs.open_block(*id).unwrap().read_all().unwrap();
        assert!(data.iter().all(|b| usize::from(*b) == i));
    }
}

#[test]
fn test_roots_share_identity_and_layout() {
    for kind in block_managers() {
        let base = tempdir().unwrap();
        let fs = formatted(&base, kind);
        let layout = fs.layout().unwrap();
        let wal = layout.roots().wal_root().to_path_buf();
        let d0 = layout.roots().data_roots()[0].clone();
        let d1 = layout.roots().data_roots()[1].clone();

        let uuids: Vec<String> = [&wal, &d0, &d1]
            .iter()
            .map(|root| InstanceMetadata::load(&root.join("instance")).unwrap().uuid)
            .collect();
        assert!(uuids.iter().all(|u| Some(u.as_str()) == fs.uuid()));

        for dir in ["wals", "tablet-meta", "consensus-meta"] {
            assert!(wal.join(dir).is_dir(), "{dir}");
        }

        let data_dirs = fs.data_root_dirs().unwrap();
        assert_eq!(data_dirs.len(), 2);
        assert!(
            data_dirs
                .iter()
                .all(|d| d.starts_with(&d0) || d.starts_with(&d1))
        );
        assert!(!wal.join("data").exists());
    }
}

#[test]
fn test_switching_block_manager_is_rejected() {
    if !cfg!(target_os = "linux") {
        return;
    }
    let base = tempdir().unwrap();
    drop(formatted(&base, BlockManagerType::File));

    let mut fs = FsManager::new(options(&base, BlockManagerType::Log)).unwrap();
    let err = fs.open().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
}

#[test]
fn test_separate_metadata_root() {
    let base = tempdir().unwrap();
    let mut opts = options(&base, BlockManagerType::File);
    opts.metadata_root = Some(s(&base.path().join("meta")));
    let mut fs = FsManager::new(opts).unwrap();
    fs.create_initial_layout(None).unwrap();
    fs.open().unwrap();

    let meta = base.path().join("meta").canonicalize().unwrap();
    assert_eq!(fs.tablet_metadata_dir().unwrap(), meta.join("tablet-meta"));
    assert_eq!(fs.consensus_metadata_path("t1").unwrap(), meta.join("consensus-meta/t1"));
    assert!(meta.join("instance").is_file());
    assert!(fs.wals_root_dir().unwrap().is_dir());
}
