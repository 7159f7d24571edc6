//! Change-notification fan-in across composed filesystems.

use std::sync::Arc;
use std::sync::mpsc::Receiver;

use stackfs::compose::{AggregateFileSystem, MountFileSystem, SubFileSystem};
use stackfs::fs::memory::MemoryFileSystem;
use stackfs::fs::{FileSystem, FileSystemExt};
use stackfs::path::VfsPath;
use stackfs::watcher::{ChangeKind, WatchEvent, Watcher as _};

fn p(s: &str) -> VfsPath {
    VfsPath::new(s)
}

fn changes(rx: &Receiver<WatchEvent>) -> Vec<(ChangeKind, VfsPath)> {
    rx.try_iter()
        .filter_map(|event| match event {
            WatchEvent::Change(change) => Some((change.kind, change.path)),
            WatchEvent::Error(_) => None,
        })
        .collect()
}

#[test]
fn aggregate_watcher_follows_stack_changes() {
    let fs_a = MemoryFileSystem::new();
    let fs_b = MemoryFileSystem::new();

    let agg = AggregateFileSystem::new();
    agg.add_filesystem(fs_a.clone()).unwrap();

    let watcher = agg.watch(&p("/")).unwrap();
    let rx = watcher.core().subscribe();

    // A change in the only layer reaches the subscriber exactly once.
    fs_a.write_bytes(&p("/x"), b"1").unwrap();
    let seen = changes(&rx);
    assert_eq!(
        seen.iter()
            .filter(|(kind, path)| *kind == ChangeKind::Created && *path == p("/x"))
            .count(),
        1
    );

    // A layer added after the watcher was handed out is spliced in.
    agg.add_filesystem(fs_b.clone()).unwrap();
    fs_b.write_bytes(&p("/y"), b"2").unwrap();
    assert!(
        changes(&rx)
            .iter()
            .any(|(kind, path)| *kind == ChangeKind::Created && *path == p("/y"))
    );

    // A removed layer is spliced out; its changes go dark.
    let fs_a_dyn: Arc<dyn FileSystem> = fs_a.clone();
    agg.remove_filesystem(&fs_a_dyn).unwrap();
    fs_a.write_bytes(&p("/z"), b"3").unwrap();
    assert!(changes(&rx).is_empty());
}

#[test]
fn mount_watcher_rewrites_into_the_composed_namespace() {
    let backing = MemoryFileSystem::new();
    let mount = MountFileSystem::new();
    mount.mount("/mnt", backing.clone()).unwrap();

    let watcher = mount.watch(&p("/")).unwrap();
    let rx = watcher.core().subscribe();

    backing.write_bytes(&p("/raw"), b"1").unwrap();
    backing.delete_file(&p("/raw")).unwrap();

    let seen = changes(&rx);
    assert!(seen.contains(&(ChangeKind::Created, p("/mnt/raw"))));
    assert!(seen.contains(&(ChangeKind::Deleted, p("/mnt/raw"))));
    // No event leaks through with a mount-local path
    assert!(seen.iter().all(|(_, path)| path.as_str().starts_with("/mnt")));
}

#[test]
fn sub_watcher_drops_events_outside_the_subtree() {
    let mem = MemoryFileSystem::new();
    mem.create_dir_all(&p("/jail")).unwrap();
    let sub = SubFileSystem::new(mem.clone(), "/jail").unwrap();

    let watcher = sub.watch(&p("/")).unwrap();
    let rx = watcher.core().subscribe();

    mem.write_bytes(&p("/jail/in"), b"1").unwrap();
    mem.write_bytes(&p("/out"), b"2").unwrap();

    let seen = changes(&rx);
    assert!(seen.contains(&(ChangeKind::Created, p("/in"))));
    assert!(seen.iter().all(|(_, path)| !path.as_str().contains("out")));
}

#[test]
fn watcher_filter_and_enable_gate_composed_events() {
    let backing = MemoryFileSystem::new();
    let mount = MountFileSystem::new();
    mount.mount("/logs", backing.clone()).unwrap();

    let watcher = mount.watch(&p("/")).unwrap();
    watcher.core().set_filter("*.log").unwrap();
    let rx = watcher.core().subscribe();

    backing.write_bytes(&p("/app.log"), b"1").unwrap();
    backing.write_bytes(&p("/app.txt"), b"2").unwrap();
    let seen = changes(&rx);
    assert!(seen.iter().any(|(_, path)| *path == p("/logs/app.log")));
    assert!(seen.iter().all(|(_, path)| *path != p("/logs/app.txt")));

    watcher.core().set_enabled(false);
    backing.write_bytes(&p("/other.log"), b"3").unwrap();
    assert!(changes(&rx).is_empty());
}

#[test]
fn one_event_per_subscriber_across_fan_in() {
    let backing = MemoryFileSystem::new();
    let agg = AggregateFileSystem::new();
    agg.add_filesystem(backing.clone()).unwrap();

    let watcher = agg.watch(&p("/")).unwrap();
    let rx1 = watcher.core().subscribe();
    let rx2 = watcher.core().subscribe();

    backing.write_bytes(&p("/once"), b"1").unwrap();

    for rx in [&rx1, &rx2] {
        let created: Vec<_> = changes(rx)
            .into_iter()
            .filter(|(kind, path)| *kind == ChangeKind::Created && *path == p("/once"))
            .collect();
        assert_eq!(created.len(), 1);
    }
}
