//! End-to-end scenarios over composed filesystem stacks.

use std::sync::Arc;

use stackfs::compose::{AggregateFileSystem, MountFileSystem, SubFileSystem};
use stackfs::error::FsError;
use stackfs::fs::memory::MemoryFileSystem;
use stackfs::fs::{FileAccess, FileShare, FileSystem, FileSystemExt, OpenMode, SearchTarget};
use stackfs::path::VfsPath;

fn p(s: &str) -> VfsPath {
    VfsPath::new(s)
}

fn mem_with(files: &[(&str, &str)]) -> Arc<MemoryFileSystem> {
    let fs = MemoryFileSystem::new();
    for (path, contents) in files {
        let path = p(path);
        let parent = path.parent();
        if !parent.is_null() && !parent.is_root() {
            fs.create_dir_all(&parent).unwrap();
        }
        fs.write_bytes(&path, contents.as_bytes()).unwrap();
    }
    fs
}

#[test]
fn aggregate_stack_shadows_and_merges() {
    let mem1 = mem_with(&[("/a", "one")]);
    let mem2 = mem_with(&[("/a", "two"), ("/b", "b")]);

    let agg = AggregateFileSystem::new();
    agg.add_filesystem(mem1).unwrap();
    agg.add_filesystem(mem2).unwrap();

    assert_eq!(agg.read_to_string(&p("/a")).unwrap(), "two");
    assert_eq!(agg.read_to_string(&p("/b")).unwrap(), "b");

    let listing: Vec<_> = agg
        .enumerate_paths(&p("/"), "*", false, SearchTarget::Both)
        .unwrap()
        .collect();
    assert_eq!(listing, vec![p("/a"), p("/b")]);
}

#[test]
fn aggregate_is_read_only() {
    let agg = AggregateFileSystem::new();
    agg.add_filesystem(mem_with(&[("/a", "x")])).unwrap();

    assert!(matches!(
        agg.open_file(&p("/a"), OpenMode::Create, FileAccess::WRITE, FileShare::empty()),
        Err(FsError::ReadOnly { .. })
    ));
    let mut file = agg
        .open_file(&p("/a"), OpenMode::Open, FileAccess::READ, FileShare::READ)
        .unwrap();
    let mut contents = String::new();
    std::io::Read::read_to_string(&mut file, &mut contents).unwrap();
    assert_eq!(contents, "x");
}

#[test]
fn mount_routes_by_longest_prefix() {
    let mem_x = mem_with(&[("/f", "X")]);
    let mem_y = mem_with(&[("/g", "Y")]);

    let mount = MountFileSystem::new();
    mount.mount("/x", mem_x).unwrap();
    mount.mount("/x/y", mem_y).unwrap();

    assert!(mount.file_exists(&p("/x/f")).unwrap());
    assert_eq!(mount.read_to_string(&p("/x/y/g")).unwrap(), "Y");
    assert!(mount.directory_exists(&p("/x/y")).unwrap());

    let listing: Vec<_> = mount
        .enumerate_paths(&p("/x"), "*", false, SearchTarget::Both)
        .unwrap()
        .collect();
    assert_eq!(listing, vec![p("/x/f"), p("/x/y")]);
}

#[test]
fn mount_synthesizes_virtual_parents() {
    let mount = MountFileSystem::new();
    mount.mount("/a/b", mem_with(&[])).unwrap();

    assert!(mount.directory_exists(&p("/a")).unwrap());
    assert!(mount.directory_exists(&p("/a/b")).unwrap());
    assert!(!mount.file_exists(&p("/a")).unwrap());
    assert!(matches!(
        mount.delete_directory(&p("/a/b"), false),
        Err(FsError::Unauthorized { .. })
    ));
}

#[test]
fn sub_projects_a_subtree_as_root() {
    let mem = mem_with(&[("/root/sub/file", "deep")]);
    let sub = SubFileSystem::new(mem, "/root/sub").unwrap();

    assert!(sub.file_exists(&p("/file")).unwrap());
    assert!(!sub.file_exists(&p("/root/sub/file")).unwrap());
    assert_eq!(sub.read_to_string(&p("/file")).unwrap(), "deep");
}

#[test]
fn sub_round_trip_holds_across_operations() {
    let mem = mem_with(&[("/jail/keep", "k")]);
    let sub = SubFileSystem::new(mem.clone(), "/jail").unwrap();

    sub.create_directory(&p("/made")).unwrap();
    sub.write_bytes(&p("/made/file"), b"contents").unwrap();

    // Visible through the delegate at the translated location
    assert_eq!(mem.read_to_string(&p("/jail/made/file")).unwrap(), "contents");

    // And enumeration comes back in the sub namespace
    let all: Vec<_> = sub
        .enumerate_paths(&p("/"), "*", true, SearchTarget::Both)
        .unwrap()
        .collect();
    assert_eq!(all, vec![p("/keep"), p("/made"), p("/made/file")]);
}

#[test]
fn sub_over_mount_composes() {
    let inner = mem_with(&[("/data/file", "nested")]);
    let mount = MountFileSystem::new();
    mount.mount("/m", inner).unwrap();

    let sub = SubFileSystem::new(mount, "/m/data").unwrap();
    assert_eq!(sub.read_to_string(&p("/file")).unwrap(), "nested");
}

#[test]
fn aggregate_of_mounts_composes() {
    let mount_low = MountFileSystem::new();
    mount_low.mount("/shared", mem_with(&[("/f", "low")])).unwrap();
    let mount_high = MountFileSystem::new();
    mount_high.mount("/shared", mem_with(&[("/f", "high")])).unwrap();

    let agg = AggregateFileSystem::new();
    agg.add_filesystem(mount_low).unwrap();
    agg.add_filesystem(mount_high).unwrap();

    assert_eq!(agg.read_to_string(&p("/shared/f")).unwrap(), "high");
    let listing: Vec<_> = agg
        .enumerate_paths(&p("/shared"), "*", false, SearchTarget::File)
        .unwrap()
        .collect();
    assert_eq!(listing, vec![p("/shared/f")]);
}

#[test]
fn mount_fallback_receives_unmatched_paths() {
    let fallback = mem_with(&[("/outside", "fb")]);
    let mount = MountFileSystem::with_fallback(Some(fallback));
    mount.mount("/m", mem_with(&[("/inside", "m")])).unwrap();

    assert_eq!(mount.read_to_string(&p("/outside")).unwrap(), "fb");
    assert_eq!(mount.read_to_string(&p("/m/inside")).unwrap(), "m");
    mount.write_bytes(&p("/fresh"), b"new").unwrap();
    assert!(mount.file_exists(&p("/fresh")).unwrap());
}

#[test]
fn cross_mount_move_preserves_contents() {
    let left = mem_with(&[("/f", "payload")]);
    let right = mem_with(&[]);
    let mount = MountFileSystem::new();
    mount.mount("/left", left).unwrap();
    mount.mount("/right", right).unwrap();

    mount.move_file(&p("/left/f"), &p("/right/f")).unwrap();
    assert!(!mount.file_exists(&p("/left/f")).unwrap());
    assert_eq!(mount.read_to_string(&p("/right/f")).unwrap(), "payload");

    assert!(matches!(
        mount.move_directory(&p("/left"), &p("/right/sub")),
        Err(FsError::Unauthorized { .. })
    ));
}

#[test]
fn unmount_detaches_the_subtree() {
    let mount = MountFileSystem::new();
    mount.mount("/gone", mem_with(&[("/f", "x")])).unwrap();
    assert!(mount.file_exists(&p("/gone/f")).unwrap());

    mount.unmount(&p("/gone")).unwrap();
    assert!(!mount.file_exists(&p("/gone/f")).unwrap());
    assert!(!mount.directory_exists(&p("/gone")).unwrap());
}
