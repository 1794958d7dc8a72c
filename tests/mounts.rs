//! Mount lifecycle through the factory: staging, sharing, checkpoints.

mod common;

use std::fs;
use std::time::Duration;

use archfs::{EntryPath, Error, OperationScope, ResolverConfig, ResourceHandlerFactory};

use common::{Library, dir_names, raw_stored_zip};

#[test]
fn test_acquire_release_checkpoint_leaves_nothing() {
    let lib = Library::new();
    let comic = lib.container_with(
        "comic.cbz",
        &[("001.png", b"one"), ("002.png", b"two"), ("extras/notes.txt", b"notes")],
    );

    let leases: Vec<_> = (0..5).map(|_| lib.factory.mounts().acquire(&comic).unwrap()).collect();
    assert_eq!(fs::read(leases[0].join("extras/notes.txt")).unwrap(), b"notes");
    assert_eq!(lib.factory.mounts().mounted_count(), 1);
    drop(leases);

    assert!(lib.factory.mounts().is_mounted(&comic));
    lib.factory.unmount_all().unwrap();
    assert!(!lib.factory.mounts().is_mounted(&comic));
    assert!(dir_names(&lib.staging()).is_empty());
}

#[test]
fn test_checkpoint_reports_busy_containers() {
    let config = ResolverConfig::new().unmount_timeout(Duration::from_millis(20));
    let lib = Library::with_config(config);
    let comic = lib.container_with("comic.cbz", &[("001.png", b"one")]);
    let book = lib.container_with("book.epub", &[("mimetype", b"application/epub+zip")]);

    let held = lib.factory.mounts().acquire(&comic).unwrap();
    drop(lib.factory.mounts().acquire(&book).unwrap());

    match lib.factory.unmount_all() {
        Err(Error::MountBusy { containers }) => assert_eq!(containers, vec![comic.key().to_string()]),
        other => panic!("expected MountBusy, got {:?}", other),
    }
    // The idle mount went away, the held one survived.
    assert_eq!(lib.factory.mounts().mounted_count(), 1);
    assert!(held.join("001.png").exists());

    drop(held);
    lib.factory.unmount_all().unwrap();
    assert!(dir_names(&lib.staging()).is_empty());
}

#[test]
fn test_write_restages_new_generation() {
    let lib = Library::new();
    let comic = lib.container_with("comic.cbz", &[("001.png", b"old")]);
    let old = lib.factory.mounts().acquire(&comic).unwrap();

    let _ = comic
        .append_or_replace(EntryPath::new("001.png").unwrap(), b"new".to_vec())
        .unwrap();
    let new = lib.factory.mounts().acquire(&comic).unwrap();

    assert_ne!(old.path(), new.path());
    assert_eq!(new.generation(), old.generation() + 1);
    assert_eq!(fs::read(old.join("001.png")).unwrap(), b"old");
    assert_eq!(fs::read(new.join("001.png")).unwrap(), b"new");

    drop(old);
    drop(new);
    lib.factory.unmount_all().unwrap();
    assert!(dir_names(&lib.staging()).is_empty());
}

#[test]
fn test_hostile_entry_names_are_refused() {
    let lib = Library::new();
    fs::write(
        lib.file("evil.zip"),
        raw_stored_zip(&[("fine.txt", b"ok"), ("../escape.txt", b"gotcha")]),
    )
    .unwrap();
    let evil = lib.factory.container(&lib.path("evil.zip")).unwrap();

    let err = lib.factory.mounts().acquire(&evil).unwrap_err();
    assert!(matches!(err, Error::PathTraversal { .. }), "{:?}", err);
    assert_eq!(lib.factory.mounts().mounted_count(), 0);
    assert!(dir_names(&lib.staging()).is_empty());
    assert!(!lib.dir.path().join("escape.txt").exists());
}

#[test]
fn test_materialize_plain_file_is_not_staged() {
    let lib = Library::new();
    fs::write(lib.file("notes.txt"), b"plain").unwrap();
    let handle = lib.factory.resolve(&lib.path("notes.txt")).unwrap();
    let materialized = handle.materialize().unwrap();
    assert!(!materialized.is_staged());
    assert!(materialized.lease().is_none());
    assert_eq!(materialized.path(), lib.file("notes.txt"));
    assert_eq!(lib.factory.mounts().mounted_count(), 0);
}

#[test]
fn test_scope_sweeps_on_early_return() {
    let lib = Library::new();
    lib.container_with("comic.cbz", &[("001.png", b"one")]);

    let import = |page: &str| -> archfs::Result<usize> {
        let _scope: OperationScope = lib.factory.scope();
        let staged = lib.factory.resolve(&lib.path(page))?.materialize()?;
        assert!(staged.exists());
        lib.factory.resolve(&lib.path("comic.cbz/missing.png"))?.read_bytes()?;
        Ok(1)
    };
    assert!(matches!(import("comic.cbz/001.png"), Err(Error::EntryNotFound { .. })));
    assert_eq!(lib.factory.mounts().mounted_count(), 0);
    assert!(dir_names(&lib.staging()).is_empty());
}

#[test]
fn test_factories_sharing_a_registry_see_each_others_writes() {
    let lib = Library::new();
    let other = ResourceHandlerFactory::with_registry(lib.factory.config().clone(), lib.factory.mounts().clone());
    let info = lib.path("books.zip/meta/info.xml");

    lib.factory.resolve(&info).unwrap().write(b"<m/>").unwrap();
    let staged = other.resolve(&info).unwrap().materialize().unwrap();
    assert_eq!(fs::read(staged.path()).unwrap(), b"<m/>");
    drop(staged);

    lib.factory.resolve(&info).unwrap().write(b"<m updated='1'/>").unwrap();
    let staged = other.resolve(&info).unwrap().materialize().unwrap();
    assert_eq!(fs::read(staged.path()).unwrap(), b"<m updated='1'/>");

    // The first factory gets the same mount for the same generation.
    let same = lib.factory.resolve(&info).unwrap().materialize().unwrap();
    assert_eq!(same.path(), staged.path());
    drop((staged, same));
    lib.factory.unmount_all().unwrap();
    assert!(dir_names(&lib.staging()).is_empty());
}

#[test]
fn test_large_comic_stages_every_page() {
    let lib = Library::new();
    let pages: Vec<(String, Vec<u8>)> = (0..400)
        .map(|i| (format!("pages/{:04}.png", i), format!("page {}", i).into_bytes()))
        .collect();
    let mut raw: Vec<(&str, &[u8])> = pages.iter().map(|(n, d)| (n.as_str(), d.as_slice())).collect();
    // A duplicated name stages the first copy, as lookups do.
    raw.push(("pages/0000.png", b"shadowed"));
    fs::write(lib.file("big.cbz"), raw_stored_zip(&raw)).unwrap();

    let comic = lib.factory.container(&lib.path("big.cbz")).unwrap();
    let lease = lib.factory.mounts().acquire(&comic).unwrap();
    assert_eq!(dir_names(&lease.join("pages")).len(), 400);
    for (name, data) in pages.iter().step_by(37) {
        assert_eq!(&fs::read(lease.join(name)).unwrap(), data);
    }
    assert_eq!(fs::read(lease.join("pages/0000.png")).unwrap(), b"page 0");
}
