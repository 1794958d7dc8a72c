//! Tests for resource limit enforcement.
//!
//! Unit tests for `LimitedReader` live in src/safety.rs. This file checks that
//! the configured entry size limit holds on every path that extracts bytes.

mod common;

use std::fs;

use archfs::{Error, ResolverConfig};

use common::Library;

fn limited(max: u64) -> Library {
    Library::with_config(ResolverConfig::new().max_entry_size(max))
}

#[test]
fn test_read_over_limit_is_refused() {
    let lib = limited(1024);
    lib.container_with("books.zip", &[("small.txt", &[b'a'; 1024]), ("big.txt", &[b'b'; 1025])]);

    let mut small = lib.factory.resolve(&lib.path("books.zip/small.txt")).unwrap();
    assert_eq!(small.read_bytes().unwrap().len(), 1024);

    let mut big = lib.factory.resolve(&lib.path("books.zip/big.txt")).unwrap();
    let err = big.read_bytes().unwrap_err();
    assert!(matches!(err, Error::ResourceLimitExceeded(_)), "{:?}", err);
}

#[test]
fn test_rar_read_over_limit_is_refused() {
    let lib = limited(16);
    lib.container_with("issue1.cbr", &[("page.png", &[0u8; 64])]);
    let mut page = lib.factory.resolve(&lib.path("issue1.cbr/page.png")).unwrap();
    assert!(matches!(page.read_bytes(), Err(Error::ResourceLimitExceeded(_))));
}

#[test]
fn test_mount_over_limit_leaves_no_staging() {
    let lib = limited(8);
    lib.container_with("comic.cbz", &[("tiny.png", b"ok"), ("huge.png", &[1u8; 100])]);
    let page = lib.factory.resolve(&lib.path("comic.cbz/tiny.png")).unwrap();

    assert!(matches!(page.materialize(), Err(Error::ResourceLimitExceeded(_))));
    assert_eq!(lib.factory.mounts().mounted_count(), 0);
    assert!(common::dir_names(&lib.staging()).is_empty());
}

#[test]
fn test_limit_does_not_block_writes_of_other_entries() {
    let lib = limited(64);
    lib.container_with("books.zip", &[("big.bin", &[9u8; 1000])]);

    // Rewriting copies existing entries without decompressing them.
    let mut other = lib.factory.resolve(&lib.path("books.zip/note.txt")).unwrap();
    other.write(b"note").unwrap();
    assert_eq!(other.read_bytes().unwrap(), b"note");
    assert_eq!(lib.entry_names("books.zip"), vec!["big.bin", "note.txt"]);
    assert!(fs::metadata(lib.file("books.zip")).unwrap().len() > 0);
}
