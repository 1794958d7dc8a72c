//! Failed and cancelled rewrites leave containers as they were.

mod common;

use std::fs;
use std::io::{self, Write};
use std::thread;
use std::time::Duration;

use archfs::format::{CodecOptions, ContainerFormat, codec_for};
use archfs::progress::AtomicProgress;
use archfs::{ContainerEditor, EntryEdit, EntryPath, Error, progress_fn};

use common::{Library, dir_names};

/// A writer that accepts `budget` bytes and then fails.
struct FailingWriter {
    budget: usize,
}

impl Write for FailingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.budget == 0 {
            return Err(io::Error::other("disk full"));
        }
        let n = buf.len().min(self.budget);
        self.budget -= n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_cancel_mid_rewrite_keeps_container() {
    let lib = Library::new();
    let books = lib.container_with(
        "books.zip",
        &[("a.txt", b"alpha"), ("b.txt", b"beta"), ("c.txt", b"gamma")],
    );
    let before = fs::read(lib.file("books.zip")).unwrap();
    let generation = books.generation();

    let mut editor = ContainerEditor::new(books.clone());
    editor.put("b.txt", b"BETA".to_vec()).unwrap();
    editor.put("d.txt", b"delta".to_vec()).unwrap();

    // Stop after the first entry is written.
    let mut progress = progress_fn(|done, _total| done < 1);
    let err = editor.apply_with_progress(&mut progress).unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    assert_eq!(fs::read(lib.file("books.zip")).unwrap(), before);
    assert_eq!(books.generation(), generation);
    assert_eq!(dir_names(lib.dir.path()), vec!["books.zip"]);
}

#[test]
fn test_cancel_before_start_keeps_rar_container() {
    let lib = Library::new();
    let comic = lib.container_with("issue1.cbr", &[("p1.png", b"one"), ("p2.png", b"two")]);
    let before = fs::read(lib.file("issue1.cbr")).unwrap();

    let progress = AtomicProgress::shared();
    progress.cancel();
    let mut editor = ContainerEditor::new(comic.clone());
    editor.put("p1.png", b"replaced".to_vec()).unwrap();
    let err = editor.apply_with_progress(&mut progress.clone()).unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(progress.entries_done(), 0);

    assert_eq!(fs::read(lib.file("issue1.cbr")).unwrap(), before);
    let mut page = lib.factory.resolve(&lib.path("issue1.cbr/p1.png")).unwrap();
    assert_eq!(page.read_bytes().unwrap(), b"one");
}

#[test]
fn test_failing_output_propagates_io_error() {
    for format in [ContainerFormat::Zip, ContainerFormat::Rar] {
        let codec = codec_for(format, &CodecOptions::default());
        let mut container = Vec::new();
        let _ = codec
            .rewrite(
                &[],
                &[EntryEdit::new(EntryPath::new("a.txt").unwrap(), vec![1u8; 4096])],
                &mut container,
                &mut archfs::NoProgress,
            )
            .unwrap();

        let edits = [EntryEdit::new(EntryPath::new("b.txt").unwrap(), vec![2u8; 4096])];
        let err = codec
            .rewrite(
                &container,
                &edits,
                &mut FailingWriter { budget: 100 },
                &mut archfs::NoProgress,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)), "{}: {:?}", format, err);
    }
}

#[test]
fn test_corrupt_container_is_not_rewritten() {
    let lib = Library::new();
    fs::write(lib.file("broken.zip"), b"PK\x03\x04 not a real archive").unwrap();

    let mut entry = lib.factory.resolve(&lib.path("broken.zip/a.txt")).unwrap();
    let err = entry.write(b"data").unwrap_err();
    assert!(err.is_corruption(), "{:?}", err);
    assert_eq!(fs::read(lib.file("broken.zip")).unwrap(), b"PK\x03\x04 not a real archive");
    assert_eq!(dir_names(lib.dir.path()), vec!["broken.zip"]);
}

#[test]
fn test_failed_nested_rewrite_keeps_outer() {
    let lib = Library::new();
    lib.container_with("outer.zip", &[("readme.txt", b"outer")]);
    // Not a container, only named like one.
    let outer = lib.factory.container(&lib.path("outer.zip")).unwrap();
    let _ = outer
        .append_or_replace(EntryPath::new("inner.zip").unwrap(), b"PK\x03\x04 junk".to_vec())
        .unwrap();
    let before = fs::read(lib.file("outer.zip")).unwrap();

    let mut page = lib.factory.resolve(&lib.path("outer.zip/inner.zip/page.txt")).unwrap();
    assert!(page.write(b"page").unwrap_err().is_corruption());
    assert_eq!(fs::read(lib.file("outer.zip")).unwrap(), before);
}

#[test]
fn test_outer_write_during_nested_rewrite_is_kept() {
    let lib = Library::new();
    lib.container_with("outer.zip/inner.zip", &[("p1.txt", b"one"), ("p2.txt", b"two")]);
    let inner = lib.factory.container(&lib.path("outer.zip/inner.zip")).unwrap();

    // Another thread writes to the outer container while the nested rewrite
    // is between reading and storing the inner archive.
    let factory = lib.factory.clone();
    let readme = lib.path("outer.zip/readme.txt");
    let mut writer = None;
    let mut progress = progress_fn(|_, _| {
        if writer.is_none() {
            let factory = factory.clone();
            let readme = readme.clone();
            writer = Some(thread::spawn(move || {
                factory.resolve(&readme)?.write(b"outer note")
            }));
            thread::sleep(Duration::from_millis(100));
        }
        true
    });
    let mut editor = ContainerEditor::new(inner);
    editor.put("p3.txt", b"three".to_vec()).unwrap();
    let _ = editor.apply_with_progress(&mut progress).unwrap();
    drop(progress);
    writer.unwrap().join().unwrap().unwrap();

    assert_eq!(lib.entry_names("outer.zip"), vec!["inner.zip", "readme.txt"]);
    let mut note = lib.factory.resolve(&readme).unwrap();
    assert_eq!(note.read_bytes().unwrap(), b"outer note");
    assert_eq!(lib.entry_names("outer.zip/inner.zip"), vec!["p1.txt", "p2.txt", "p3.txt"]);
}
