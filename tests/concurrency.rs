//! Concurrent reads and writes through shared containers.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use archfs::stream::source_fn;
use archfs::{EntryPath, EntrySource, Error, LazyEntryStream};

use common::Library;

#[test]
fn test_concurrent_first_reads_extract_once() {
    let lib = Library::new();
    let books = lib.container_with("books.zip", &[("big.bin", &[7u8; 64 * 1024])]);

    let extractions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&extractions);
    let source = books.entry_source(EntryPath::new("big.bin").unwrap());
    let stream = LazyEntryStream::new(source_fn(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        source.load()
    }));

    let threads = 16;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let reader = stream.reader();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                reader.bytes().unwrap().to_vec()
            })
        })
        .collect();

    for handle in handles {
        let bytes = handle.join().unwrap();
        assert_eq!(bytes.len(), 64 * 1024);
        assert!(bytes.iter().all(|b| *b == 7));
    }
    assert_eq!(extractions.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failed_load_reaches_every_waiting_reader() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let stream = LazyEntryStream::new(source_fn(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        Err(Error::corrupt(0x40, "bad local header"))
    }));

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let reader = stream.reader();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                reader.bytes().map(|b| b.len())
            })
        })
        .collect();

    for handle in handles {
        match handle.join().unwrap() {
            Err(Error::CorruptContainer { offset, reason }) => {
                assert_eq!(offset, 0x40);
                assert_eq!(reason, "bad local header");
            }
            other => panic!("expected CorruptContainer, got {:?}", other),
        }
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(stream.load_count(), 1);

    // Still failed without another attempt until the stream is closed.
    assert!(stream.bytes().unwrap_err().is_corruption());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    stream.close();
    assert!(stream.bytes().is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[test]
fn test_concurrent_writers_to_one_container() {
    let lib = Library::new();
    lib.container_with("books.zip", &[("seed.txt", b"seed")]);

    let threads = 8;
    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let factory = lib.factory.clone();
            let path = lib.path(&format!("books.zip/entry{}.txt", i));
            thread::spawn(move || {
                let mut handle = factory.resolve(&path).unwrap();
                handle.write(format!("writer {}", i).as_bytes()).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let names = lib.entry_names("books.zip");
    assert_eq!(names.len(), threads + 1);
    for i in 0..threads {
        let mut handle = lib.factory.resolve(&lib.path(&format!("books.zip/entry{}.txt", i))).unwrap();
        assert_eq!(handle.read_bytes().unwrap(), format!("writer {}", i).as_bytes());
    }
    let container = lib.factory.container(&lib.path("books.zip")).unwrap();
    assert_eq!(container.generation(), threads as u64 + 1);
}

#[test]
fn test_readers_see_whole_snapshots_during_writes() {
    let lib = Library::new();
    lib.container_with("books.zip", &[("page.txt", b"version 0")]);

    let writer_factory = lib.factory.clone();
    let writer_path = lib.path("books.zip/page.txt");
    let writer = thread::spawn(move || {
        let mut handle = writer_factory.resolve(&writer_path).unwrap();
        for v in 1..=20 {
            handle.write(format!("version {}", v).as_bytes()).unwrap();
        }
    });

    let mut reader = lib.factory.resolve(&lib.path("books.zip/page.txt")).unwrap();
    for _ in 0..50 {
        let bytes = reader.read_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("version "), "torn read: {:?}", text);
    }
    writer.join().unwrap();
    assert_eq!(reader.read_bytes().unwrap(), b"version 20");
}

#[test]
fn test_concurrent_mount_acquires_share_one_staging() {
    let lib = Library::new();
    let comic = lib.container_with("comic.cbz", &[("001.png", b"one"), ("002.png", b"two")]);

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let mounts = Arc::clone(lib.factory.mounts());
            let comic = comic.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let lease = mounts.acquire(&comic).unwrap();
                lease.path().to_path_buf()
            })
        })
        .collect();
    let paths: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(paths.iter().all(|p| *p == paths[0]));
    assert_eq!(common::dir_names(&lib.staging()).len(), 1);

    lib.factory.unmount_all().unwrap();
    assert!(common::dir_names(&lib.staging()).is_empty());
}
