//! Lazily loaded entry streams.
//!
//! A [`LazyEntryStream`] stands for the bytes of one archive entry. Creating
//! it does no I/O; the first operation that needs the bytes runs the
//! entry's [`EntrySource`] once and buffers the result. Streams created with
//! [`LazyEntryStream::reader`] share that buffer but keep their own
//! position.
//!
//! Load states:
//!
//! ```text
//! Unloaded --read--> Loading --ok--> Loaded --close--> Closed --read--> Loading ...
//!                       \--err--> Failed --close--> Closed
//! ```
//!
//! Concurrent first reads perform a single load; the others block until it
//! finishes and then see the same bytes, or the same error. A failed stream
//! is not retried automatically.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::{Error, Result};

/// Produces an entry's complete bytes.
pub trait EntrySource: Send + Sync {
    /// Loads the bytes. Called at most once per load cycle.
    fn load(&self) -> Result<Vec<u8>>;
}

/// An [`EntrySource`] backed by a closure.
pub struct FnSource<F> {
    load: F,
}

impl<F> EntrySource for FnSource<F>
where
    F: Fn() -> Result<Vec<u8>> + Send + Sync,
{
    fn load(&self) -> Result<Vec<u8>> {
        (self.load)()
    }
}

/// Creates an [`EntrySource`] from a closure.
pub fn source_fn<F>(load: F) -> FnSource<F>
where
    F: Fn() -> Result<Vec<u8>> + Send + Sync,
{
    FnSource { load }
}

enum LoadState {
    Unloaded,
    Loading,
    Loaded(Arc<[u8]>),
    Failed(Error),
    Closed,
}

struct LoadCell {
    source: Arc<dyn EntrySource>,
    state: Mutex<LoadState>,
    ready: Condvar,
    loads: AtomicU64,
}

/// Puts a cell back into `Unloaded` if the source panics.
struct LoadingGuard<'a> {
    cell: &'a LoadCell,
    armed: bool,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.cell.lock();
            if matches!(*state, LoadState::Loading) {
                *state = LoadState::Unloaded;
            }
            self.cell.ready.notify_all();
        }
    }
}

impl LoadCell {
    fn lock(&self) -> MutexGuard<'_, LoadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bytes(&self) -> Result<Arc<[u8]>> {
        let mut state = self.lock();
        loop {
            match &*state {
                LoadState::Loaded(bytes) => return Ok(Arc::clone(bytes)),
                LoadState::Failed(e) => return Err(e.duplicate()),
                LoadState::Loading => {
                    state = self.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
                LoadState::Unloaded | LoadState::Closed => break,
            }
        }
        *state = LoadState::Loading;
        drop(state);

        let mut guard = LoadingGuard { cell: self, armed: true };
        self.loads.fetch_add(1, Ordering::Relaxed);
        let result = self.source.load();
        guard.armed = false;

        let mut state = self.lock();
        // close() during the load wins; the caller still gets its result.
        let store = matches!(*state, LoadState::Loading);
        let result = match result {
            Ok(bytes) => {
                let bytes: Arc<[u8]> = bytes.into();
                if store {
                    *state = LoadState::Loaded(Arc::clone(&bytes));
                }
                Ok(bytes)
            }
            Err(e) => {
                if store {
                    *state = LoadState::Failed(e.duplicate());
                }
                Err(e)
            }
        };
        self.ready.notify_all();
        result
    }

    fn close(&self) {
        let mut state = self.lock();
        if !matches!(*state, LoadState::Unloaded) {
            *state = LoadState::Closed;
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Cursor {
    pos: u64,
    mark: u64,
}

/// A seekable, lazily loaded stream over one entry's bytes.
///
/// Implements [`Read`] and [`Seek`] both by value and through `&self`, so
/// one stream can be read from several places in turn. For independent
/// positions use [`reader`](Self::reader).
///
/// # Example
///
/// ```rust
/// use std::io::Read;
/// use archfs::LazyEntryStream;
/// use archfs::stream::source_fn;
///
/// let mut stream = LazyEntryStream::new(source_fn(|| Ok(b"<info/>".to_vec())));
/// assert!(!stream.is_loaded());
///
/// let mut text = String::new();
/// stream.read_to_string(&mut text)?;
/// assert_eq!(text, "<info/>");
/// assert_eq!(stream.load_count(), 1);
/// # Ok::<(), std::io::Error>(())
/// ```
pub struct LazyEntryStream {
    cell: Arc<LoadCell>,
    cursor: Mutex<Cursor>,
}

impl fmt::Debug for LazyEntryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyEntryStream")
            .field("loaded", &self.is_loaded())
            .field("position", &self.position())
            .finish_non_exhaustive()
    }
}

fn into_io(e: Error) -> io::Error {
    match e {
        Error::Io(e) => e,
        other => io::Error::other(other),
    }
}

impl LazyEntryStream {
    /// Creates a stream. No I/O happens until the bytes are needed.
    pub fn new(source: impl EntrySource + 'static) -> Self {
        Self::from_source(Arc::new(source))
    }

    /// Creates a stream over a shared source.
    pub fn from_source(source: Arc<dyn EntrySource>) -> Self {
        Self {
            cell: Arc::new(LoadCell {
                source,
                state: Mutex::new(LoadState::Unloaded),
                ready: Condvar::new(),
                loads: AtomicU64::new(0),
            }),
            cursor: Mutex::new(Cursor::default()),
        }
    }

    /// Returns a new stream positioned at the start that shares this
    /// stream's buffer.
    pub fn reader(&self) -> LazyEntryStream {
        Self {
            cell: Arc::clone(&self.cell),
            cursor: Mutex::new(Cursor::default()),
        }
    }

    fn cursor(&self) -> MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the complete entry bytes, loading them if needed.
    pub fn bytes(&self) -> Result<Arc<[u8]>> {
        self.cell.bytes()
    }

    /// Returns the number of bytes left after the current position.
    pub fn available(&self) -> Result<u64> {
        let len = self.cell.bytes()?.len() as u64;
        Ok(len.saturating_sub(self.cursor().pos))
    }

    /// Remembers the current position for [`reset`](Self::reset).
    ///
    /// The whole entry is buffered, so a mark never expires.
    pub fn mark(&self) {
        let mut cursor = self.cursor();
        cursor.mark = cursor.pos;
    }

    /// Returns to the last mark, or to the start if none was set.
    pub fn reset(&self) {
        let mut cursor = self.cursor();
        cursor.pos = cursor.mark;
    }

    /// Always true.
    pub fn mark_supported(&self) -> bool {
        true
    }

    /// Releases the buffer and rewinds.
    ///
    /// The next read loads the entry again. Streams sharing the buffer
    /// through [`reader`](Self::reader) reload too. Closing also clears a
    /// recorded load failure.
    pub fn close(&self) {
        self.cell.close();
        *self.cursor() = Cursor::default();
    }

    /// Returns the current position.
    pub fn position(&self) -> u64 {
        self.cursor().pos
    }

    /// Returns true if the bytes are buffered.
    pub fn is_loaded(&self) -> bool {
        matches!(*self.cell.lock(), LoadState::Loaded(_))
    }

    /// Returns how many times the source has been asked to load.
    pub fn load_count(&self) -> u64 {
        self.cell.loads.load(Ordering::Relaxed)
    }

    fn read_at_cursor(&self, buf: &mut [u8]) -> io::Result<usize> {
        let bytes = self.cell.bytes().map_err(into_io)?;
        let mut cursor = self.cursor();
        let start = cursor.pos.min(bytes.len() as u64) as usize;
        let n = buf.len().min(bytes.len() - start);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        cursor.pos += n as u64;
        Ok(n)
    }

    fn seek_cursor(&self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.cell.bytes().map_err(into_io)?.len() as u64;
        let mut cursor = self.cursor();
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(off) => len.checked_add_signed(off),
            SeekFrom::Current(off) => cursor.pos.checked_add_signed(off),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative or overflowing position")
        })?;
        cursor.pos = target;
        Ok(target)
    }
}

impl Read for LazyEntryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_at_cursor(buf)
    }
}

impl Read for &LazyEntryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_at_cursor(buf)
    }
}

impl Seek for LazyEntryStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.seek_cursor(pos)
    }
}

impl Seek for &LazyEntryStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.seek_cursor(pos)
    }
}
