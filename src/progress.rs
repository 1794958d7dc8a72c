//! Progress reporting and cancellation for container rewrites.
//!
//! Rewriting a container is not preemptible mid-entry, but the codecs consult
//! the reporter between entries. A reporter that asks for cancellation makes
//! the rewrite fail with [`Error::Cancelled`](crate::Error::Cancelled) and the
//! original container stays untouched.
//!
//! # Example
//!
//! ```rust,ignore
//! use archfs::progress::AtomicProgress;
//!
//! let progress = AtomicProgress::shared();
//! let handle = progress.clone();
//! std::thread::spawn(move || handle.cancel());
//!
//! editor.apply_with_progress(&mut progress.clone())?;
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Progress reporting trait for container rewrites.
///
/// Units are entries, not bytes: a rewrite copies whole entries.
pub trait ProgressReporter: Send {
    /// Called once with the number of entries the new container will hold.
    fn on_total(&mut self, total_entries: u64) {
        let _ = total_entries;
    }

    /// Called after each entry is written.
    ///
    /// Returns `true` to continue or `false` to request cancellation.
    fn on_progress(&mut self, entries_done: u64, total_entries: u64) -> bool {
        let _ = (entries_done, total_entries);
        true
    }

    /// Called when starting to write an entry.
    fn on_entry_start(&mut self, entry_name: &str, size: u64) {
        let _ = (entry_name, size);
    }

    /// Checks if cancellation has been requested.
    ///
    /// Called before each entry. Default implementation returns `false`.
    fn should_cancel(&self) -> bool {
        false
    }
}

/// A progress reporter that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {}

/// A thread-safe progress reporter using atomics.
///
/// Allows progress to be monitored, and the rewrite cancelled, from another
/// thread.
#[derive(Debug, Default)]
pub struct AtomicProgress {
    total_entries: AtomicU64,
    entries_done: AtomicU64,
    cancelled: AtomicBool,
}

impl AtomicProgress {
    /// Creates a new atomic progress reporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a shared atomic progress reporter.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Returns the number of entries the rewrite will produce.
    pub fn total_entries(&self) -> u64 {
        self.total_entries.load(Ordering::Relaxed)
    }

    /// Returns the number of entries written so far.
    pub fn entries_done(&self) -> u64 {
        self.entries_done.load(Ordering::Relaxed)
    }

    /// Returns whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    fn record_total(&self, total: u64) {
        self.total_entries.store(total, Ordering::Relaxed);
    }

    fn record_done(&self, done: u64) -> bool {
        self.entries_done.store(done, Ordering::Relaxed);
        !self.is_cancelled()
    }
}

impl ProgressReporter for AtomicProgress {
    fn on_total(&mut self, total_entries: u64) {
        self.record_total(total_entries);
    }

    fn on_progress(&mut self, entries_done: u64, _total_entries: u64) -> bool {
        self.record_done(entries_done)
    }

    fn should_cancel(&self) -> bool {
        self.is_cancelled()
    }
}

/// Progress reporter for shared `Arc<AtomicProgress>`.
impl ProgressReporter for Arc<AtomicProgress> {
    fn on_total(&mut self, total_entries: u64) {
        self.record_total(total_entries);
    }

    fn on_progress(&mut self, entries_done: u64, _total_entries: u64) -> bool {
        self.record_done(entries_done)
    }

    fn should_cancel(&self) -> bool {
        self.is_cancelled()
    }
}

/// A progress reporter that calls a closure.
pub struct ClosureProgress<F> {
    callback: F,
}

impl<F> ClosureProgress<F>
where
    F: FnMut(u64, u64) -> bool + Send,
{
    /// Creates a progress reporter from a closure.
    ///
    /// The closure receives (entries_done, total_entries) and returns
    /// `true` to continue or `false` to cancel.
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> ProgressReporter for ClosureProgress<F>
where
    F: FnMut(u64, u64) -> bool + Send,
{
    fn on_progress(&mut self, entries_done: u64, total_entries: u64) -> bool {
        (self.callback)(entries_done, total_entries)
    }
}

/// Creates a closure-based progress reporter.
pub fn progress_fn<F>(f: F) -> ClosureProgress<F>
where
    F: FnMut(u64, u64) -> bool + Send,
{
    ClosureProgress::new(f)
}

/// Bookkeeping shared by the codecs' rewrite loops.
///
/// Wraps a reporter, counts entries, and turns a cancellation request into
/// [`Error::Cancelled`](crate::Error::Cancelled).
pub(crate) struct RewriteTicker<'a> {
    reporter: &'a mut dyn ProgressReporter,
    done: u64,
    total: u64,
    cancelled: bool,
}

impl<'a> RewriteTicker<'a> {
    pub(crate) fn new(reporter: &'a mut dyn ProgressReporter, total: u64) -> Self {
        reporter.on_total(total);
        Self {
            reporter,
            done: 0,
            total,
            cancelled: false,
        }
    }

    /// Must be called before writing each entry.
    pub(crate) fn begin(&mut self, name: &str, size: u64) -> crate::Result<()> {
        if self.cancelled || self.reporter.should_cancel() {
            log::debug!("rewrite cancelled before entry '{}'", name);
            return Err(crate::Error::Cancelled);
        }
        self.reporter.on_entry_start(name, size);
        Ok(())
    }

    /// Must be called after writing each entry.
    pub(crate) fn finish(&mut self) {
        self.done += 1;
        if !self.reporter.on_progress(self.done, self.total) {
            self.cancelled = true;
        }
    }
}
