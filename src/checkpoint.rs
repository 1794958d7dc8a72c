//! Checkpoints at the end of user operations.
//!
//! Mounts outlive the reads that created them so that a burst of accesses
//! to one container stages it once. They are released at checkpoints: an
//! [`OperationScope`] runs one when the operation it spans ends, including
//! by an early return or a panic.
//!
//! Declare the scope before any lease it should sweep. Locals drop in
//! reverse order, so leases taken later in the same block are released
//! before the checkpoint runs.
//!
//! ```rust,no_run
//! use archfs::ResourceHandlerFactory;
//!
//! fn import_comic(factory: &ResourceHandlerFactory, path: &str) -> archfs::Result<()> {
//!     let _scope = factory.scope();
//!     let cover = factory.resolve(&format!("{}/cover.jpg", path))?;
//!     let staged = cover.materialize()?;
//!     println!("cover at {}", staged.display());
//!     Ok(())
//! } // mounts are swept here
//! ```

use std::sync::Arc;

use crate::Result;
use crate::mount::{self, MountRegistry};

/// Runs [`MountRegistry::unmount_all`] when dropped.
///
/// Failures, including [`Error::MountBusy`](crate::Error::MountBusy), are
/// logged; use [`finish`](Self::finish) to observe them instead.
///
/// The checkpoint waits for outstanding leases for the registry's unmount
/// timeout (30 seconds by default). A lease still held by the thread that
/// ends the scope cannot be released during that wait, so that thread blocks
/// for the whole timeout and the mount is reported busy. Release leases
/// before ending the scope.
#[must_use = "the checkpoint runs when the scope is dropped"]
#[derive(Debug)]
pub struct OperationScope {
    registry: Arc<MountRegistry>,
    finished: bool,
}

impl OperationScope {
    /// Starts a scope over `registry`.
    pub fn new(registry: Arc<MountRegistry>) -> Self {
        Self {
            registry,
            finished: false,
        }
    }

    /// Starts a scope over the process-wide registry.
    pub fn global() -> Self {
        Self::new(Arc::clone(mount::global()))
    }

    /// Returns the registry swept at the end.
    pub fn registry(&self) -> &Arc<MountRegistry> {
        &self.registry
    }

    /// Ends the scope now and returns the checkpoint's result.
    pub fn finish(mut self) -> Result<()> {
        self.finished = true;
        self.registry.unmount_all()
    }
}

impl Drop for OperationScope {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.registry.unmount_all() {
            log::warn!("checkpoint at end of operation failed: {}", e);
        }
    }
}

/// Runs `f` inside an [`OperationScope`] over the process-wide registry.
pub fn run<T, F>(f: F) -> T
where
    F: FnOnce() -> T,
{
    let _scope = OperationScope::global();
    f()
}
