//! Staged mounts of containers on the real filesystem.
//!
//! Some consumers need a real directory rather than bytes: a viewer that
//! opens files by path, an external converter. A mount extracts a
//! container's entries into a staging directory under the configured
//! staging root and hands out [`MountLease`]s for it.
//!
//! Mounts are keyed by container identity and generation, so a write to a
//! container never changes what an existing lease sees; the next acquire
//! stages the new generation. Identity and generation are process-wide, so
//! factories sharing a registry also share its mounts. Leases only count references. Directories are deleted by the
//! [`unmount_all`](MountRegistry::unmount_all) checkpoint, usually run by an
//! [`OperationScope`](crate::OperationScope) at the end of a user operation.
//!
//! # Example
//!
//! ```rust,no_run
//! use archfs::{ResourceHandlerFactory, mount};
//!
//! let factory = ResourceHandlerFactory::default();
//! let comic = factory.container("/comics/issue1.cbz")?;
//! let lease = mount::global().acquire(&comic)?;
//! println!("pages staged at {}", lease.path().display());
//! drop(lease);
//! archfs::unmount_all()?;
//! # Ok::<(), archfs::Error>(())
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use filetime::FileTime;
use tempfile::TempDir;

use crate::container::{ContainerDescriptor, Snapshot};
use crate::safety::validate_staging_path;
use crate::{EntryPath, Error, ResolverConfig, Result};

/// Container identity (absolute file path plus entry chain) and generation.
type MountKey = (String, u64);

enum MountState {
    Staging,
    Ready(TempDir),
}

struct MountEntry {
    /// Logical path, for logs and [`Error::MountBusy`].
    container: String,
    state: MountState,
    refs: usize,
}

impl MountEntry {
    fn is_idle(&self) -> bool {
        matches!(self.state, MountState::Ready(_)) && self.refs == 0
    }
}

/// Table of staged containers with reference counts.
pub struct MountRegistry {
    staging_root: PathBuf,
    unmount_timeout: Duration,
    table: Mutex<HashMap<MountKey, MountEntry>>,
    changed: Condvar,
}

impl fmt::Debug for MountRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountRegistry")
            .field("staging_root", &self.staging_root)
            .field("mounted", &self.mounted_count())
            .finish_non_exhaustive()
    }
}

/// Removes a `Staging` placeholder if staging unwinds.
struct StagingGuard<'a> {
    registry: &'a MountRegistry,
    key: &'a MountKey,
    armed: bool,
}

impl Drop for StagingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.lock().remove(self.key);
            self.registry.changed.notify_all();
        }
    }
}

impl MountRegistry {
    /// Creates a registry using the config's staging root and unmount
    /// timeout.
    pub fn new(config: &ResolverConfig) -> Arc<Self> {
        Arc::new(Self {
            staging_root: config.effective_staging_root(),
            unmount_timeout: config.unmount_timeout,
            table: Mutex::new(HashMap::new()),
            changed: Condvar::new(),
        })
    }

    /// Returns the directory mounts are staged under.
    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<MountKey, MountEntry>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the number of staged or staging mounts.
    pub fn mounted_count(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if the container's current generation is mounted.
    pub fn is_mounted(&self, container: &ContainerDescriptor) -> bool {
        let key = (container.identity().to_string(), container.generation());
        matches!(
            self.lock().get(&key),
            Some(MountEntry {
                state: MountState::Ready(_),
                ..
            })
        )
    }

    /// Mounts the container's current generation and takes a reference.
    ///
    /// The first caller stages the extraction; concurrent callers for the
    /// same generation wait for it and share the directory. Descriptors of
    /// the same file from different factories share mounts. The table lock
    /// is not held while extracting.
    ///
    /// # Errors
    ///
    /// Any codec or I/O error from staging, or [`Error::PathTraversal`] for
    /// entries that would land outside the staging directory. A failed
    /// staging leaves no directory behind.
    pub fn acquire(self: &Arc<Self>, container: &ContainerDescriptor) -> Result<MountLease> {
        let current: MountKey = (container.identity().to_string(), container.generation());
        if let Some(lease) = self.join(&current, None) {
            return Ok(lease);
        }

        // The key comes from the snapshot, which may be newer than `current`.
        let snapshot = container.snapshot()?;
        let key: MountKey = (current.0, snapshot.generation);
        if let Some(lease) = self.join(&key, Some(container.key())) {
            return Ok(lease);
        }

        let mut guard = StagingGuard {
            registry: self,
            key: &key,
            armed: true,
        };
        let dir = self.stage(container, &snapshot)?;
        guard.armed = false;
        drop(guard);

        let path = dir.path().to_path_buf();
        let mut table = self.lock();
        table.insert(
            key.clone(),
            MountEntry {
                container: container.key().to_string(),
                state: MountState::Ready(dir),
                refs: 1,
            },
        );
        drop(table);
        self.changed.notify_all();
        log::debug!(
            "mounted '{}' generation {} at '{}'",
            container.key(),
            key.1,
            path.display()
        );
        Ok(self.lease(key, container.key().to_string(), path))
    }

    /// Takes a reference on a ready mount, waiting out a concurrent staging
    /// of the same key.
    ///
    /// When nothing is mounted under `key` and `placeholder` names the
    /// container, a `Staging` entry is left for the caller to fill.
    fn join(self: &Arc<Self>, key: &MountKey, placeholder: Option<&str>) -> Option<MountLease> {
        let mut table = self.lock();
        loop {
            let staging = match table.get_mut(key) {
                Some(entry) => match &entry.state {
                    MountState::Ready(dir) => {
                        entry.refs += 1;
                        let path = dir.path().to_path_buf();
                        let container = entry.container.clone();
                        return Some(self.lease(key.clone(), container, path));
                    }
                    MountState::Staging => true,
                },
                None => false,
            };
            if !staging {
                break;
            }
            table = self.changed.wait(table).unwrap_or_else(PoisonError::into_inner);
        }
        if let Some(container) = placeholder {
            table.insert(
                key.clone(),
                MountEntry {
                    container: container.to_string(),
                    state: MountState::Staging,
                    refs: 0,
                },
            );
        }
        None
    }

    fn lease(self: &Arc<Self>, key: MountKey, container: String, path: PathBuf) -> MountLease {
        MountLease {
            registry: Arc::clone(self),
            key,
            container,
            path,
        }
    }

    /// Extracts a snapshot into a fresh directory, parsing it once.
    fn stage(&self, container: &ContainerDescriptor, snapshot: &Snapshot) -> Result<TempDir> {
        fs::create_dir_all(&self.staging_root)?;
        let dir = tempfile::Builder::new()
            .prefix("mount-")
            .tempdir_in(&self.staging_root)?;
        log::debug!(
            "staging '{}' generation {} into '{}'",
            container.key(),
            snapshot.generation,
            dir.path().display()
        );

        let mut staged = HashSet::new();
        snapshot.codec.for_each_entry(&snapshot.bytes, &mut |info, read| {
            let entry = EntryPath::normalize(&info.path).map_err(|_| Error::PathTraversal {
                path: info.path.clone(),
            })?;
            let target = validate_staging_path(&entry, dir.path())?;

            if info.is_directory {
                fs::create_dir_all(&target)?;
                return Ok(());
            }
            // First entry of a duplicated path wins, as in lookups.
            if !staged.insert(entry.as_str().to_string()) {
                return Ok(());
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let data = read().map_err(|e| e.with_container(container.key()))?;
            fs::write(&target, data)?;

            if let Some(modified) = info.last_modified {
                let mtime = FileTime::from_system_time(modified);
                if let Err(e) = filetime::set_file_mtime(&target, mtime) {
                    log::warn!(
                        "Failed to set modification time on '{}': {}",
                        target.display(),
                        e
                    );
                }
            }
            Ok(())
        })?;
        log::trace!("staged {} file(s) of '{}'", staged.len(), container.key());
        Ok(dir)
    }

    fn release(&self, key: &MountKey) {
        let mut table = self.lock();
        if let Some(entry) = table.get_mut(key) {
            entry.refs = entry.refs.saturating_sub(1);
        }
        drop(table);
        self.changed.notify_all();
    }

    /// Runs the checkpoint with the configured timeout.
    pub fn unmount_all(&self) -> Result<()> {
        self.unmount_all_with_timeout(self.unmount_timeout)
    }

    /// Waits up to `timeout` for leases to drain, then deletes every idle
    /// staging directory.
    ///
    /// Directory deletion failures are logged, not returned.
    ///
    /// # Errors
    ///
    /// [`Error::MountBusy`] listing containers still referenced (or still
    /// staging) when the timeout elapsed. They stay mounted; everything
    /// else has been released.
    pub fn unmount_all_with_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut table = self.lock();
        loop {
            if table.values().all(MountEntry::is_idle) {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            table = self
                .changed
                .wait_timeout(table, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        let idle: Vec<MountKey> = table
            .iter()
            .filter(|(_, entry)| entry.is_idle())
            .map(|(key, _)| key.clone())
            .collect();
        let mut released = Vec::with_capacity(idle.len());
        for key in idle {
            if let Some(MountEntry {
                container,
                state: MountState::Ready(dir),
                ..
            }) = table.remove(&key)
            {
                released.push((container, dir));
            }
        }
        let mut busy: Vec<String> = table.values().map(|entry| entry.container.clone()).collect();
        drop(table);

        for (container, dir) in released {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => log::debug!("unmounted '{}'", container),
                Err(e) => log::warn!(
                    "Failed to remove staging directory '{}' of '{}': {}",
                    path.display(),
                    container,
                    e
                ),
            }
        }
        // Removes the root only when it is empty.
        let _ = fs::remove_dir(&self.staging_root);

        if busy.is_empty() {
            Ok(())
        } else {
            busy.sort();
            busy.dedup();
            log::warn!("mounts still in use after checkpoint: {}", busy.join(", "));
            Err(Error::MountBusy { containers: busy })
        }
    }
}

/// A counted reference to a mounted container.
///
/// Dereferences to the staging directory. Dropping the lease releases the
/// reference; the directory stays until the next checkpoint.
pub struct MountLease {
    registry: Arc<MountRegistry>,
    key: MountKey,
    container: String,
    path: PathBuf,
}

impl MountLease {
    /// Returns the staging directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the logical path of the mounted container, as given by
    /// whoever staged it.
    pub fn container_key(&self) -> &str {
        &self.container
    }

    /// Returns the container generation this mount shows.
    pub fn generation(&self) -> u64 {
        self.key.1
    }

    /// Releases the reference. Same as dropping the lease.
    pub fn release(self) {}
}

impl fmt::Debug for MountLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountLease")
            .field("container", &self.container)
            .field("generation", &self.key.1)
            .field("path", &self.path)
            .finish()
    }
}

impl Deref for MountLease {
    type Target = Path;

    fn deref(&self) -> &Path {
        &self.path
    }
}

impl AsRef<Path> for MountLease {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl Drop for MountLease {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

/// Returns the process-wide registry, configured with defaults.
pub fn global() -> &'static Arc<MountRegistry> {
    static GLOBAL: OnceLock<Arc<MountRegistry>> = OnceLock::new();
    GLOBAL.get_or_init(|| MountRegistry::new(&ResolverConfig::default()))
}

/// Runs the checkpoint on the process-wide registry.
pub fn unmount_all() -> Result<()> {
    global().unmount_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    struct Fixture {
        _dir: TempDir,
        staging: PathBuf,
        registry: Arc<MountRegistry>,
        container: ContainerDescriptor,
    }

    fn fixture(entries: &[(&str, &[u8])]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let staging = dir.path().join("staging");
        let config = ResolverConfig::new().staging_root(&staging);
        let path = dir.path().join("comic.cbz");
        let container = ContainerDescriptor::open_file(&path, "comic.cbz", &config).unwrap();
        for (name, data) in entries {
            let _ = container
                .append_or_replace(EntryPath::new(name).unwrap(), data.to_vec())
                .unwrap();
        }
        Fixture {
            _dir: dir,
            staging,
            registry: MountRegistry::new(&config),
            container,
        }
    }

    fn staged_dirs(staging: &Path) -> usize {
        fs::read_dir(staging).map(|d| d.count()).unwrap_or(0)
    }

    #[test]
    fn test_acquire_stages_entries() {
        let f = fixture(&[("p1.png", b"one"), ("extra/p2.png", b"two")]);
        let lease = f.registry.acquire(&f.container).unwrap();
        assert_eq!(fs::read(lease.join("p1.png")).unwrap(), b"one");
        assert_eq!(fs::read(lease.path().join("extra/p2.png")).unwrap(), b"two");
        assert!(f.registry.is_mounted(&f.container));
        assert_eq!(lease.container_key(), "comic.cbz");
    }

    #[test]
    fn test_acquire_is_idempotent_per_generation() {
        let f = fixture(&[("a", b"1")]);
        let first = f.registry.acquire(&f.container).unwrap();
        let second = f.registry.acquire(&f.container).unwrap();
        assert_eq!(first.path(), second.path());
        assert_eq!(staged_dirs(&f.staging), 1);

        let _ = f
            .container
            .append_or_replace(EntryPath::new("b").unwrap(), b"2".to_vec())
            .unwrap();
        let third = f.registry.acquire(&f.container).unwrap();
        assert_ne!(third.path(), first.path());
        assert!(third.join("b").exists());
        assert!(!first.join("b").exists());
    }

    #[test]
    fn test_unmount_waits_for_leases_then_reports_busy() {
        let f = fixture(&[("a", b"1")]);
        let lease = f.registry.acquire(&f.container).unwrap();
        let err = f
            .registry
            .unmount_all_with_timeout(Duration::from_millis(20))
            .unwrap_err();
        match err {
            Error::MountBusy { containers } => assert_eq!(containers, vec!["comic.cbz"]),
            other => panic!("expected MountBusy, got {:?}", other),
        }
        assert!(lease.join("a").exists());

        lease.release();
        f.registry.unmount_all_with_timeout(Duration::from_millis(20)).unwrap();
        assert_eq!(f.registry.mounted_count(), 0);
        assert_eq!(staged_dirs(&f.staging), 0);
    }

    #[test]
    fn test_unmount_waits_for_late_release() {
        let f = fixture(&[("a", b"1")]);
        let lease = f.registry.acquire(&f.container).unwrap();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            drop(lease);
        });
        f.registry.unmount_all_with_timeout(Duration::from_secs(5)).unwrap();
        releaser.join().unwrap();
        assert_eq!(f.registry.mounted_count(), 0);
    }

    #[test]
    fn test_concurrent_acquires_stage_once() {
        let f = fixture(&[("a", b"1"), ("b", b"2")]);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&f.registry);
                let container = f.container.clone();
                thread::spawn(move || {
                    let lease = registry.acquire(&container).unwrap();
                    lease.path().to_path_buf()
                })
            })
            .collect();
        let paths: Vec<PathBuf> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(paths.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(staged_dirs(&f.staging), 1);

        f.registry.unmount_all().unwrap();
        assert_eq!(staged_dirs(&f.staging), 0);
    }

    #[test]
    fn test_failed_staging_leaves_nothing() {
        let f = fixture(&[]);
        fs::write(f.container.file_path().unwrap(), b"PK\x03\x04 truncated").unwrap();
        let err = f.registry.acquire(&f.container).unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(f.registry.mounted_count(), 0);
        assert_eq!(staged_dirs(&f.staging), 0);
    }

    #[test]
    fn test_descriptors_of_same_file_share_mounts() {
        let f = fixture(&[("a", b"1")]);
        let config = ResolverConfig::new().staging_root(&f.staging);
        let path = f.container.file_path().unwrap().to_path_buf();
        let other = ContainerDescriptor::open_file(&path, "again/comic.cbz", &config).unwrap();

        let first = f.registry.acquire(&f.container).unwrap();
        let second = f.registry.acquire(&other).unwrap();
        assert_eq!(first.path(), second.path());
        assert_eq!(second.container_key(), "comic.cbz");

        let _ = other
            .append_or_replace(EntryPath::new("a").unwrap(), b"2".to_vec())
            .unwrap();
        let third = f.registry.acquire(&f.container).unwrap();
        assert_ne!(third.path(), first.path());
        assert_eq!(fs::read(third.join("a")).unwrap(), b"2");
    }

    #[test]
    fn test_lease_generation_matches_staged_bytes() {
        let f = fixture(&[("a", b"1")]);
        for round in 2..5u8 {
            let lease = f.registry.acquire(&f.container).unwrap();
            assert_eq!(lease.generation(), f.container.generation());
            let staged = fs::read(lease.join("a")).unwrap();
            assert_eq!(staged, [b'0' + round - 1]);
            let _ = f
                .container
                .append_or_replace(EntryPath::new("a").unwrap(), vec![b'0' + round])
                .unwrap();
        }
    }
}
