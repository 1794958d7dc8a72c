//! Uniform handles over plain files and archive entries.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::container::ContainerDescriptor;
use crate::edit::{ContainerEditor, EntryEdit};
use crate::factory::Shared;
use crate::format::{EntryInfo, RewriteSummary};
use crate::mount::MountLease;
use crate::progress::NoProgress;
use crate::resolve::{PathKind, ResourcePath};
use crate::stream::LazyEntryStream;
use crate::{EntryPath, Error, Result};

struct CachedStream {
    generation: u64,
    stream: LazyEntryStream,
}

enum Backend {
    Plain {
        path: PathBuf,
    },
    ArchiveEntry {
        container: ContainerDescriptor,
        entry: EntryPath,
        cached: Option<CachedStream>,
    },
    NestedArchiveEntry {
        outer: ContainerDescriptor,
        inner: ContainerDescriptor,
        entry: EntryPath,
        cached: Option<CachedStream>,
    },
}

/// A resolved resource: a plain file, an archive entry, or an entry of a
/// nested archive.
///
/// Obtained from [`ResourceHandlerFactory::resolve`]. Handles are cheap;
/// they hold no container bytes. Archive-backed handles keep a
/// [`LazyEntryStream`] for their entry, which is rebuilt whenever the
/// container's generation moves on, so a handle never serves bytes from
/// before a write that completed.
///
/// [`ResourceHandlerFactory::resolve`]: crate::ResourceHandlerFactory::resolve
pub struct ResourceHandle {
    path: ResourcePath,
    shared: Arc<Shared>,
    backend: Backend,
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ResourceHandle");
        s.field("path", &self.path.as_str()).field("kind", &self.kind());
        if let Some(container) = self.container() {
            s.field("container", &container.key());
        }
        s.finish()
    }
}

impl ResourceHandle {
    pub(crate) fn build(shared: Arc<Shared>, path: ResourcePath) -> Result<Self> {
        let backend = match path.kind() {
            PathKind::Plain => Backend::Plain {
                path: PathBuf::from(path.as_str()),
            },
            kind => {
                let mut chain = shared.container_chain(&path)?;
                let entry = path
                    .innermost_entry()
                    .cloned()
                    .ok_or_else(|| Error::invalid_path(path.as_str(), "no entry path"))?;
                match (kind, chain.pop()) {
                    (PathKind::ArchiveEntry, Some(container)) => Backend::ArchiveEntry {
                        container,
                        entry,
                        cached: None,
                    },
                    (_, Some(inner)) if !chain.is_empty() => Backend::NestedArchiveEntry {
                        outer: chain.swap_remove(0),
                        inner,
                        entry,
                        cached: None,
                    },
                    _ => return Err(Error::invalid_path(path.as_str(), "no container")),
                }
            }
        };
        Ok(Self {
            path,
            shared,
            backend,
        })
    }

    /// Returns the logical path.
    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// Returns how the resource is backed.
    pub fn kind(&self) -> PathKind {
        match self.backend {
            Backend::Plain { .. } => PathKind::Plain,
            Backend::ArchiveEntry { .. } => PathKind::ArchiveEntry,
            Backend::NestedArchiveEntry { .. } => PathKind::NestedArchiveEntry,
        }
    }

    /// Returns the container holding this entry (the innermost one for
    /// nested entries). `None` for plain files.
    pub fn container(&self) -> Option<&ContainerDescriptor> {
        self.entry_parts().map(|(container, _)| container)
    }

    /// Returns the outermost container file of a nested entry.
    pub fn outer_container(&self) -> Option<&ContainerDescriptor> {
        match &self.backend {
            Backend::NestedArchiveEntry { outer, .. } => Some(outer),
            _ => None,
        }
    }

    /// Returns the entry path within [`container`](Self::container).
    pub fn entry_path(&self) -> Option<&EntryPath> {
        self.entry_parts().map(|(_, entry)| entry)
    }

    /// Returns the filesystem path of a plain handle.
    pub fn file_path(&self) -> Option<&Path> {
        match &self.backend {
            Backend::Plain { path } => Some(path),
            _ => None,
        }
    }

    fn entry_parts(&self) -> Option<(&ContainerDescriptor, &EntryPath)> {
        match &self.backend {
            Backend::Plain { .. } => None,
            Backend::ArchiveEntry { container, entry, .. }
            | Backend::NestedArchiveEntry {
                inner: container,
                entry,
                ..
            } => Some((container, entry)),
        }
    }

    fn cached_mut(&mut self) -> Option<&mut Option<CachedStream>> {
        match &mut self.backend {
            Backend::Plain { .. } => None,
            Backend::ArchiveEntry { cached, .. } | Backend::NestedArchiveEntry { cached, .. } => Some(cached),
        }
    }

    /// Returns the entry's stream, rebuilding it if the container changed.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPathKind`] for plain handles.
    pub fn stream(&mut self) -> Result<&LazyEntryStream> {
        let (container, entry, cached) = match &mut self.backend {
            Backend::Plain { .. } => {
                return Err(Error::invalid_path(self.path.as_str(), "plain files have no entry stream"));
            }
            Backend::ArchiveEntry {
                container,
                entry,
                cached,
            }
            | Backend::NestedArchiveEntry {
                inner: container,
                entry,
                cached,
                ..
            } => (container, entry, cached),
        };

        let generation = container.generation();
        if cached.as_ref().is_some_and(|c| c.generation != generation) {
            log::debug!(
                "'{}' in '{}' changed (generation {}), dropping cached stream",
                entry,
                container.key(),
                generation
            );
            *cached = None;
        }
        let cached = cached.get_or_insert_with(|| CachedStream {
            generation,
            stream: LazyEntryStream::new(container.entry_source(entry.clone())),
        });
        Ok(&cached.stream)
    }

    /// Drops the cached entry stream.
    pub fn invalidate(&mut self) {
        if let Some(cached) = self.cached_mut() {
            *cached = None;
        }
    }

    /// Returns the listing record of this entry.
    ///
    /// `Ok(None)` for plain handles, for entries that are not listed, and
    /// when the container itself does not exist.
    pub fn entry_info(&self) -> Result<Option<EntryInfo>> {
        let Some((container, entry)) = self.entry_parts() else {
            return Ok(None);
        };
        let listing = match self.shared.listing(container) {
            Ok(listing) => listing,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(listing.iter().find(|info| info.path == entry.as_str()).cloned())
    }

    /// Returns true if some listed entry lies below this entry.
    fn has_children(&self) -> bool {
        let Some((container, entry)) = self.entry_parts() else {
            return false;
        };
        let prefix = format!("{}/", entry);
        self.shared
            .listing(container)
            .map(|listing| listing.iter().any(|info| info.path.starts_with(&prefix)))
            .unwrap_or(false)
    }

    /// Returns true if the resource exists.
    ///
    /// Directories implied by deeper entries count as existing. Errors
    /// reading the container are logged and reported as absent.
    pub fn exists(&self) -> bool {
        match &self.backend {
            Backend::Plain { path } => path.exists(),
            _ => match self.entry_info() {
                Ok(Some(_)) => true,
                Ok(None) => self.has_children(),
                Err(e) => {
                    log::debug!("treating '{}' as absent: {}", self.path, e);
                    false
                }
            },
        }
    }

    /// Returns true for directories, including implied ones in archives.
    pub fn is_directory(&self) -> bool {
        match &self.backend {
            Backend::Plain { path } => path.is_dir(),
            _ => match self.entry_info() {
                Ok(Some(info)) => info.is_directory,
                _ => self.has_children(),
            },
        }
    }

    /// Returns true if the resource is an archive by its name.
    ///
    /// Container handles accept [`write_entry`](Self::write_entry) and
    /// [`list_entries`](Self::list_entries).
    pub fn is_container(&self) -> bool {
        let name = match self.entry_parts() {
            Some((_, entry)) => Some(entry.file_name()),
            None => self.path.file_name(),
        };
        name.is_some_and(|name| self.shared.config.format_for_name(name).is_some())
    }

    /// Returns the container this handle names.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPathKind`] unless [`is_container`](Self::is_container).
    pub fn as_container(&self) -> Result<ContainerDescriptor> {
        if !self.is_container() {
            return Err(Error::invalid_path(self.path.as_str(), "not a container"));
        }
        match self.entry_parts() {
            None => self.shared.file_container(self.path.as_str()),
            Some((holder, entry)) => self.shared.nested_container(holder, entry),
        }
    }

    /// Opens a reader.
    ///
    /// For archive entries nothing is extracted until the first read.
    pub fn open_read(&mut self) -> Result<ResourceReader> {
        match &self.backend {
            Backend::Plain { path } => Ok(ResourceReader::File(BufReader::new(File::open(path)?))),
            _ => Ok(ResourceReader::Entry(self.stream()?.reader())),
        }
    }

    /// Reads the whole content.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        match &self.backend {
            Backend::Plain { path } => Ok(fs::read(path)?),
            _ => Ok(self.stream()?.bytes()?.to_vec()),
        }
    }

    /// Replaces the content.
    ///
    /// Plain files are replaced atomically. Archive entries are added or
    /// replaced in their container, which is rewritten atomically; for
    /// nested entries every enclosing container is rewritten.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        match &self.backend {
            Backend::Plain { path } => self.shared.write_plain(path, data),
            _ => {
                if let Some((container, entry)) = self.entry_parts() {
                    let _ = container.append_or_replace(entry.clone(), data)?;
                }
                self.invalidate();
                Ok(())
            }
        }
    }

    /// Adds or replaces `entry` inside the container this handle names.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPathKind`] if the handle is not a container or
    /// `entry` is not a valid entry path.
    pub fn write_entry(&mut self, entry: &str, data: impl Into<Vec<u8>>) -> Result<RewriteSummary> {
        let container = self.as_container()?;
        let edit = EntryEdit::parse(entry, data)?;
        container.apply(&[edit], &mut NoProgress)
    }

    /// Starts a batch of edits to the container this handle names.
    pub fn editor(&self) -> Result<ContainerEditor> {
        Ok(ContainerEditor::new(self.as_container()?))
    }

    /// Lists the entries of the container this handle names.
    pub fn list_entries(&self) -> Result<Vec<EntryInfo>> {
        let container = self.as_container()?;
        Ok(self.shared.listing(&container)?.to_vec())
    }

    /// Returns the handle of the enclosing resource.
    pub fn parent(&self) -> Option<ResourceHandle> {
        let parent = self.path.parent()?;
        ResourceHandle::build(Arc::clone(&self.shared), parent).ok()
    }

    /// Returns the handle of a resource below this one.
    pub fn child(&self, name: &str) -> Result<ResourceHandle> {
        let path = self.path.join(name)?;
        ResourceHandle::build(Arc::clone(&self.shared), path)
    }

    /// Copies this resource's content over `target`'s.
    pub fn copy_to(&mut self, target: &mut ResourceHandle) -> Result<()> {
        let data = self.read_bytes()?;
        log::debug!("copying '{}' to '{}' ({} bytes)", self.path, target.path, data.len());
        target.write(&data)
    }

    /// Returns the content length without extracting anything.
    pub fn size(&self) -> Result<u64> {
        match &self.backend {
            Backend::Plain { path } => Ok(fs::metadata(path)?.len()),
            _ => Ok(self.require_info()?.size),
        }
    }

    /// Returns the modification time, if the backend records one.
    pub fn last_modified(&self) -> Result<Option<SystemTime>> {
        match &self.backend {
            Backend::Plain { path } => Ok(Some(fs::metadata(path)?.modified()?)),
            _ => Ok(self.require_info()?.last_modified),
        }
    }

    fn require_info(&self) -> Result<EntryInfo> {
        self.entry_info()?.ok_or_else(|| match self.entry_parts() {
            Some((container, entry)) => Error::entry_not_found(container.key(), entry.as_str()),
            None => Error::invalid_path(self.path.as_str(), "not an archive entry"),
        })
    }

    /// Returns a real filesystem path with this resource's content.
    ///
    /// Plain files are returned as they are. Archive entries are served
    /// from a mount of their container; the mount stays referenced while
    /// the returned value lives.
    pub fn materialize(&self) -> Result<Materialized> {
        match (&self.backend, self.entry_parts()) {
            (Backend::Plain { path }, _) => Ok(Materialized {
                path: path.clone(),
                lease: None,
            }),
            (_, Some((container, entry))) => {
                let lease = self.shared.mounts.acquire(container)?;
                let path = lease.join(entry.as_str());
                if !path.exists() {
                    return Err(Error::entry_not_found(container.key(), entry.as_str()));
                }
                Ok(Materialized {
                    path,
                    lease: Some(lease),
                })
            }
            _ => Err(Error::invalid_path(self.path.as_str(), "no backing container")),
        }
    }
}

/// A real path returned by [`ResourceHandle::materialize`].
#[derive(Debug)]
pub struct Materialized {
    path: PathBuf,
    lease: Option<MountLease>,
}

impl Materialized {
    /// Returns the path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if the path lies in a mount rather than being the
    /// resource itself.
    pub fn is_staged(&self) -> bool {
        self.lease.is_some()
    }

    /// Returns the mount lease keeping a staged path alive.
    pub fn lease(&self) -> Option<&MountLease> {
        self.lease.as_ref()
    }
}

impl Deref for Materialized {
    type Target = Path;

    fn deref(&self) -> &Path {
        &self.path
    }
}

impl AsRef<Path> for Materialized {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Reader returned by [`ResourceHandle::open_read`].
#[derive(Debug)]
pub enum ResourceReader {
    /// A buffered plain file.
    File(BufReader<File>),
    /// A lazily loaded archive entry.
    Entry(LazyEntryStream),
}

impl Read for ResourceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::File(r) => r.read(buf),
            Self::Entry(r) => r.read(buf),
        }
    }
}

impl Seek for ResourceReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Self::File(r) => r.seek(pos),
            Self::Entry(r) => r.seek(pos),
        }
    }
}
