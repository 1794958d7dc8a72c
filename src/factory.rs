//! The entry point: logical path in, [`ResourceHandle`] out.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::{self, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lru::LruCache;

use crate::checkpoint::OperationScope;
use crate::container::{self, ContainerDescriptor};
use crate::format::EntryInfo;
use crate::handle::ResourceHandle;
use crate::mount::{self, MountRegistry};
use crate::resolve::{PathKind, PathResolver, ResourcePath};
use crate::{EntryPath, Error, ResolverConfig, Result};

type ListingKey = (String, u64);

/// State shared by a factory and every handle it produced.
pub(crate) struct Shared {
    pub(crate) config: Arc<ResolverConfig>,
    pub(crate) resolver: PathResolver,
    pub(crate) mounts: Arc<MountRegistry>,
    containers: Mutex<HashMap<String, ContainerDescriptor>>,
    listings: Mutex<LruCache<ListingKey, Arc<[EntryInfo]>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn table_key(path: &Path) -> String {
    path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .components()
        .collect::<PathBuf>()
        .to_string_lossy()
        .into_owned()
}

impl Shared {
    fn new(config: ResolverConfig, mounts: Arc<MountRegistry>) -> Self {
        let config = Arc::new(config);
        let capacity = NonZeroUsize::new(config.listing_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            resolver: PathResolver::shared(Arc::clone(&config)),
            config,
            mounts,
            containers: Mutex::new(HashMap::new()),
            listings: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the shared descriptor of a container file.
    pub(crate) fn file_container(&self, logical: &str) -> Result<ContainerDescriptor> {
        let trimmed = logical.trim_end_matches(['/', path::MAIN_SEPARATOR]);
        let file = PathBuf::from(if trimmed.is_empty() { logical } else { trimmed });
        let key = table_key(&file);

        let mut containers = lock(&self.containers);
        if let Some(descriptor) = containers.get(&key) {
            return Ok(descriptor.clone());
        }
        let descriptor = ContainerDescriptor::open_file(file, trimmed, &self.config)?;
        log::trace!("registered container '{}' as {}", descriptor.key(), descriptor.format());
        containers.insert(key, descriptor.clone());
        Ok(descriptor)
    }

    /// Returns the shared descriptor of a container stored inside `outer`.
    pub(crate) fn nested_container(&self, outer: &ContainerDescriptor, entry: &EntryPath) -> Result<ContainerDescriptor> {
        let key = format!("{}/{}", outer.key(), entry);

        let mut containers = lock(&self.containers);
        if let Some(descriptor) = containers.get(&key) {
            return Ok(descriptor.clone());
        }
        let descriptor = ContainerDescriptor::nested(outer, entry.clone(), &self.config)?;
        containers.insert(key, descriptor.clone());
        Ok(descriptor)
    }

    /// Returns the containers a path passes through, outermost first.
    pub(crate) fn container_chain(&self, path: &ResourcePath) -> Result<Vec<ContainerDescriptor>> {
        let Some(file) = path.container_path() else {
            return Ok(Vec::new());
        };
        let boundaries = path.boundaries();
        let mut chain = Vec::with_capacity(boundaries.len());
        chain.push(self.file_container(file)?);
        for boundary in &boundaries[..boundaries.len() - 1] {
            let outer = &chain[chain.len() - 1];
            let inner = self.nested_container(outer, &boundary.entry)?;
            chain.push(inner);
        }
        Ok(chain)
    }

    /// Lists a container through the cache.
    pub(crate) fn listing(&self, container: &ContainerDescriptor) -> Result<Arc<[EntryInfo]>> {
        let key = (container.key().to_string(), container.generation());
        if let Some(hit) = lock(&self.listings).get(&key) {
            return Ok(Arc::clone(hit));
        }
        let listed: Arc<[EntryInfo]> = container.list()?.into();
        log::trace!(
            "cached listing of '{}' generation {} ({} entries)",
            key.0,
            key.1,
            listed.len()
        );
        lock(&self.listings).put(key, Arc::clone(&listed));
        Ok(listed)
    }

    /// Overwrites a plain file. A file opened as a container anywhere in
    /// the process is written under its writer lock and gets a new
    /// generation.
    pub(crate) fn write_plain(&self, file: &Path, data: &[u8]) -> Result<()> {
        container::overwrite_file(file, data)
    }
}

/// Produces [`ResourceHandle`]s for logical paths.
///
/// A factory owns the container table: every handle addressing the same
/// container shares one [`ContainerDescriptor`]. Generations and writer
/// locks are per file across the process, so factories over the same files
/// stay consistent. Create one factory per library and share it.
///
/// # Example
///
/// ```rust,no_run
/// use archfs::ResourceHandlerFactory;
///
/// let factory = ResourceHandlerFactory::default();
/// let mut info = factory.resolve("/library/books.zip/meta/info.xml")?;
/// let old = info.read_bytes()?;
/// info.write(b"<info updated=\"yes\"/>")?;
/// assert_ne!(info.read_bytes()?, old);
/// # Ok::<(), archfs::Error>(())
/// ```
#[derive(Clone)]
pub struct ResourceHandlerFactory {
    shared: Arc<Shared>,
}

impl Default for ResourceHandlerFactory {
    /// Default configuration, mounting through the process-wide registry.
    fn default() -> Self {
        Self::with_registry(ResolverConfig::default(), Arc::clone(mount::global()))
    }
}

impl fmt::Debug for ResourceHandlerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandlerFactory")
            .field("config", &self.shared.config)
            .field("containers", &lock(&self.shared.containers).len())
            .finish_non_exhaustive()
    }
}

impl ResourceHandlerFactory {
    /// Creates a factory with its own mount registry under the config's
    /// staging root.
    pub fn new(config: ResolverConfig) -> Self {
        let mounts = MountRegistry::new(&config);
        Self::with_registry(config, mounts)
    }

    /// Creates a factory that mounts through `mounts`.
    pub fn with_registry(config: ResolverConfig, mounts: Arc<MountRegistry>) -> Self {
        Self {
            shared: Arc::new(Shared::new(config, mounts)),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ResolverConfig {
        &self.shared.config
    }

    /// Returns the path resolver.
    pub fn resolver(&self) -> &PathResolver {
        &self.shared.resolver
    }

    /// Returns the mount registry used by [`ResourceHandle::materialize`].
    pub fn mounts(&self) -> &Arc<MountRegistry> {
        &self.shared.mounts
    }

    /// Classifies `path` and builds a handle for it.
    ///
    /// No container is read here. Archive-backed handles look up (or
    /// register) their containers, which only sniffs the container file's
    /// signature.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPathKind`] for malformed paths or archive segments
    /// that name an unrecognized file; I/O errors from sniffing.
    pub fn resolve(&self, path: &str) -> Result<ResourceHandle> {
        let path = self.shared.resolver.classify(path)?;
        ResourceHandle::build(Arc::clone(&self.shared), path)
    }

    /// Returns the descriptor of the container at `path`.
    ///
    /// `path` must end at an archive: a container file, or an archive entry
    /// of another container.
    pub fn container(&self, path: &str) -> Result<ContainerDescriptor> {
        let resolved = self.shared.resolver.classify(path)?;
        let is_archive = resolved
            .file_name()
            .is_some_and(|name| self.shared.config.format_for_name(name).is_some());
        if !is_archive {
            return Err(Error::invalid_path(path, "not a container"));
        }
        match resolved.kind() {
            PathKind::Plain => self.shared.file_container(resolved.as_str()),
            PathKind::ArchiveEntry | PathKind::NestedArchiveEntry => {
                let chain = self.shared.container_chain(&resolved)?;
                match (chain.last(), resolved.innermost_entry()) {
                    (Some(holder), Some(entry)) => self.shared.nested_container(holder, entry),
                    _ => Err(Error::invalid_path(path, "not a container")),
                }
            }
        }
    }

    /// Starts an operation whose end sweeps this factory's mounts.
    pub fn scope(&self) -> OperationScope {
        OperationScope::new(Arc::clone(&self.shared.mounts))
    }

    /// Runs `f` inside a [`scope`](Self::scope).
    pub fn run<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&Self) -> T,
    {
        let _scope = self.scope();
        f(self)
    }

    /// Runs the checkpoint on this factory's mount registry.
    pub fn unmount_all(&self) -> Result<()> {
        self.shared.mounts.unmount_all()
    }
}
