//! Container identity, generations and serialized writes.
//!
//! A [`ContainerDescriptor`] names one archive, either a file on disk or an
//! entry of another container, and carries the codec used for it.
//!
//! The generation counter and the writer lock belong to the container file,
//! not to a descriptor: every descriptor of the same file in the process,
//! whichever [`ResourceHandlerFactory`](crate::ResourceHandlerFactory)
//! created it, shares them. A nested container uses the state of the file
//! at the bottom of its chain, so any write along the chain moves every
//! generation above it and all writes to one file are serialized.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{self, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::edit::EntryEdit;
use crate::edit::atomic::replace_file;
use crate::format::{
    ArchiveCodec, CodecOptions, ContainerFormat, EntryInfo, RewriteSummary, codec_for, detect_file,
    sniff,
};
use crate::progress::{NoProgress, ProgressReporter};
use crate::stream::EntrySource;
use crate::{EntryPath, Error, ResolverConfig, Result};

/// Where a container's bytes live.
#[derive(Debug, Clone)]
pub enum ContainerLocation {
    /// A file on the real filesystem.
    File(PathBuf),
    /// An entry inside another container.
    Nested {
        /// The enclosing container.
        outer: ContainerDescriptor,
        /// The entry holding this container's bytes.
        entry: EntryPath,
    },
}

/// Generation and writer lock of one file.
///
/// Lives for the rest of the process once created, so a generation number
/// never repeats for the same file.
#[derive(Debug, Default)]
struct FileState {
    generation: AtomicU64,
    writer: Mutex<()>,
}

impl FileState {
    fn lock(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Absolute form of `path` without trailing separators or `.` components.
fn file_identity(path: &Path) -> PathBuf {
    path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .components()
        .collect()
}

fn states() -> MutexGuard<'static, HashMap<PathBuf, Arc<FileState>>> {
    static STATES: OnceLock<Mutex<HashMap<PathBuf, Arc<FileState>>>> = OnceLock::new();
    STATES
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

fn file_state(identity: &Path) -> Arc<FileState> {
    Arc::clone(states().entry(identity.to_path_buf()).or_default())
}

/// Replaces a whole file with `data`.
///
/// If the file has been opened as a container anywhere in the process, the
/// write takes that container's writer lock and bumps its generation.
pub(crate) fn overwrite_file(path: &Path, data: &[u8]) -> Result<()> {
    let identity = file_identity(path);
    let state = states().get(&identity).cloned();
    let _writer = state.as_deref().map(FileState::lock);
    replace_file(&identity, |out| Ok(out.write_all(data)?))?;
    if let Some(state) = &state {
        let generation = state.bump();
        log::debug!("overwrote '{}', generation {}", identity.display(), generation);
    }
    Ok(())
}

/// Container bytes read together with the generation they belong to.
pub(crate) struct Snapshot {
    pub(crate) bytes: Vec<u8>,
    pub(crate) codec: Arc<dyn ArchiveCodec>,
    pub(crate) generation: u64,
}

type RewriteFn<'a> = dyn FnMut(&[u8], &mut dyn Write) -> Result<RewriteSummary> + 'a;

struct Inner {
    key: String,
    identity: String,
    location: ContainerLocation,
    format: ContainerFormat,
    options: CodecOptions,
    codec: Arc<dyn ArchiveCodec>,
    state: Arc<FileState>,
}

/// Shared identity of one container.
#[derive(Clone)]
pub struct ContainerDescriptor {
    inner: Arc<Inner>,
}

impl fmt::Debug for ContainerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerDescriptor")
            .field("key", &self.inner.key)
            .field("format", &self.inner.format)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl ContainerDescriptor {
    /// Describes a container file.
    ///
    /// `path` is made absolute. The format comes from the file's signature when it exists and is
    /// recognizable, otherwise from the configured extension mapping.
    /// `key` is the logical path used in errors and cache keys.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPathKind`] if neither signature nor extension
    /// identify a container format.
    pub fn open_file(path: impl Into<PathBuf>, key: impl Into<String>, config: &ResolverConfig) -> Result<Self> {
        let path: PathBuf = path.into();
        let path = file_identity(&path);
        let key = key.into();
        let sniffed = match detect_file(&path) {
            Ok(format) => format,
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let by_name = path
            .file_name()
            .and_then(|name| config.format_for_name(&name.to_string_lossy()));
        let format = sniffed
            .or(by_name)
            .ok_or_else(|| Error::invalid_path(key.as_str(), "not a recognized container"))?;
        if let (Some(sniffed), Some(by_name)) = (sniffed, by_name) {
            if sniffed != by_name {
                log::debug!("'{}' is named like {} but contains {}", key, by_name, sniffed);
            }
        }
        let state = file_state(&path);
        let identity = path.to_string_lossy().into_owned();
        Ok(Self::build(key, identity, ContainerLocation::File(path), format, state, config))
    }

    /// Describes a container stored as `entry` of `outer`.
    ///
    /// The format comes from the entry's extension; the bytes are sniffed
    /// again whenever they are read.
    pub fn nested(outer: &ContainerDescriptor, entry: EntryPath, config: &ResolverConfig) -> Result<Self> {
        let key = format!("{}/{}", outer.key(), entry);
        let format = config
            .format_for_name(entry.file_name())
            .ok_or_else(|| Error::invalid_path(key.as_str(), "not a recognized container"))?;
        let identity = format!("{}/{}", outer.identity(), entry);
        let state = Arc::clone(&outer.inner.state);
        let location = ContainerLocation::Nested {
            outer: outer.clone(),
            entry,
        };
        Ok(Self::build(key, identity, location, format, state, config))
    }

    fn build(
        key: String,
        identity: String,
        location: ContainerLocation,
        format: ContainerFormat,
        state: Arc<FileState>,
        config: &ResolverConfig,
    ) -> Self {
        let options = CodecOptions::from(config);
        Self {
            inner: Arc::new(Inner {
                key,
                identity,
                location,
                format,
                options,
                codec: codec_for(format, &options),
                state,
            }),
        }
    }

    /// Returns the logical path of this container.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Returns the absolute file path, followed by the entry chain for
    /// nested containers. Equal for every descriptor of the same container.
    pub(crate) fn identity(&self) -> &str {
        &self.inner.identity
    }

    /// Returns where the bytes live.
    pub fn location(&self) -> &ContainerLocation {
        &self.inner.location
    }

    /// Returns the path on disk for file-backed containers.
    pub fn file_path(&self) -> Option<&Path> {
        match &self.inner.location {
            ContainerLocation::File(path) => Some(path),
            ContainerLocation::Nested { .. } => None,
        }
    }

    /// Returns the enclosing container for nested containers.
    pub fn outer(&self) -> Option<&ContainerDescriptor> {
        match &self.inner.location {
            ContainerLocation::File(_) => None,
            ContainerLocation::Nested { outer, .. } => Some(outer),
        }
    }

    /// Returns the format this container was opened as.
    pub fn format(&self) -> ContainerFormat {
        self.inner.format
    }

    /// Returns the codec for the opened format.
    pub fn codec(&self) -> &Arc<dyn ArchiveCodec> {
        &self.inner.codec
    }

    /// Returns the current generation.
    ///
    /// Monotonic and shared by every descriptor of the same file. Nested
    /// containers report the generation of the file holding them, so writes
    /// to the outer file invalidate inner caches too.
    pub fn generation(&self) -> u64 {
        self.inner.state.generation.load(Ordering::Acquire)
    }

    /// Returns true if both descriptors address the same container.
    pub fn same_container(&self, other: &ContainerDescriptor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.identity() == other.identity()
    }

    /// Picks the codec matching the actual bytes, which wins over the name.
    fn codec_for_bytes(&self, bytes: &[u8]) -> Arc<dyn ArchiveCodec> {
        match sniff(bytes) {
            Some(format) if format != self.inner.format => codec_for(format, &self.inner.options),
            _ => Arc::clone(&self.inner.codec),
        }
    }

    /// Reads the container's complete bytes.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        match &self.inner.location {
            ContainerLocation::File(path) => Ok(fs::read(path)?),
            ContainerLocation::Nested { outer, entry } => outer.extract(entry),
        }
    }

    /// Returns true if the container itself exists.
    pub fn exists(&self) -> bool {
        match &self.inner.location {
            ContainerLocation::File(path) => path.is_file(),
            ContainerLocation::Nested { outer, entry } => outer
                .list()
                .map(|entries| entries.iter().any(|e| e.matches(entry)))
                .unwrap_or(false),
        }
    }

    /// Reads the bytes and the generation they belong to.
    ///
    /// Takes the writer lock for the duration of the read, so no write can
    /// land between the two.
    pub(crate) fn snapshot(&self) -> Result<Snapshot> {
        let _writer = self.inner.state.lock();
        let generation = self.generation();
        let bytes = self.read_bytes()?;
        let codec = self.codec_for_bytes(&bytes);
        Ok(Snapshot {
            bytes,
            codec,
            generation,
        })
    }

    /// Lists the container's entries.
    pub fn list(&self) -> Result<Vec<EntryInfo>> {
        let bytes = self.read_bytes()?;
        self.codec_for_bytes(&bytes).list(&bytes)
    }

    /// Extracts one entry.
    ///
    /// # Errors
    ///
    /// [`Error::EntryNotFound`] naming this container if the entry is absent.
    pub fn extract(&self, entry: &EntryPath) -> Result<Vec<u8>> {
        let bytes = self.read_bytes()?;
        self.codec_for_bytes(&bytes)
            .extract(&bytes, entry)
            .map_err(|e| e.with_container(self.key()))
    }

    /// Adds or replaces one entry. See [`apply`](Self::apply).
    pub fn append_or_replace(&self, entry: EntryPath, data: impl Into<Vec<u8>>) -> Result<RewriteSummary> {
        self.apply(&[EntryEdit::new(entry, data)], &mut NoProgress)
    }

    /// Applies edits in one atomic rewrite and bumps the generation.
    ///
    /// Writers of the same container file are serialized, including writes
    /// into nested containers: the whole read-modify-write of every level
    /// runs under the file's writer lock. A container that does not exist
    /// yet is created. On failure nothing on disk changes and the generation
    /// stays the same.
    ///
    /// `progress` is called with the lock held and must not write to the
    /// same container file.
    pub fn apply(&self, edits: &[EntryEdit], progress: &mut dyn ProgressReporter) -> Result<RewriteSummary> {
        let (summary, generation) = self.rewrite_locked(&mut |current, out| {
            self.codec_for_bytes(current).rewrite(current, edits, out, progress)
        })?;
        log::debug!(
            "committed {} edit(s) to '{}', generation {}",
            edits.len(),
            self.key(),
            generation
        );
        Ok(summary)
    }

    /// Runs `rewrite` over this container's current bytes and stores its
    /// output, all under the file's writer lock.
    ///
    /// A missing container (or a missing entry holding a nested one) is
    /// passed as empty bytes. Returns the summary and the new generation.
    fn rewrite_locked(&self, rewrite: &mut RewriteFn<'_>) -> Result<(RewriteSummary, u64)> {
        match &self.inner.location {
            ContainerLocation::File(path) => {
                let _writer = self.inner.state.lock();
                let current = match fs::read(path) {
                    Ok(bytes) => bytes,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
                    Err(e) => return Err(e.into()),
                };
                let summary = replace_file(path, |out| rewrite(&current, out))?;
                Ok((summary, self.inner.state.bump()))
            }
            ContainerLocation::Nested { outer, entry } => {
                let mut summary = RewriteSummary::default();
                let (_, generation) = outer.rewrite_locked(&mut |outer_bytes, out| {
                    let outer_codec = outer.codec_for_bytes(outer_bytes);
                    let current = match outer_codec.extract(outer_bytes, entry) {
                        Ok(bytes) => bytes,
                        Err(e) if e.is_not_found() => Vec::new(),
                        Err(e) => return Err(e.with_container(outer.key())),
                    };
                    let mut rewritten = Vec::with_capacity(current.len());
                    summary = rewrite(&current, &mut rewritten)?;
                    outer_codec.rewrite(
                        outer_bytes,
                        &[EntryEdit::new(entry.clone(), rewritten)],
                        out,
                        &mut NoProgress,
                    )
                })?;
                Ok((summary, generation))
            }
        }
    }

    /// Returns a loader for one entry, for use with
    /// [`LazyEntryStream`](crate::LazyEntryStream).
    pub fn entry_source(&self, entry: EntryPath) -> ContainerEntrySource {
        ContainerEntrySource {
            container: self.clone(),
            entry,
        }
    }
}

/// Loads one entry of a container.
#[derive(Debug, Clone)]
pub struct ContainerEntrySource {
    container: ContainerDescriptor,
    entry: EntryPath,
}

impl EntrySource for ContainerEntrySource {
    fn load(&self) -> Result<Vec<u8>> {
        log::trace!("extracting '{}' from '{}'", self.entry, self.container.key());
        self.container.extract(&self.entry)
    }
}
