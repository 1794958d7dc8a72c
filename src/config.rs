//! Configuration for resource resolution, codecs and mounts.
//!
//! This module provides [`ResolverConfig`], shared by the
//! [`ResourceHandlerFactory`](crate::ResourceHandlerFactory) and the
//! [`MountRegistry`](crate::MountRegistry).

use std::path::PathBuf;
use std::time::Duration;

use crate::format::ContainerFormat;

/// Default archive extensions and the format they imply.
const DEFAULT_EXTENSIONS: &[(&str, ContainerFormat)] = &[
    ("zip", ContainerFormat::Zip),
    ("epub", ContainerFormat::Zip),
    ("cbz", ContainerFormat::Zip),
    ("jar", ContainerFormat::Zip),
    ("rar", ContainerFormat::Rar),
    ("cbr", ContainerFormat::Rar),
];

/// Configuration for the virtual resource layer.
///
/// # Example
///
/// ```rust
/// use archfs::ResolverConfig;
/// use archfs::format::ContainerFormat;
/// use std::time::Duration;
///
/// let config = ResolverConfig::new()
///     .archive_extension("fb2.zip", ContainerFormat::Zip)
///     .unmount_timeout(Duration::from_secs(5))
///     .compression_level(9);
///
/// assert_eq!(config.format_for_extension("EPUB"), Some(ContainerFormat::Zip));
/// assert_eq!(config.format_for_extension("txt"), None);
/// ```
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// File extensions (lowercase, without dot) that mark archive boundaries,
    /// with the format assumed when content sniffing is not possible.
    ///
    /// Default: zip, epub, cbz, jar (Zip) and rar, cbr (Rar).
    pub archive_extensions: Vec<(String, ContainerFormat)>,

    /// Directory under which mounts are staged.
    ///
    /// `None` uses a process-scoped directory below the system temporary
    /// directory. Default: `None`.
    pub staging_root: Option<PathBuf>,

    /// How long [`unmount_all`](crate::MountRegistry::unmount_all) waits for
    /// outstanding mount references to drain.
    ///
    /// Default: 30 seconds.
    pub unmount_timeout: Duration,

    /// Number of container listings kept in the resolver's LRU cache.
    ///
    /// Default: 64.
    pub listing_cache_capacity: usize,

    /// Deflate level (0-9) used for entries written into zip containers.
    ///
    /// Default: 6.
    pub compression_level: u32,

    /// Largest entry, in bytes, that will be decompressed into memory.
    ///
    /// Provides protection against compression bombs.
    /// Default: 512 MiB.
    pub max_entry_size: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            archive_extensions: DEFAULT_EXTENSIONS
                .iter()
                .map(|(ext, format)| (ext.to_string(), *format))
                .collect(),
            staging_root: None,
            unmount_timeout: Duration::from_secs(30),
            listing_cache_capacity: 64,
            compression_level: 6,
            max_entry_size: 512 * 1024 * 1024,
        }
    }
}

impl ResolverConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an additional archive extension.
    ///
    /// Re-registering an extension replaces its format.
    pub fn archive_extension(mut self, extension: &str, format: ContainerFormat) -> Self {
        let ext = extension.trim_start_matches('.').to_ascii_lowercase();
        self.archive_extensions.retain(|(e, _)| *e != ext);
        self.archive_extensions.push((ext, format));
        self
    }

    /// Removes an extension from the archive set.
    ///
    /// Useful when, for example, `.jar` files should be treated as opaque.
    pub fn without_archive_extension(mut self, extension: &str) -> Self {
        let ext = extension.trim_start_matches('.').to_ascii_lowercase();
        self.archive_extensions.retain(|(e, _)| *e != ext);
        self
    }

    /// Sets the staging root for mounts.
    pub fn staging_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.staging_root = Some(root.into());
        self
    }

    /// Sets the checkpoint drain timeout.
    pub fn unmount_timeout(mut self, timeout: Duration) -> Self {
        self.unmount_timeout = timeout;
        self
    }

    /// Sets the listing cache capacity. Zero is raised to one.
    pub fn listing_cache_capacity(mut self, capacity: usize) -> Self {
        self.listing_cache_capacity = capacity.max(1);
        self
    }

    /// Sets the deflate level, clamped to 0-9.
    pub fn compression_level(mut self, level: u32) -> Self {
        self.compression_level = level.min(9);
        self
    }

    /// Sets the maximum decompressed entry size.
    pub fn max_entry_size(mut self, bytes: u64) -> Self {
        self.max_entry_size = bytes;
        self
    }

    /// Returns the format registered for a file name's extension.
    ///
    /// Matching is case-insensitive. Multi-part extensions such as
    /// `fb2.zip` are matched against the end of the name.
    pub fn format_for_name(&self, name: &str) -> Option<ContainerFormat> {
        let lower = name.to_ascii_lowercase();
        self.archive_extensions
            .iter()
            .filter(|(ext, _)| {
                lower.len() > ext.len() + 1
                    && lower.ends_with(ext.as_str())
                    && lower.as_bytes()[lower.len() - ext.len() - 1] == b'.'
            })
            .max_by_key(|(ext, _)| ext.len())
            .map(|(_, format)| *format)
    }

    /// Returns the format registered for an extension (without dot).
    pub fn format_for_extension(&self, extension: &str) -> Option<ContainerFormat> {
        let ext = extension.trim_start_matches('.');
        self.archive_extensions
            .iter()
            .find(|(e, _)| e.eq_ignore_ascii_case(ext))
            .map(|(_, format)| *format)
    }

    /// Returns the staging root, falling back to the process-scoped default.
    pub fn effective_staging_root(&self) -> PathBuf {
        match &self.staging_root {
            Some(root) => root.clone(),
            None => std::env::temp_dir().join(format!("archfs-{}", std::process::id())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_extensions() {
        let config = ResolverConfig::default();
        assert_eq!(config.format_for_name("book.epub"), Some(ContainerFormat::Zip));
        assert_eq!(config.format_for_name("Comic.CBR"), Some(ContainerFormat::Rar));
        assert_eq!(config.format_for_name("notes.txt"), None);
        assert_eq!(config.format_for_name(".zip"), None);
        assert_eq!(config.format_for_name("zip"), None);
    }

    #[test]
    fn test_custom_extension_and_removal() {
        let config = ResolverConfig::new()
            .archive_extension(".CBT", ContainerFormat::Zip)
            .without_archive_extension("jar");
        assert_eq!(config.format_for_name("a.cbt"), Some(ContainerFormat::Zip));
        assert_eq!(config.format_for_name("lib.jar"), None);
    }

    #[test]
    fn test_multi_part_extension_prefers_longest() {
        let config = ResolverConfig::new().archive_extension("fb2.zip", ContainerFormat::Rar);
        assert_eq!(config.format_for_name("book.fb2.zip"), Some(ContainerFormat::Rar));
        assert_eq!(config.format_for_name("book.zip"), Some(ContainerFormat::Zip));
    }

    #[test]
    fn test_builder_clamps() {
        let config = ResolverConfig::new()
            .compression_level(42)
            .listing_cache_capacity(0);
        assert_eq!(config.compression_level, 9);
        assert_eq!(config.listing_cache_capacity, 1);
    }

    #[test]
    fn test_staging_root_default_is_process_scoped() {
        let root = ResolverConfig::default().effective_staging_root();
        let name = root.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, format!("archfs-{}", std::process::id()));
    }
}
