//! Shared test utilities for integration tests.
//!
//! Note: `#![allow(dead_code)]` is required because each integration test file
//! compiles as a separate crate and may only use a subset of these helpers.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use archfs::{ContainerDescriptor, ResolverConfig, ResourceHandlerFactory};
use tempfile::TempDir;

/// A scratch library directory with a factory whose mounts stage inside it.
pub struct Library {
    pub dir: TempDir,
    pub factory: ResourceHandlerFactory,
}

impl Library {
    pub fn new() -> Self {
        Self::with_config(ResolverConfig::new())
    }

    /// Uses `config` with the staging root moved into the library.
    pub fn with_config(config: ResolverConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let config = config.staging_root(dir.path().join("staging"));
        Self {
            factory: ResourceHandlerFactory::new(config),
            dir,
        }
    }

    /// Returns the logical path of `rest` inside the library.
    pub fn path(&self, rest: &str) -> String {
        format!("{}/{}", self.dir.path().display(), rest)
    }

    pub fn file(&self, rest: &str) -> PathBuf {
        self.dir.path().join(rest)
    }

    pub fn staging(&self) -> PathBuf {
        self.dir.path().join("staging")
    }

    /// Creates (or extends) a container through the factory.
    pub fn container_with(&self, rest: &str, entries: &[(&str, &[u8])]) -> ContainerDescriptor {
        let mut handle = self.factory.resolve(&self.path(rest)).unwrap();
        for (name, data) in entries {
            let _ = handle.write_entry(name, data.to_vec()).unwrap();
        }
        self.factory.container(&self.path(rest)).unwrap()
    }

    /// Lists entry paths of a container in physical order.
    pub fn entry_names(&self, rest: &str) -> Vec<String> {
        self.factory
            .resolve(&self.path(rest))
            .unwrap()
            .list_entries()
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect()
    }
}

/// Returns the names in a directory, sorted. Missing directories are empty.
pub fn dir_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

/// Builds a stored zip archive byte by byte, accepting names the library
/// would refuse to write.
pub fn raw_stored_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut central = Vec::new();
    for (name, data) in entries {
        let offset = out.len() as u32;
        let crc = crc32fast::hash(data);
        let name = name.as_bytes();

        out.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
        out.extend_from_slice(&20u16.to_le_bytes()); // version needed
        out.extend_from_slice(&0u16.to_le_bytes()); // flags
        out.extend_from_slice(&0u16.to_le_bytes()); // stored
        out.extend_from_slice(&0u16.to_le_bytes()); // time
        out.extend_from_slice(&0x0021u16.to_le_bytes()); // 1980-01-01
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(data);

        central.extend_from_slice(&0x0201_4b50u32.to_le_bytes());
        central.extend_from_slice(&20u16.to_le_bytes()); // made by
        central.extend_from_slice(&20u16.to_le_bytes()); // needed
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&0x0021u16.to_le_bytes());
        central.extend_from_slice(&crc.to_le_bytes());
        central.extend_from_slice(&(data.len() as u32).to_le_bytes());
        central.extend_from_slice(&(data.len() as u32).to_le_bytes());
        central.extend_from_slice(&(name.len() as u16).to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes()); // extra
        central.extend_from_slice(&0u16.to_le_bytes()); // comment
        central.extend_from_slice(&0u16.to_le_bytes()); // disk
        central.extend_from_slice(&0u16.to_le_bytes()); // internal attr
        central.extend_from_slice(&0u32.to_le_bytes()); // external attr
        central.extend_from_slice(&offset.to_le_bytes());
        central.extend_from_slice(name);
    }
    let cd_offset = out.len() as u32;
    out.extend_from_slice(&central);
    out.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    out.extend_from_slice(&(central.len() as u32).to_le_bytes());
    out.extend_from_slice(&cd_offset.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

/// Incompressible data, deterministically seeded.
pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill(&mut data[..]);
    data
}
