//! Container format detection.
//!
//! Formats are discovered from signatures (magic bytes) first. The file
//! extension is only a fallback for containers that do not exist yet or are
//! empty, because comic archives in the wild are often misnamed (a `.cbr`
//! that is really a zip).

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use super::ContainerFormat;

/// Known container signatures.
const SIGNATURES: &[(&[u8], ContainerFormat)] = &[
    // ZIP: 'P' 'K' 0x03 0x04 (local file header)
    (&[0x50, 0x4B, 0x03, 0x04], ContainerFormat::Zip),
    // ZIP: 'P' 'K' 0x05 0x06 (empty archive)
    (&[0x50, 0x4B, 0x05, 0x06], ContainerFormat::Zip),
    // ZIP: 'P' 'K' 0x07 0x08 (spanned archive marker)
    (&[0x50, 0x4B, 0x07, 0x08], ContainerFormat::Zip),
    // RAR 1.5-4.x: 'R' 'a' 'r' '!' 0x1A 0x07 0x00
    (
        &[0x52, 0x61, 0x72, 0x21, 0x1A, 0x07, 0x00],
        ContainerFormat::Rar,
    ),
    // RAR5: 'R' 'a' 'r' '!' 0x1A 0x07 0x01 0x00
    (
        &[0x52, 0x61, 0x72, 0x21, 0x1A, 0x07, 0x01, 0x00],
        ContainerFormat::Rar,
    ),
];

/// Number of leading bytes [`sniff`] needs.
pub const SNIFF_LEN: usize = 8;

/// Identifies a container from its leading bytes.
///
/// ```rust
/// use archfs::format::{ContainerFormat, sniff};
///
/// assert_eq!(sniff(b"PK\x03\x04rest"), Some(ContainerFormat::Zip));
/// assert_eq!(sniff(b"Rar!\x1a\x07\x01\x00"), Some(ContainerFormat::Rar));
/// assert_eq!(sniff(b"%PDF-1.7"), None);
/// ```
pub fn sniff(header: &[u8]) -> Option<ContainerFormat> {
    SIGNATURES
        .iter()
        .find(|(signature, _)| header.starts_with(signature))
        .map(|(_, format)| *format)
}

/// Reads the first bytes of a file and identifies its format.
///
/// Returns `Ok(None)` for unknown signatures and for empty files.
///
/// # Errors
///
/// Propagates I/O errors, including `NotFound`.
pub fn detect_file(path: &Path) -> io::Result<Option<ContainerFormat>> {
    let file = File::open(path)?;
    let mut header = Vec::with_capacity(SNIFF_LEN);
    file.take(SNIFF_LEN as u64).read_to_end(&mut header)?;
    Ok(sniff(&header))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sniff_short_input() {
        assert_eq!(sniff(b""), None);
        assert_eq!(sniff(b"PK"), None);
        assert_eq!(sniff(b"Rar!\x1a\x07"), None);
    }

    #[test]
    fn test_sniff_empty_zip() {
        assert_eq!(sniff(b"PK\x05\x06\0\0\0\0"), Some(ContainerFormat::Zip));
    }

    #[test]
    fn test_detect_file_misnamed_comic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issue1.cbr");
        std::fs::write(&path, b"PK\x03\x04 not really rar").unwrap();
        assert_eq!(detect_file(&path).unwrap(), Some(ContainerFormat::Zip));
    }

    #[test]
    fn test_detect_file_missing() {
        let dir = TempDir::new().unwrap();
        let err = detect_file(&dir.path().join("missing.zip")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
