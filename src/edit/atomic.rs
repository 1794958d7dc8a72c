//! Crash-safe file replacement.
//!
//! The new content is written to a temporary file next to the target, synced,
//! and renamed over the target. Until the rename, the target is untouched;
//! on any failure the temporary file is removed when it is dropped.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::{Error, Result};

/// Replaces `target` with whatever `write` produces.
///
/// `write` receives a buffered writer over the temporary sibling. If it
/// fails, or syncing or renaming fails, `target` keeps its old content (or
/// stays absent) and no temporary file is left behind.
///
/// Existing permissions of `target` are carried over to the new file.
pub(crate) fn replace_file<T, F>(target: &Path, write: F) -> Result<T>
where
    F: FnOnce(&mut dyn Write) -> Result<T>,
{
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::invalid_path(target.display().to_string(), "no file name"))?;

    let mut temp = tempfile::Builder::new()
        .prefix(&format!(".{}.", file_name))
        .suffix(".tmp")
        .tempfile_in(dir)?;
    log::trace!("writing '{}' via '{}'", target.display(), temp.path().display());

    let value = {
        let mut out = BufWriter::new(temp.as_file_mut());
        let value = write(&mut out)?;
        out.flush()?;
        value
    };
    temp.as_file().sync_all()?;

    if let Ok(metadata) = fs::metadata(target) {
        fs::set_permissions(temp.path(), metadata.permissions())?;
    }

    temp.persist(target).map_err(|e| Error::Io(e.error))?;
    sync_dir(dir);
    log::debug!("replaced '{}'", target.display());
    Ok(value)
}

/// Makes the rename durable. Best effort; not supported everywhere.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
        log::debug!("failed to sync directory '{}': {}", dir.display(), e);
    }
    #[cfg(not(unix))]
    let _ = dir;
}
