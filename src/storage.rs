//! Filesystem helpers shared by the pipeline stages.
//!
//! Every artifact the pipeline produces is either written to a temporary
//! sibling and renamed into place, or (for directories) staged and swapped,
//! so readers never observe a half-written file.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Write `data` to `path` through a temporary file in the same directory.
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = parent_dir(path);
    std::fs::create_dir_all(&dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| err.error)?;

    Ok(())
}

/// Create a temporary file next to `path` for callers that stream their
/// output. Call [`commit`] once the writer is flushed.
pub fn create_temp_beside(path: &Path) -> io::Result<tempfile::NamedTempFile> {
    let dir = parent_dir(path);
    std::fs::create_dir_all(&dir)?;
    tempfile::NamedTempFile::new_in(dir)
}

/// Sync and rename a temp file created by [`create_temp_beside`].
pub fn commit(temp: tempfile::NamedTempFile, path: &Path) -> io::Result<()> {
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Replace the directory at `live` with `staging`.
///
/// The previous directory is moved aside first and removed only after the
/// staging directory is in place. On failure the previous directory is
/// restored.
pub fn replace_dir(staging: &Path, live: &Path) -> io::Result<()> {
    let backup = sibling_with_suffix(live, "old");

    if backup.exists() {
        std::fs::remove_dir_all(&backup)?;
    }

    let had_live = live.exists();
    if had_live {
        std::fs::rename(live, &backup)?;
    }

    if let Err(err) = std::fs::rename(staging, live) {
        if had_live {
            let _ = std::fs::rename(&backup, live);
        }
        return Err(err);
    }

    if had_live {
        if let Err(err) = std::fs::remove_dir_all(&backup) {
            log::warn!("failed to remove previous index at {}: {err}", backup.display());
        }
    }

    Ok(())
}

/// `<dir>/<name>.<suffix>` for a path `<dir>/<name>`.
pub fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    parent_dir(path).join(format!("{name}.{suffix}"))
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
