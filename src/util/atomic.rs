// ============================================================================
// src/util/atomic.rs – Durable renames for image slot rotation
// ============================================================================

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Return the parent directory path or error with context.
fn parent_dir(path: &Path) -> Result<PathBuf> {
    path.parent()
        .map(|p| p.to_path_buf())
        .context("Target path has no parent directory")
}

/// Fsync a directory to persist metadata (like rename).
pub fn fsync_dir(dir: &Path) -> Result<()> {
    let f = File::open(dir).with_context(|| format!("Open dir for fsync: {dir:?}"))?;
    f.sync_all()
        .with_context(|| format!("Fsync dir failed: {dir:?}"))?;
    Ok(())
}

/// Reject renames onto a symlink (avoid TOCTOU surprises at the destination).
fn reject_symlink_target(path: &Path) -> Result<()> {
    if let Ok(meta) = fs::symlink_metadata(path) {
        if meta.file_type().is_symlink() {
            bail!("Refusing to replace symlink: {}", path.display());
        }
    }
    Ok(())
}

/// Rename `from` onto `to` (replacing it), then fsync the parent directory so
/// the new slot assignment survives a yanked device.
pub fn rename_durable(from: &Path, to: &Path) -> Result<()> {
    reject_symlink_target(to)?;
    fs::rename(from, to)
        .with_context(|| format!("Rename failed ({} -> {})", from.display(), to.display()))?;
    fsync_dir(&parent_dir(to)?)
}

/// Remove a file if it exists; absence is not an error.
pub fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("Remove failed: {}", path.display())),
    }
}
