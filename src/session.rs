// ============================================================================
// src/session.rs – Scoped mounts and the per-process store session
// ============================================================================

use crate::cmd::base::{run_external, MOUNT_BINARIES, UMOUNT_BINARIES};
use crate::device::{self, DeviceLayout, DATA_LABEL};
use crate::error::{Result, ZnxError};
use anyhow::{anyhow, Context};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info, warn};

static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

/// A partition mounted on a private temporary directory.
///
/// Dropping the value unmounts the partition and removes the directory; an
/// explicit `release` does the same and reports failures. Either path runs the
/// teardown at most once.
#[derive(Debug)]
pub struct Mount {
    dir: Option<TempDir>,
    source: PathBuf,
    timeout: Duration,
}

impl Mount {
    pub fn attach(partition: &Path, timeout: Duration) -> anyhow::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("znx-")
            .tempdir()
            .context("create temporary mount directory")?;
        let target = path_str(dir.path())?;
        let source = path_str(partition)?;
        let out = run_external(MOUNT_BINARIES, &[source, target], timeout)?;
        if out.status != 0 {
            return Err(anyhow!(
                "Failed to mount {} at {}: {}",
                partition.display(),
                dir.path().display(),
                out.stderr.trim()
            ));
        }
        debug!(partition = %partition.display(), mountpoint = %dir.path().display(), "mounted");
        Ok(Self {
            dir: Some(dir),
            source: partition.to_path_buf(),
            timeout,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir
            .as_ref()
            .map(TempDir::path)
            .unwrap_or_else(|| Path::new(""))
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn release(mut self) -> anyhow::Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> anyhow::Result<()> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        // From here on the directory is never removed recursively: it may
        // still hold the mounted store.
        let dir = dir.into_path();
        let target = dir.to_string_lossy().into_owned();
        run_external(UMOUNT_BINARIES, &[&target], self.timeout)
            .and_then(|out| out.ensure_success("umount"))
            .with_context(|| format!("Failed to unmount {target}"))?;
        fs::remove_dir(&dir).with_context(|| format!("remove mount directory {target}"))?;
        debug!(mountpoint = %target, "unmounted");
        Ok(())
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            warn!("{err:#}");
        }
    }
}

fn path_str(path: &Path) -> anyhow::Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("path is not valid UTF-8: {}", path.display()))
}

/// Process-wide "a session is live" marker, cleared when dropped.
#[derive(Debug)]
struct SessionClaim(());

impl SessionClaim {
    fn take() -> anyhow::Result<Self> {
        if SESSION_ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(anyhow!("a mount session is already active in this process"));
        }
        Ok(Self(()))
    }
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        SESSION_ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// The device's data partition, mounted for the lifetime of one command.
///
/// Only one session may be live per process. The store root is not created
/// here; `deploy` creates it with the first image.
#[derive(Debug)]
pub struct MountSession {
    mount: Option<Mount>,
    store_root: PathBuf,
    _claim: SessionClaim,
}

impl MountSession {
    pub fn acquire(device: &Path, store_dir: &str, timeout: Duration) -> Result<Self> {
        device::require_block_device(device)?;
        let claim = SessionClaim::take()?;
        let mount = Self::mount_data(device, timeout)?;
        let store_root = mount.path().join(store_dir);
        info!(device = %device.display(), store = %store_root.display(), "session acquired");

        Ok(Self {
            mount: Some(mount),
            store_root,
            _claim: claim,
        })
    }

    fn mount_data(device: &Path, timeout: Duration) -> Result<Mount> {
        let layout = DeviceLayout::scan(device, timeout)?;
        let partition = layout
            .find_by_label(DATA_LABEL)
            .ok_or_else(|| ZnxError::NotInitialized {
                device: device.to_path_buf(),
                reason: format!("no partition labelled {DATA_LABEL}"),
            })?;
        debug!(
            partition = %partition.path.display(),
            fstype = partition.fstype.as_deref().unwrap_or("unknown"),
            "data partition found"
        );

        Mount::attach(&partition.path, timeout).map_err(|err| ZnxError::NotInitialized {
            device: device.to_path_buf(),
            reason: ZnxError::reason(&err),
        })
    }

    pub fn store_root(&self) -> &Path {
        &self.store_root
    }

    pub fn release(mut self) -> Result<()> {
        self.close().map_err(ZnxError::from)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        let Some(mount) = self.mount.take() else {
            return Ok(());
        };
        info!(partition = %mount.source().display(), "session released");
        mount.release()
    }
}

impl Drop for MountSession {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("{err:#}");
        }
    }
}
