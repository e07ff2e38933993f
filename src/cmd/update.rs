// ============================================================================
// src/cmd/update.rs – Delta-update the active image, keeping one backup
// ============================================================================

use crate::cmd::base::{resolve, ZSYNC_BINARIES};
use crate::config::Config;
use crate::descriptor::UpdateDescriptor;
use crate::error::{Result, ZnxError};
use crate::session::MountSession;
use crate::store::{ImageKey, ImagePaths, Store};
use crate::ui::UX;
use crate::util::atomic::{remove_if_present, rename_durable};
use crate::util::audit::audit_log;
use crate::util::interrupt::Interrupt;
use anyhow::{anyhow, Context};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

/// Delta-sync collaborator: rebuild `output` from `url`, reusing blocks of
/// `seed`.
pub trait DeltaSync {
    fn sync(&self, url: &str, seed: &Path, output: &Path) -> Result<()>;
}

/// `zsync -i <seed> -o <output> <url>`.
#[derive(Debug)]
pub struct Zsync {
    pub timeout: Duration,
    pub interrupt: Interrupt,
}

impl DeltaSync for Zsync {
    fn sync(&self, url: &str, seed: &Path, output: &Path) -> Result<()> {
        let seed = seed.to_str().ok_or_else(|| anyhow!("invalid seed path"))?;
        let output = output
            .to_str()
            .ok_or_else(|| anyhow!("invalid output path"))?;
        let cmd = resolve(ZSYNC_BINARIES, self.timeout)?;
        cmd.run_cancellable(&["-i", seed, "-o", output, url], &self.interrupt)?
            .ensure_success("zsync")?;
        Ok(())
    }
}

/// Replace the active image with its delta-synced successor.
///
/// On success the previous active image is the backup. On any failure the
/// active and backup files are left exactly as they were.
pub fn update_image(store: &Store, key: &ImageKey, syncer: &dyn DeltaSync) -> Result<()> {
    let paths = store.resolve(key);
    paths.require_deployed()?;

    let descriptor = UpdateDescriptor::read(&paths.active)
        .ok_or_else(|| ZnxError::NoUpdateInfo(key.to_string()))?;
    info!(image = %key, locator = descriptor.locator(), "update descriptor found");

    let failed = |reason: String| ZnxError::UpdateFailed {
        image: key.to_string(),
        reason,
    };

    discard_sync_output(&paths);
    if let Err(err) = syncer.sync(descriptor.sync_url(), &paths.active, &paths.sync_output) {
        discard_sync_output(&paths);
        return Err(failed(err.to_string()));
    }
    if !paths.sync_output.is_file() {
        return Err(failed("delta-sync produced no image".to_string()));
    }

    rotate(&paths).map_err(|err| {
        discard_sync_output(&paths);
        failed(ZnxError::reason(&err))
    })
}

/// active -> rotating, new -> active, rotating -> backup; each step undoes
/// the earlier ones if it fails.
fn rotate(paths: &ImagePaths) -> anyhow::Result<()> {
    rename_durable(&paths.active, &paths.rotating).context("set aside active image")?;

    if let Err(err) = rename_durable(&paths.sync_output, &paths.active) {
        restore(&[(&paths.rotating, &paths.active)]);
        return Err(err.context("promote updated image"));
    }

    if let Err(err) = rename_durable(&paths.rotating, &paths.backup) {
        restore(&[
            (&paths.active, &paths.sync_output),
            (&paths.rotating, &paths.active),
        ]);
        return Err(err.context("keep previous image as backup"));
    }
    Ok(())
}

fn restore(steps: &[(&PathBuf, &PathBuf)]) {
    for (from, to) in steps {
        if let Err(err) = rename_durable(from, to) {
            error!(
                "could not restore {} -> {}: {err:#}; inspect the image directory by hand",
                from.display(),
                to.display()
            );
        }
    }
}

/// Leftovers of an earlier or failed sync; zsync keeps partial data in `.part`.
fn discard_sync_output(paths: &ImagePaths) {
    let mut partial = paths.sync_output.clone().into_os_string();
    partial.push(".part");
    for path in [paths.sync_output.clone(), PathBuf::from(partial)] {
        if let Err(err) = remove_if_present(&path) {
            warn!("{err:#}");
        }
    }
}

pub fn run_update(
    ui: &UX,
    cfg: &Config,
    device: &Path,
    image: &str,
    interrupt: &Interrupt,
) -> Result<()> {
    let key: ImageKey = image.parse()?;
    let session = MountSession::acquire(device, &cfg.store.root, cfg.timeouts.command())?;
    let store = Store::new(session.store_root());

    ui.info(&format!("Updating {key}..."));
    let syncer = Zsync {
        timeout: cfg.timeouts.transfer(),
        interrupt: interrupt.clone(),
    };
    update_image(&store, &key, &syncer)?;

    audit_log("UPDATE", &format!("image={key}"));
    session.release()?;
    ui.success(&format!("Updated {key}; the previous image is kept as backup."));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{update_image, DeltaSync};
    use crate::descriptor::tests::image_with_locator;
    use crate::error::{Result, ZnxError};
    use crate::store::{ImageKey, ImagePaths, Store};
    use std::cell::RefCell;
    use std::fs;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    /// Produces `next` as the synced image, or fails after a partial write.
    struct FakeSync {
        next: Vec<u8>,
        fail: bool,
        urls: RefCell<Vec<String>>,
    }

    impl DeltaSync for FakeSync {
        fn sync(&self, url: &str, seed: &Path, output: &Path) -> Result<()> {
            self.urls.borrow_mut().push(url.to_string());
            assert!(seed.is_file());
            if self.fail {
                fs::write(output, b"partial")?;
                return Err(anyhow::anyhow!("zsync exited with status 1").into());
            }
            fs::write(output, &self.next)?;
            Ok(())
        }
    }

    fn fake(next: Vec<u8>, fail: bool) -> FakeSync {
        FakeSync {
            next,
            fail,
            urls: RefCell::new(Vec::new()),
        }
    }

    fn deployed(active: &[u8]) -> (TempDir, Store, ImageKey, ImagePaths) {
        let root = tempdir().unwrap();
        let store = Store::new(root.path());
        let key: ImageKey = "acme/os".parse().unwrap();
        let paths = store.resolve(&key);
        fs::create_dir_all(&paths.user_data).unwrap();
        fs::write(&paths.active, active).unwrap();
        (root, store, key, paths)
    }

    #[test]
    fn successful_update_rotates_active_into_backup() {
        let v1 = image_with_locator("https://e.x/os.zsync", 1);
        let v2 = image_with_locator("https://e.x/os.zsync", 2);
        let (_root, store, key, paths) = deployed(&v1);
        let syncer = fake(v2.clone(), false);

        update_image(&store, &key, &syncer).unwrap();

        assert_eq!(fs::read(&paths.active).unwrap(), v2);
        assert_eq!(fs::read(&paths.backup).unwrap(), v1);
        assert!(!paths.sync_output.exists());
        assert!(!paths.rotating.exists());
        assert_eq!(*syncer.urls.borrow(), vec!["https://e.x/os.zsync".to_string()]);
    }

    #[test]
    fn second_update_replaces_the_backup() {
        let v1 = image_with_locator("zsync|https://e.x/os.zsync", 1);
        let v2 = image_with_locator("zsync|https://e.x/os.zsync", 2);
        let v3 = image_with_locator("zsync|https://e.x/os.zsync", 3);
        let (_root, store, key, paths) = deployed(&v1);

        update_image(&store, &key, &fake(v2.clone(), false)).unwrap();
        update_image(&store, &key, &fake(v3.clone(), false)).unwrap();

        assert_eq!(fs::read(&paths.active).unwrap(), v3);
        assert_eq!(fs::read(&paths.backup).unwrap(), v2);
    }

    #[test]
    fn missing_descriptor_is_no_update_info() {
        let active = vec![0u8; 40_000];
        let (_root, store, key, paths) = deployed(&active);
        let syncer = fake(b"never".to_vec(), false);

        let err = update_image(&store, &key, &syncer).unwrap_err();

        assert!(matches!(err, ZnxError::NoUpdateInfo(_)));
        assert_eq!(fs::read(&paths.active).unwrap(), active);
        assert!(syncer.urls.borrow().is_empty());
        assert!(!paths.has_backup());
    }

    #[test]
    fn failed_sync_leaves_active_and_backup_untouched() {
        let v1 = image_with_locator("https://e.x/os.zsync", 1);
        let older = b"older backup".to_vec();
        let (_root, store, key, paths) = deployed(&v1);
        fs::write(&paths.backup, &older).unwrap();

        let err = update_image(&store, &key, &fake(Vec::new(), true)).unwrap_err();

        assert!(matches!(err, ZnxError::UpdateFailed { .. }));
        assert_eq!(fs::read(&paths.active).unwrap(), v1);
        assert_eq!(fs::read(&paths.backup).unwrap(), older);
        assert!(!paths.sync_output.exists());
    }

    #[test]
    fn update_requires_a_deployed_image() {
        let root = tempdir().unwrap();
        let store = Store::new(root.path());
        let err = update_image(&store, &"acme/os".parse().unwrap(), &fake(Vec::new(), false))
            .unwrap_err();
        assert!(matches!(err, ZnxError::NotDeployed(_)));
    }
}
