// ============================================================================
// src/cmd/maintain.rs – Revert, clean, reset, remove, stats and list
// ============================================================================

use crate::config::Config;
use crate::descriptor::UpdateDescriptor;
use crate::error::{Result, ZnxError};
use crate::session::MountSession;
use crate::store::{ImageKey, Store};
use crate::ui::{human_size, UX};
use crate::util::atomic::{remove_if_present, rename_durable};
use crate::util::audit::audit_log;
use anyhow::Context;
use chrono::{DateTime, Local};
use std::fs;
use std::path::Path;
use tracing::info;

/// Put the backup back into the active slot. Only one generation exists, so
/// the backup is gone afterwards.
pub fn revert_image(store: &Store, key: &ImageKey) -> Result<()> {
    let paths = store.resolve(key);
    if !paths.has_backup() {
        return Err(ZnxError::NoBackup(key.to_string()));
    }
    rename_durable(&paths.backup, &paths.active)?;
    Ok(())
}

/// Drop the backup if there is one.
pub fn clean_image(store: &Store, key: &ImageKey) -> Result<bool> {
    let paths = store.resolve(key);
    paths.require_deployed()?;
    Ok(remove_if_present(&paths.backup)?)
}

/// Empty the user-data directory, leaving the image files alone.
pub fn reset_image(store: &Store, key: &ImageKey) -> Result<()> {
    let paths = store.resolve(key);
    paths.require_deployed()?;

    let wipe = || -> anyhow::Result<()> {
        fs::create_dir_all(&paths.user_data)
            .with_context(|| format!("create {}", paths.user_data.display()))?;
        for entry in fs::read_dir(&paths.user_data)
            .with_context(|| format!("read {}", paths.user_data.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            let removed = if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.with_context(|| format!("delete {}", path.display()))?;
        }
        Ok(())
    };
    wipe().map_err(|err| ZnxError::ResetFailed {
        image: key.to_string(),
        reason: ZnxError::reason(&err),
    })
}

/// Delete the whole image directory, then the vendor directory if that was
/// its last release.
pub fn remove_image(store: &Store, key: &ImageKey) -> Result<()> {
    let paths = store.resolve(key);
    if !paths.dir.is_dir() {
        return Err(ZnxError::NotDeployed(key.to_string()));
    }
    fs::remove_dir_all(&paths.dir)
        .with_context(|| format!("delete {}", paths.dir.display()))?;

    let vendor_empty = fs::read_dir(&paths.vendor_dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    if vendor_empty {
        fs::remove_dir(&paths.vendor_dir)
            .with_context(|| format!("delete {}", paths.vendor_dir.display()))?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ImageStats {
    pub active_size: u64,
    pub modified: DateTime<Local>,
    pub backup_size: Option<u64>,
    pub updatable: bool,
}

pub fn image_stats(store: &Store, key: &ImageKey) -> Result<ImageStats> {
    let paths = store.resolve(key);
    paths.require_deployed()?;

    let meta = fs::metadata(&paths.active)
        .with_context(|| format!("stat {}", paths.active.display()))?;
    let modified = meta
        .modified()
        .with_context(|| format!("mtime of {}", paths.active.display()))?;
    let backup_size = fs::metadata(&paths.backup)
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len());

    Ok(ImageStats {
        active_size: meta.len(),
        modified: DateTime::<Local>::from(modified),
        backup_size,
        updatable: UpdateDescriptor::read(&paths.active).is_some(),
    })
}

// ----------------------------------------------------------------------------
// Command entrypoints (each holds the store session for its whole run)
// ----------------------------------------------------------------------------

fn open_store(cfg: &Config, device: &Path) -> Result<MountSession> {
    MountSession::acquire(device, &cfg.store.root, cfg.timeouts.command())
}

pub fn run_revert(ui: &UX, cfg: &Config, device: &Path, image: &str) -> Result<()> {
    let key: ImageKey = image.parse()?;
    let session = open_store(cfg, device)?;
    revert_image(&Store::new(session.store_root()), &key)?;
    audit_log("REVERT", &format!("image={key}"));
    session.release()?;
    ui.success(&format!("Reverted {key} to its backup."));
    Ok(())
}

pub fn run_clean(ui: &UX, cfg: &Config, device: &Path, image: &str) -> Result<()> {
    let key: ImageKey = image.parse()?;
    let session = open_store(cfg, device)?;
    let removed = clean_image(&Store::new(session.store_root()), &key)?;
    session.release()?;
    if removed {
        audit_log("CLEAN", &format!("image={key}"));
        ui.success(&format!("Removed the backup of {key}."));
    } else {
        ui.info(&format!("{key} has no backup; nothing to clean."));
    }
    Ok(())
}

pub fn run_reset(ui: &UX, cfg: &Config, device: &Path, image: &str) -> Result<()> {
    let key: ImageKey = image.parse()?;
    let session = open_store(cfg, device)?;
    reset_image(&Store::new(session.store_root()), &key)?;
    audit_log("RESET", &format!("image={key}"));
    session.release()?;
    ui.success(&format!("Cleared the user data of {key}."));
    Ok(())
}

pub fn run_remove(ui: &UX, cfg: &Config, device: &Path, image: &str) -> Result<()> {
    let key: ImageKey = image.parse()?;
    let session = open_store(cfg, device)?;
    remove_image(&Store::new(session.store_root()), &key)?;
    audit_log("REMOVE", &format!("image={key}"));
    session.release()?;
    ui.success(&format!("Removed {key}."));
    Ok(())
}

/// Sizes are shown rounded and as the exact byte count.
fn size_cell(bytes: u64) -> String {
    format!("{} ({bytes} bytes)", human_size(bytes))
}

fn stats_rows(stats: &ImageStats) -> Vec<(&'static str, String)> {
    let mut rows = vec![
        ("Image size", size_cell(stats.active_size)),
        (
            "Last update",
            stats.modified.format("%Y-%m-%d %H:%M:%S").to_string(),
        ),
        (
            "Updatable",
            if stats.updatable { "yes" } else { "no" }.to_string(),
        ),
    ];
    if let Some(size) = stats.backup_size {
        rows.push(("Backup size", size_cell(size)));
    }
    rows
}

pub fn run_stats(ui: &UX, cfg: &Config, device: &Path, image: &str) -> Result<()> {
    let key: ImageKey = image.parse()?;
    let session = open_store(cfg, device)?;
    let stats = image_stats(&Store::new(session.store_root()), &key)?;
    session.release()?;

    ui.data_panel(&key.to_string(), &stats_rows(&stats));
    Ok(())
}

pub fn run_list(ui: &UX, cfg: &Config, device: &Path) -> Result<()> {
    let session = open_store(cfg, device)?;
    let store = Store::new(session.store_root());
    let keys = store.list()?;
    info!(store = %store.root().display(), count = keys.len(), "listed images");
    session.release()?;
    for key in keys {
        ui.line(&key.to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        clean_image, image_stats, remove_image, reset_image, revert_image, stats_rows,
    };
    use crate::cmd::deploy::{deploy_image, DeployOptions, Fetch, Source};
    use crate::cmd::update::{update_image, DeltaSync};
    use crate::descriptor::tests::image_with_locator;
    use crate::error::{Result, ZnxError};
    use crate::store::{ImageKey, Store};
    use crate::util::interrupt::Interrupt;
    use std::fs;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    struct NoFetch;

    impl Fetch for NoFetch {
        fn fetch(&self, url: &str, _: &Path, _: &Interrupt) -> Result<()> {
            panic!("unexpected download of {url}");
        }
    }

    struct WriteSync(Vec<u8>);

    impl DeltaSync for WriteSync {
        fn sync(&self, _: &str, _: &Path, output: &Path) -> Result<()> {
            fs::write(output, &self.0)?;
            Ok(())
        }
    }

    fn key(s: &str) -> ImageKey {
        s.parse().unwrap()
    }

    /// Deploy `payload` as `image` the way the CLI would, from a local file.
    fn deploy(store: &Store, image: &str, payload: &[u8]) -> TempDir {
        let src_dir = tempdir().unwrap();
        let src = src_dir.path().join("img.iso");
        fs::write(&src, payload).unwrap();
        deploy_image(
            store,
            &key(image),
            &Source::Local(src),
            &NoFetch,
            &DeployOptions { verify_copy: true },
            &Interrupt::detached(),
        )
        .unwrap();
        src_dir
    }

    #[test]
    fn revert_after_update_restores_previous_image() {
        let root = tempdir().unwrap();
        let store = Store::new(root.path());
        let v1 = image_with_locator("https://e.x/os.zsync", 7);
        let _src = deploy(&store, "acme/os", &v1);
        update_image(&store, &key("acme/os"), &WriteSync(b"v2".to_vec())).unwrap();

        revert_image(&store, &key("acme/os")).unwrap();

        let paths = store.resolve(&key("acme/os"));
        assert_eq!(fs::read(&paths.active).unwrap(), v1);
        assert!(!paths.has_backup());
        assert!(matches!(
            revert_image(&store, &key("acme/os")),
            Err(ZnxError::NoBackup(_))
        ));
    }

    #[test]
    fn clean_is_idempotent() {
        let root = tempdir().unwrap();
        let store = Store::new(root.path());
        let _src = deploy(&store, "acme/os", b"image");
        let paths = store.resolve(&key("acme/os"));
        fs::write(&paths.backup, b"old").unwrap();

        assert!(clean_image(&store, &key("acme/os")).unwrap());
        assert!(!paths.backup.exists());
        assert!(!clean_image(&store, &key("acme/os")).unwrap());
        assert!(!paths.backup.exists());
        assert_eq!(fs::read(&paths.active).unwrap(), b"image");
    }

    #[test]
    fn reset_empties_user_data_only() {
        let root = tempdir().unwrap();
        let store = Store::new(root.path());
        let _src = deploy(&store, "acme/os", b"image");
        let paths = store.resolve(&key("acme/os"));
        fs::write(&paths.backup, b"old").unwrap();
        fs::create_dir_all(paths.user_data.join("home/user")).unwrap();
        fs::write(paths.user_data.join("home/user/.bashrc"), b"alias").unwrap();
        fs::write(paths.user_data.join("machine-id"), b"42").unwrap();

        reset_image(&store, &key("acme/os")).unwrap();

        assert!(paths.user_data.is_dir());
        assert_eq!(fs::read_dir(&paths.user_data).unwrap().count(), 0);
        assert_eq!(fs::read(&paths.active).unwrap(), b"image");
        assert_eq!(fs::read(&paths.backup).unwrap(), b"old");
    }

    #[test]
    fn removing_last_release_drops_the_vendor() {
        let root = tempdir().unwrap();
        let store = Store::new(root.path());
        let _a = deploy(&store, "acme/os", b"a");
        let _b = deploy(&store, "acme/lts", b"b");
        let _c = deploy(&store, "zeta/x", b"c");

        remove_image(&store, &key("acme/os")).unwrap();
        assert_eq!(store.list().unwrap(), vec![key("acme/lts"), key("zeta/x")]);

        remove_image(&store, &key("acme/lts")).unwrap();
        assert_eq!(store.list().unwrap(), vec![key("zeta/x")]);
        assert!(!root.path().join("acme").exists());

        assert!(matches!(
            remove_image(&store, &key("acme/lts")),
            Err(ZnxError::NotDeployed(_))
        ));
    }

    #[test]
    fn stats_report_source_size_and_no_backup() {
        let root = tempdir().unwrap();
        let store = Store::new(root.path());
        let payload = vec![9u8; 123_456];
        let _src = deploy(&store, "acme/os", &payload);

        let stats = image_stats(&store, &key("acme/os")).unwrap();
        assert_eq!(stats.active_size, payload.len() as u64);
        assert!(stats.backup_size.is_none());
        assert!(!stats.updatable);

        fs::write(store.resolve(&key("acme/os")).backup, b"1234").unwrap();
        let stats = image_stats(&store, &key("acme/os")).unwrap();
        assert_eq!(stats.backup_size, Some(4));
    }

    #[test]
    fn operations_on_unknown_images_fail_not_deployed() {
        let root = tempdir().unwrap();
        let store = Store::new(root.path());
        let missing = key("acme/none");
        assert!(matches!(clean_image(&store, &missing), Err(ZnxError::NotDeployed(_))));
        assert!(matches!(reset_image(&store, &missing), Err(ZnxError::NotDeployed(_))));
        assert!(matches!(image_stats(&store, &missing), Err(ZnxError::NotDeployed(_))));
        assert!(matches!(revert_image(&store, &missing), Err(ZnxError::NoBackup(_))));
    }

    #[test]
    fn stats_rows_carry_exact_byte_counts() {
        let root = tempdir().unwrap();
        let store = Store::new(root.path());
        let _src = deploy(&store, "acme/os", &vec![1u8; 123_456]);
        fs::write(store.resolve(&key("acme/os")).backup, vec![2u8; 2048]).unwrap();

        let stats = image_stats(&store, &key("acme/os")).unwrap();
        let rows = stats_rows(&stats);
        let cell = |name: &str| {
            rows.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert!(cell("Image size").ends_with("(123456 bytes)"));
        assert!(cell("Backup size").ends_with("(2048 bytes)"));
        assert_eq!(cell("Updatable"), "no");
    }
}

