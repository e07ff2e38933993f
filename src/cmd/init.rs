// ============================================================================
// src/cmd/init.rs – Device initialization and boot partition re-seeding
// (Wipes the device, lays out ZNX_BOOT + ZNX_DATA, formats, copies loader)
// ============================================================================

use anyhow::{anyhow, Context};
use dialoguer::Confirm;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::cmd::base::{
    run_external, MKFS_BTRFS_BINARIES, MKFS_EXT4_BINARIES, MKFS_VFAT_BINARIES, SGDISK_BINARIES,
    UDEVADM_BINARIES, WIPEFS_BINARIES,
};
use crate::config::{Config, DataFs};
use crate::device::{self, DeviceLayout, BOOT_LABEL, DATA_LABEL};
use crate::error::{Result, ZnxError};
use crate::session::{Mount, MountSession};
use crate::ui::UX;
use crate::util::audit::audit_log;
use crate::util::interrupt::Interrupt;

const BOOT_SIZE: &str = "+64M";

/// Loader assets: (file name in the asset directory, destination on the ESP).
const BOOT_FILES: &[(&str, &str)] = &[
    ("bootx64.efi", "efi/boot/bootx64.efi"),
    ("grub.cfg", "boot/grub/grub.cfg"),
];
const THEMES_SRC: &str = "themes";
const THEMES_DEST: &str = "boot/grub/themes";

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Skip the interactive confirmation.
    pub assume_yes: bool,
}

// ----------------------------------------------------------------------------
// Public entrypoints
// ----------------------------------------------------------------------------

pub fn run_init(
    ui: &UX,
    cfg: &Config,
    device: &Path,
    opts: &InitOptions,
    interrupt: &Interrupt,
) -> Result<()> {
    device::require_block_device(device)?;
    let layout = DeviceLayout::scan(device, cfg.timeouts.command())?;
    device::require_unmounted(&layout)?;
    let dev = dev_str(device)?;

    ui.data_panel(
        "Initialization plan",
        &[
            ("Device", dev.to_string()),
            ("Boot", format!("64 MiB FAT32, label {BOOT_LABEL}")),
            (
                "Data",
                format!("{} (rest of device), label {DATA_LABEL}", fs_name(cfg.device.data_fs)),
            ),
            ("Assets", cfg.assets.dir.display().to_string()),
        ],
    );
    ui.warn(&format!(
        "Every partition, image and file on {dev} will be destroyed."
    ));

    if !opts.assume_yes && ui.interactive() {
        let proceed = Confirm::new()
            .with_prompt(format!("Initialize {dev}?"))
            .default(false)
            .interact()
            .context("read confirmation")?;
        if !proceed {
            return Err(ZnxError::Argument(format!(
                "initialization of {dev} cancelled; nothing was changed"
            )));
        }
    }

    interrupt.check()?;

    if let Err(err) = provision(ui, cfg, device, dev, interrupt) {
        ui.warn(&format!(
            "{dev} may now be partially initialized. Run `znx init {dev}` again."
        ));
        audit_log("INIT_FAILED", &format!("device={dev} err={err}"));
        return Err(err);
    }

    audit_log("INIT_COMPLETE", &format!("device={dev}"));
    ui.success(&format!("{dev} is ready. Deploy an image with `znx deploy`."));
    Ok(())
}

pub fn run_restore_esp(ui: &UX, cfg: &Config, device: &Path, interrupt: &Interrupt) -> Result<()> {
    let timeout = cfg.timeouts.command();
    // Mounting the data partition is what proves the device was initialized.
    let session = MountSession::acquire(device, &cfg.store.root, timeout)?;

    let layout = DeviceLayout::scan(device, timeout)?;
    let boot = layout
        .find_by_label(BOOT_LABEL)
        .ok_or_else(|| ZnxError::NotInitialized {
            device: device.to_path_buf(),
            reason: format!("no partition labelled {BOOT_LABEL}"),
        })?;

    ui.info(&format!(
        "Re-seeding boot loader on {}...",
        boot.path.display()
    ));
    let esp = Mount::attach(&boot.path, timeout)?;
    let copied = seed_boot_assets(&cfg.assets.dir, esp.path(), interrupt)?;
    esp.release()?;
    session.release()?;

    audit_log(
        "RESTORE_ESP",
        &format!("device={} partition={}", device.display(), boot.path.display()),
    );
    ui.success(&format!("Boot partition restored ({copied} files)."));
    Ok(())
}

// ----------------------------------------------------------------------------
// Provisioning steps
// ----------------------------------------------------------------------------

/// Interrupts are honoured between steps; a running external tool finishes first.
fn provision(
    ui: &UX,
    cfg: &Config,
    device: &Path,
    dev: &str,
    interrupt: &Interrupt,
) -> Result<()> {
    let timeout = cfg.timeouts.command();

    ui.info(&format!("Wiping signatures on {dev}..."));
    run_external(WIPEFS_BINARIES, &["-a", "-f", dev], timeout)?.ensure_success("wipefs")?;
    audit_log("INIT_WIPE", &format!("device={dev}"));

    interrupt.check()?;
    ui.info("Writing partition table...");
    for args in sgdisk_steps(dev) {
        interrupt.check()?;
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_external(SGDISK_BINARIES, &args, timeout)?.ensure_success("sgdisk")?;
    }
    audit_log("INIT_PARTITION", &format!("device={dev}"));
    settle_udev(ui, timeout);

    let layout = DeviceLayout::scan(device, timeout)?;
    let boot = layout
        .find_by_partlabel(BOOT_LABEL)
        .ok_or_else(|| anyhow!("partition {BOOT_LABEL} did not appear on {dev}"))?;
    let boot_dev = dev_str(&boot.path)?;

    interrupt.check()?;
    ui.info(&format!("Formatting {boot_dev} as FAT32..."));
    run_external(
        MKFS_VFAT_BINARIES,
        &["-F", "32", "-n", BOOT_LABEL, boot_dev],
        cfg.timeouts.format(),
    )?
    .ensure_success("mkfs.vfat")?;

    interrupt.check()?;
    let esp = Mount::attach(&boot.path, timeout)?;
    let copied = seed_boot_assets(&cfg.assets.dir, esp.path(), interrupt)?;
    esp.release()?;
    ui.success(&format!("Boot partition seeded ({copied} files)."));
    audit_log("INIT_ESP", &format!("partition={boot_dev}"));

    interrupt.check()?;
    // Never format something that was not positively identified.
    let data = layout.find_by_partlabel(DATA_LABEL).ok_or_else(|| {
        anyhow!("partition {DATA_LABEL} did not appear on {dev}; data partition left unformatted")
    })?;
    let data_dev = dev_str(&data.path)?;
    let (candidates, flags) = data_mkfs(cfg.device.data_fs);
    let args: Vec<&str> = flags.iter().copied().chain([data_dev]).collect();

    ui.info(&format!(
        "Formatting {data_dev} as {}...",
        fs_name(cfg.device.data_fs)
    ));
    run_external(candidates, &args, cfg.timeouts.format())?
        .ensure_success(fs_name(cfg.device.data_fs))?;
    audit_log(
        "INIT_DATA",
        &format!("partition={data_dev} fs={}", fs_name(cfg.device.data_fs)),
    );
    info!(device = dev, boot = boot_dev, data = data_dev, "device initialized");
    Ok(())
}

/// `sgdisk` invocations in order. Zapping ends an `sgdisk` run, so the fresh
/// table and the partitions are written by later calls.
fn sgdisk_steps(dev: &str) -> Vec<Vec<String>> {
    let boot_new = format!("1:0:{BOOT_SIZE}");
    let boot_name = format!("1:{BOOT_LABEL}");
    let data_name = format!("2:{DATA_LABEL}");
    let steps: [&[&str]; 4] = [
        &["-Z"],
        &["-o"],
        &["-n", boot_new.as_str(), "-t", "1:EF00", "-c", boot_name.as_str()],
        &["-N", "2", "-t", "2:8300", "-c", data_name.as_str()],
    ];
    steps
        .iter()
        .map(|args| {
            args.iter()
                .map(|a| a.to_string())
                .chain([dev.to_string()])
                .collect()
        })
        .collect()
}

fn data_mkfs(fs: DataFs) -> (&'static [&'static str], &'static [&'static str]) {
    match fs {
        DataFs::Btrfs => (MKFS_BTRFS_BINARIES, &["-f", "-L", DATA_LABEL]),
        DataFs::Ext4 => (MKFS_EXT4_BINARIES, &["-F", "-L", DATA_LABEL]),
    }
}

fn fs_name(fs: DataFs) -> &'static str {
    match fs {
        DataFs::Btrfs => "btrfs",
        DataFs::Ext4 => "ext4",
    }
}

fn settle_udev(ui: &UX, timeout: Duration) {
    let res = run_external(UDEVADM_BINARIES, &["settle"], timeout)
        .and_then(|out| out.ensure_success("udevadm settle"));
    if let Err(err) = res {
        ui.warn(&format!("udevadm settle failed: {err:#}"));
    }
}

fn dev_str(path: &Path) -> anyhow::Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("device path is not valid UTF-8: {}", path.display()))
}

// ----------------------------------------------------------------------------
// Loader assets
// ----------------------------------------------------------------------------

/// Copy the loader from `assets` into the mounted ESP at `esp_root`.
///
/// The EFI binary and `grub.cfg` are required. Themes are optional and
/// replace whatever themes the ESP held before. Returns the number of files
/// written.
pub fn seed_boot_assets(
    assets: &Path,
    esp_root: &Path,
    interrupt: &Interrupt,
) -> anyhow::Result<u64> {
    for (name, _) in BOOT_FILES {
        let src = assets.join(name);
        if !src.is_file() {
            return Err(anyhow!("boot asset {} is missing", src.display()));
        }
    }

    let mut copied = 0;
    for (name, dest) in BOOT_FILES {
        interrupt.check()?;
        let dest = esp_root.join(dest);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::copy(assets.join(name), &dest)
            .with_context(|| format!("copy {name} to {}", dest.display()))?;
        copied += 1;
    }

    let themes_dest = esp_root.join(THEMES_DEST);
    if themes_dest.exists() {
        fs::remove_dir_all(&themes_dest)
            .with_context(|| format!("clear {}", themes_dest.display()))?;
    }
    let themes_src = assets.join(THEMES_SRC);
    if themes_src.is_dir() {
        copied += copy_tree(&themes_src, &themes_dest, interrupt)?;
    } else {
        fs::create_dir_all(&themes_dest)
            .with_context(|| format!("create {}", themes_dest.display()))?;
        debug!(assets = %assets.display(), "no themes shipped");
    }
    Ok(copied)
}

fn copy_tree(src: &Path, dest: &Path, interrupt: &Interrupt) -> anyhow::Result<u64> {
    fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;
    let mut copied = 0;
    for entry in fs::read_dir(src).with_context(|| format!("read {}", src.display()))? {
        interrupt.check()?;
        let entry = entry?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copied += copy_tree(&from, &to, interrupt)?;
        } else {
            fs::copy(&from, &to)
                .with_context(|| format!("copy {} to {}", from.display(), to.display()))?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::{data_mkfs, seed_boot_assets, sgdisk_steps};
    use crate::config::DataFs;
    use crate::error::ZnxError;
    use crate::util::interrupt::Interrupt;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn asset_dir(root: &Path, with_themes: bool) {
        fs::write(root.join("bootx64.efi"), b"MZ-efi").unwrap();
        fs::write(root.join("grub.cfg"), b"set timeout=5\n").unwrap();
        if with_themes {
            fs::create_dir_all(root.join("themes/znx/icons")).unwrap();
            fs::write(root.join("themes/znx/theme.txt"), b"title-text: \"\"").unwrap();
            fs::write(root.join("themes/znx/icons/os.png"), b"png").unwrap();
        }
    }

    #[test]
    fn partition_layout_is_boot_then_data() {
        let steps = sgdisk_steps("/dev/sdb");
        assert_eq!(steps.len(), 4);
        assert_eq!(steps[0], vec!["-Z", "/dev/sdb"]);
        assert_eq!(steps[1], vec!["-o", "/dev/sdb"]);
        assert_eq!(
            steps[2],
            vec!["-n", "1:0:+64M", "-t", "1:EF00", "-c", "1:ZNX_BOOT", "/dev/sdb"]
        );
        assert_eq!(
            steps[3],
            vec!["-N", "2", "-t", "2:8300", "-c", "2:ZNX_DATA", "/dev/sdb"]
        );
    }

    #[test]
    fn data_filesystem_follows_config() {
        let (bins, flags) = data_mkfs(DataFs::Btrfs);
        assert!(bins.iter().all(|b| b.ends_with("mkfs.btrfs")));
        assert_eq!(flags, &["-f", "-L", "ZNX_DATA"]);

        let (bins, flags) = data_mkfs(DataFs::Ext4);
        assert!(bins.iter().all(|b| b.ends_with("mkfs.ext4")));
        assert_eq!(flags, &["-F", "-L", "ZNX_DATA"]);
    }

    #[test]
    fn assets_land_in_the_loader_layout() {
        let assets = tempdir().unwrap();
        let esp = tempdir().unwrap();
        asset_dir(assets.path(), true);

        let copied = seed_boot_assets(assets.path(), esp.path(), &Interrupt::detached()).unwrap();

        assert_eq!(copied, 4);
        assert_eq!(
            fs::read(esp.path().join("efi/boot/bootx64.efi")).unwrap(),
            b"MZ-efi"
        );
        assert!(esp.path().join("boot/grub/grub.cfg").is_file());
        assert!(esp.path().join("boot/grub/themes/znx/icons/os.png").is_file());
    }

    #[test]
    fn reseeding_replaces_stale_themes() {
        let assets = tempdir().unwrap();
        let esp = tempdir().unwrap();
        asset_dir(assets.path(), true);
        fs::create_dir_all(esp.path().join("boot/grub/themes/old")).unwrap();
        fs::write(esp.path().join("boot/grub/themes/old/theme.txt"), b"old").unwrap();
        fs::create_dir_all(esp.path().join("efi/boot")).unwrap();
        fs::write(esp.path().join("efi/boot/bootx64.efi"), b"corrupt").unwrap();

        seed_boot_assets(assets.path(), esp.path(), &Interrupt::detached()).unwrap();

        assert!(!esp.path().join("boot/grub/themes/old").exists());
        assert_eq!(
            fs::read(esp.path().join("efi/boot/bootx64.efi")).unwrap(),
            b"MZ-efi"
        );
    }

    #[test]
    fn themes_are_optional() {
        let assets = tempdir().unwrap();
        let esp = tempdir().unwrap();
        asset_dir(assets.path(), false);

        assert_eq!(seed_boot_assets(assets.path(), esp.path(), &Interrupt::detached()).unwrap(), 2);
        assert!(esp.path().join("boot/grub/themes").is_dir());
    }

    #[test]
    fn missing_loader_is_an_error_and_writes_nothing() {
        let assets = tempdir().unwrap();
        let esp = tempdir().unwrap();
        fs::write(assets.path().join("bootx64.efi"), b"MZ").unwrap();

        let err = seed_boot_assets(assets.path(), esp.path(), &Interrupt::detached()).unwrap_err();
        assert!(err.to_string().contains("grub.cfg"));
        assert_eq!(fs::read_dir(esp.path()).unwrap().count(), 0);
    }

    #[test]
    fn raised_interrupt_stops_seeding() {
        let assets = tempdir().unwrap();
        let esp = tempdir().unwrap();
        asset_dir(assets.path(), true);
        let token = Interrupt::detached();
        token.trigger();

        let err = seed_boot_assets(assets.path(), esp.path(), &token).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ZnxError>(),
            Some(ZnxError::Interrupted)
        ));
        assert!(!esp.path().join("efi/boot/bootx64.efi").exists());
    }
}

