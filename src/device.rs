// ============================================================================
// src/device.rs – Block device checks and label-based partition discovery
// ============================================================================

use crate::cmd::base::{run_external, LSBLK_BINARIES};
use crate::error::{Result, ZnxError};
use anyhow::{anyhow, Context};
use serde::Deserialize;
use std::fs::{self, Metadata};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const BOOT_LABEL: &str = "ZNX_BOOT";
pub const DATA_LABEL: &str = "ZNX_DATA";

const LSBLK_COLUMNS: &str = "NAME,PATH,TYPE,LABEL,PARTLABEL,FSTYPE,MOUNTPOINT";

/// JSON struct for parsing `lsblk -J -o ...`
#[derive(Debug, Deserialize, Clone)]
struct BlockNode {
    name: Option<String>,

    #[serde(default)]
    path: Option<String>,

    #[serde(default, rename = "type")]
    kind: Option<String>,

    #[serde(default)]
    label: Option<String>,

    #[serde(default)]
    partlabel: Option<String>,

    #[serde(default)]
    fstype: Option<String>,

    #[serde(default)]
    mountpoint: Option<String>,

    #[serde(default)]
    children: Option<Vec<BlockNode>>,
}

#[derive(Debug, Deserialize)]
struct LsblkReport {
    blockdevices: Vec<BlockNode>,
}

impl BlockNode {
    fn dev_path(&self) -> Option<PathBuf> {
        match (&self.path, &self.name) {
            (Some(path), _) => Some(PathBuf::from(path)),
            (None, Some(name)) => Some(Path::new("/dev").join(name)),
            (None, None) => None,
        }
    }
}

/// Flatten devices recursively
fn flatten_devices(devs: &[BlockNode], list: &mut Vec<BlockNode>) {
    for d in devs {
        list.push(d.clone());
        if let Some(ch) = &d.children {
            flatten_devices(ch, list);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub path: PathBuf,
    /// Filesystem label.
    pub label: Option<String>,
    /// GPT partition name.
    pub partlabel: Option<String>,
    pub fstype: Option<String>,
    pub mountpoint: Option<String>,
}

/// Snapshot of one device and its partitions as `lsblk` reported them.
#[derive(Debug, Clone)]
pub struct DeviceLayout {
    pub device: PathBuf,
    pub mountpoint: Option<String>,
    pub partitions: Vec<Partition>,
}

impl DeviceLayout {
    pub fn scan(device: &Path, timeout: Duration) -> Result<Self> {
        let dev = device
            .to_str()
            .ok_or_else(|| anyhow!("device path is not valid UTF-8"))?;
        let out = run_external(LSBLK_BINARIES, &["-J", "-b", "-o", LSBLK_COLUMNS, dev], timeout)?
            .ensure_success("lsblk")?;
        Self::parse(device, &out.stdout)
    }

    fn parse(device: &Path, json: &str) -> Result<Self> {
        let report: LsblkReport =
            serde_json::from_str(json).context("failed to parse lsblk JSON")?;
        let mut flat = Vec::new();
        flatten_devices(&report.blockdevices, &mut flat);

        let mut mountpoint = None;
        let mut partitions = Vec::new();
        for node in flat {
            let Some(path) = node.dev_path() else {
                continue;
            };
            if node.kind.as_deref() == Some("part") {
                partitions.push(Partition {
                    path,
                    label: node.label,
                    partlabel: node.partlabel,
                    fstype: node.fstype,
                    mountpoint: node.mountpoint,
                });
            } else if path == device {
                mountpoint = node.mountpoint;
            }
        }
        debug!(device = %device.display(), count = partitions.len(), "enumerated partitions");

        Ok(Self {
            device: device.to_path_buf(),
            mountpoint,
            partitions,
        })
    }

    /// First partition whose filesystem carries `label`.
    pub fn find_by_label(&self, label: &str) -> Option<&Partition> {
        self.find(label, |p| p.label.as_deref())
    }

    /// First partition whose GPT name is `name`.
    pub fn find_by_partlabel(&self, name: &str) -> Option<&Partition> {
        self.find(name, |p| p.partlabel.as_deref())
    }

    fn find<F>(&self, wanted: &str, key: F) -> Option<&Partition>
    where
        F: Fn(&Partition) -> Option<&str>,
    {
        let mut hits = self.partitions.iter().filter(|p| key(p) == Some(wanted));
        let first = hits.next();
        if hits.next().is_some() {
            warn!(
                device = %self.device.display(),
                label = wanted,
                "several partitions share a role label; using the first"
            );
        }
        first
    }

    /// Any mountpoint held by the device itself or one of its partitions.
    pub fn busy_mountpoint(&self) -> Option<&str> {
        self.mountpoint
            .as_deref()
            .into_iter()
            .chain(self.partitions.iter().filter_map(|p| p.mountpoint.as_deref()))
            .find(|m| !m.is_empty())
    }
}

fn describe_target(meta: &Metadata) -> &'static str {
    let ty = meta.file_type();
    if ty.is_block_device() {
        "block device"
    } else if ty.is_char_device() {
        "character device"
    } else if meta.is_dir() {
        "directory"
    } else if meta.is_file() {
        "regular file"
    } else {
        "unknown"
    }
}

/// Fail with `NotBlockDevice` unless `device` resolves to a block special file.
pub fn require_block_device(device: &Path) -> Result<()> {
    match fs::metadata(device) {
        Ok(meta) if meta.file_type().is_block_device() => Ok(()),
        Ok(meta) => {
            debug!(device = %device.display(), kind = describe_target(&meta), "rejected target");
            Err(ZnxError::NotBlockDevice(device.to_path_buf()))
        }
        Err(_) => Err(ZnxError::NotBlockDevice(device.to_path_buf())),
    }
}

/// Fail with `DeviceBusy` if anything on the device is mounted.
pub fn require_unmounted(layout: &DeviceLayout) -> Result<()> {
    match layout.busy_mountpoint() {
        Some(mountpoint) => Err(ZnxError::DeviceBusy {
            device: layout.device.clone(),
            mountpoint: mountpoint.to_string(),
        }),
        None => Ok(()),
    }
}
