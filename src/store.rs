// ============================================================================
// src/store.rs – Image store addressing: <store>/<vendor>/<release>/
// ============================================================================

use crate::error::{Result, ZnxError};
use anyhow::Context;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const ACTIVE_IMAGE: &str = "IMAGE.0";
pub const BACKUP_IMAGE: &str = "IMAGE.0.zs-old";
pub const SYNC_OUTPUT: &str = "IMAGE.0.zs-new";
pub const ROTATING: &str = "IMAGE.0.zs-prev";
pub const DEPLOY_STAGING: &str = "IMAGE.0.part";
pub const USER_DATA: &str = "DATA";

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
}

/// `(vendor, release)`, written `vendor/release` on the command line.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageKey {
    pub vendor: String,
    pub release: String,
}

impl ImageKey {
    pub fn new(vendor: &str, release: &str) -> Result<Self> {
        if !valid_segment(vendor) || !valid_segment(release) {
            return Err(ZnxError::InvalidImageName(format!("{vendor}/{release}")));
        }
        Ok(Self {
            vendor: vendor.to_string(),
            release: release.to_string(),
        })
    }
}

impl FromStr for ImageKey {
    type Err = ZnxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((vendor, release)) if !release.contains('/') => Self::new(vendor, release)
                .map_err(|_| ZnxError::InvalidImageName(s.to_string())),
            _ => Err(ZnxError::InvalidImageName(s.to_string())),
        }
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.vendor, self.release)
    }
}

/// Fixed locations inside one image directory.
#[derive(Debug, Clone)]
pub struct ImagePaths {
    pub key: ImageKey,
    pub vendor_dir: PathBuf,
    pub dir: PathBuf,
    pub active: PathBuf,
    pub backup: PathBuf,
    pub sync_output: PathBuf,
    pub rotating: PathBuf,
    pub staging: PathBuf,
    pub user_data: PathBuf,
}

impl ImagePaths {
    pub fn is_deployed(&self) -> bool {
        self.active.is_file()
    }

    pub fn require_deployed(&self) -> Result<()> {
        if !self.is_deployed() {
            return Err(ZnxError::NotDeployed(self.key.to_string()));
        }
        Ok(())
    }

    pub fn has_backup(&self) -> bool {
        self.backup.is_file()
    }
}

/// The mounted store root.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, key: &ImageKey) -> ImagePaths {
        let vendor_dir = self.root.join(&key.vendor);
        let dir = vendor_dir.join(&key.release);
        ImagePaths {
            key: key.clone(),
            active: dir.join(ACTIVE_IMAGE),
            backup: dir.join(BACKUP_IMAGE),
            sync_output: dir.join(SYNC_OUTPUT),
            rotating: dir.join(ROTATING),
            staging: dir.join(DEPLOY_STAGING),
            user_data: dir.join(USER_DATA),
            vendor_dir,
            dir,
        }
    }

    /// Every deployed `(vendor, release)` in the store, sorted. Release
    /// directories without an active image are leftovers and are skipped.
    pub fn list(&self) -> Result<Vec<ImageKey>> {
        let mut keys = Vec::new();
        for vendor in subdirectories(&self.root)? {
            for release in subdirectories(&self.root.join(&vendor))? {
                // Foreign entries that do not fit the naming scheme are skipped.
                match ImageKey::new(&vendor, &release) {
                    Ok(key) if self.resolve(&key).is_deployed() => keys.push(key),
                    _ => {}
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn subdirectories(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(err) => {
            return Err(anyhow::Error::new(err)
                .context(format!("read directory {}", dir.display()))
                .into())
        }
    };
    for entry in entries {
        let entry = entry.with_context(|| format!("read directory {}", dir.display()))?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}
