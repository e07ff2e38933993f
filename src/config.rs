// ============================================================================
// src/config.rs – strict config loader
// ============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/znx.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreCfg {
    /// Directory on the data partition that holds `<vendor>/<release>`.
    #[serde(default = "default_store_root")]
    pub root: String,
}

fn default_store_root() -> String {
    "STORE".to_string()
}

impl Default for StoreCfg {
    fn default() -> Self {
        Self {
            root: default_store_root(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFs {
    Btrfs,
    Ext4,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCfg {
    #[serde(default = "default_data_fs")]
    pub data_fs: DataFs,
}

fn default_data_fs() -> DataFs {
    DataFs::Btrfs
}

impl Default for DeviceCfg {
    fn default() -> Self {
        Self {
            data_fs: default_data_fs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetsCfg {
    /// Source of `bootx64.efi`, `grub.cfg` and `themes/`.
    #[serde(default = "default_assets_dir")]
    pub dir: PathBuf,
}

fn default_assets_dir() -> PathBuf {
    PathBuf::from("/usr/share/znx")
}

impl Default for AssetsCfg {
    fn default() -> Self {
        Self {
            dir: default_assets_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferCfg {
    /// Re-read a locally copied image and compare SHA-256 digests.
    #[serde(default = "default_true")]
    pub verify_copy: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TransferCfg {
    fn default() -> Self {
        Self {
            verify_copy: default_true(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsCfg {
    #[serde(default = "default_command_secs")]
    pub command_secs: u64,
    #[serde(default = "default_format_secs")]
    pub format_secs: u64,
    /// Upper bound for downloads and delta-syncs.
    #[serde(default = "default_transfer_secs")]
    pub transfer_secs: u64,
}

fn default_command_secs() -> u64 {
    30
}

fn default_format_secs() -> u64 {
    600
}

fn default_transfer_secs() -> u64 {
    6 * 60 * 60
}

impl Default for TimeoutsCfg {
    fn default() -> Self {
        Self {
            command_secs: default_command_secs(),
            format_secs: default_format_secs(),
            transfer_secs: default_transfer_secs(),
        }
    }
}

impl TimeoutsCfg {
    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs.max(1))
    }

    pub fn format(&self) -> Duration {
        Duration::from_secs(self.format_secs.max(1))
    }

    pub fn transfer(&self) -> Duration {
        Duration::from_secs(self.transfer_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditCfg {
    /// Append-only log of destructive operations; `None` disables it.
    #[serde(default = "default_audit_path")]
    pub log_path: Option<PathBuf>,
}

fn default_audit_path() -> Option<PathBuf> {
    Some(PathBuf::from("/var/log/znx.log"))
}

impl Default for AuditCfg {
    fn default() -> Self {
        Self {
            log_path: default_audit_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreCfg,
    #[serde(default)]
    pub device: DeviceCfg,
    #[serde(default)]
    pub assets: AssetsCfg,
    #[serde(default)]
    pub transfer: TransferCfg,
    #[serde(default)]
    pub timeouts: TimeoutsCfg,
    #[serde(default)]
    pub audit: AuditCfg,
}

impl Config {
    pub fn load<P: AsRef<Path>>(p: P) -> Result<Self> {
        let s = fs::read_to_string(&p)
            .with_context(|| format!("read config: {}", p.as_ref().display()))?;
        let cfg: Self = if p.as_ref().extension().and_then(|e| e.to_str()) == Some("toml") {
            toml::from_str(&s).context("toml parse")?
        } else {
            serde_yaml::from_str(&s).context("yaml parse")?
        };
        Ok(cfg)
    }

    /// An absent default config means built-in defaults; an absent file the
    /// operator asked for is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load(DEFAULT_CONFIG_PATH),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, DataFs};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn partial_toml_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("znx.toml");
        fs::write(&path, "[device]\ndata_fs = \"ext4\"\n").unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.device.data_fs, DataFs::Ext4);
        assert_eq!(cfg.store.root, "STORE");
        assert!(cfg.transfer.verify_copy);
    }

    #[test]
    fn yaml_is_accepted_by_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("znx.yaml");
        fs::write(&path, "store:\n  root: IMAGES\naudit:\n  log_path: null\n").unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.store.root, "IMAGES");
        assert!(cfg.audit.log_path.is_none());
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(Config::load_or_default(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn unknown_filesystem_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("znx.toml");
        fs::write(&path, "[device]\ndata_fs = \"ntfs\"\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
