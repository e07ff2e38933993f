// ============================================================================
// src/error.rs – Domain error kinds surfaced to the operator
// ============================================================================

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ZnxError>;

/// Every failure aborts the invocation; the CLI maps all of them to exit 1.
#[derive(Error, Debug)]
pub enum ZnxError {
    #[error("{0}")]
    Argument(String),

    #[error("{} is not a block device.", .0.display())]
    NotBlockDevice(PathBuf),

    /// The device or one of its partitions is mounted somewhere.
    #[error("{} is busy: unmount {mountpoint} first.", .device.display())]
    DeviceBusy { device: PathBuf, mountpoint: String },

    #[error("{} is not initialized: {reason}", .device.display())]
    NotInitialized { device: PathBuf, reason: String },

    #[error("invalid image name '{0}' (expected <vendor>/<release> made of [A-Za-z0-9._])")]
    InvalidImageName(String),

    #[error("image '{0}' is not deployed.")]
    NotDeployed(String),

    #[error("image '{0}' is already deployed; remove it first.")]
    AlreadyDeployed(String),

    #[error("failed to deploy '{image}': {reason}")]
    DeployFailed { image: String, reason: String },

    #[error("image '{0}' does not carry update information.")]
    NoUpdateInfo(String),

    #[error("failed to update '{image}': {reason}")]
    UpdateFailed { image: String, reason: String },

    #[error("image '{0}' has no backup to revert to.")]
    NoBackup(String),

    #[error("failed to reset '{image}': {reason}")]
    ResetFailed { image: String, reason: String },

    #[error("interrupted")]
    Interrupted,

    #[error("{0:#}")]
    OperationFailed(#[source] anyhow::Error),
}

impl ZnxError {
    /// Render an ambient failure chain the way the operator sees it.
    pub(crate) fn reason(err: &anyhow::Error) -> String {
        format!("{err:#}")
    }
}

/// Domain errors that travelled through an `anyhow` layer keep their kind.
impl From<anyhow::Error> for ZnxError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ZnxError>() {
            Ok(domain) => domain,
            Err(other) => ZnxError::OperationFailed(other),
        }
    }
}

impl From<std::io::Error> for ZnxError {
    fn from(err: std::io::Error) -> Self {
        ZnxError::OperationFailed(err.into())
    }
}
