// ============================================================================
// src/cmd/deploy.rs – Materialize a new image from a local file or a URL
// ============================================================================

use crate::cmd::base::{resolve, AXEL_BINARIES};
use crate::config::Config;
use crate::error::{Result, ZnxError};
use crate::session::MountSession;
use crate::store::{ImageKey, ImagePaths, Store};
use crate::ui::{human_size, UX};
use crate::util::atomic::{remove_if_present, rename_durable};
use crate::util::audit::audit_log;
use crate::util::interrupt::Interrupt;
use anyhow::{anyhow, Context};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const COPY_CHUNK: usize = 4 * 1024 * 1024;

/// Where a new image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Local(PathBuf),
    Remote(String),
}

impl Source {
    pub fn parse(locator: &str) -> Self {
        let remote = ["http://", "https://", "ftp://"]
            .iter()
            .any(|scheme| locator.starts_with(scheme));
        if remote {
            Source::Remote(locator.to_string())
        } else {
            Source::Local(PathBuf::from(locator))
        }
    }
}

/// Download collaborator.
pub trait Fetch {
    fn fetch(&self, url: &str, dest: &Path, interrupt: &Interrupt) -> Result<()>;
}

/// Accelerated download via `axel`.
#[derive(Debug)]
pub struct Axel {
    pub timeout: Duration,
}

impl Fetch for Axel {
    fn fetch(&self, url: &str, dest: &Path, interrupt: &Interrupt) -> Result<()> {
        let out_path = dest
            .to_str()
            .ok_or_else(|| anyhow!("invalid destination path"))?;
        let cmd = resolve(AXEL_BINARIES, self.timeout)?;
        cmd.run_cancellable(&["-a", "-n", "16", "-o", out_path, url], interrupt)?
            .ensure_success("axel")?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct DeployOptions {
    pub verify_copy: bool,
}

/// Create `key` in `store` and fill its active slot from `source`.
///
/// Interrupts and failures remove the partial image before the error
/// propagates, so a half-written image never shows up in `list`.
pub fn deploy_image(
    store: &Store,
    key: &ImageKey,
    source: &Source,
    fetcher: &dyn Fetch,
    opts: &DeployOptions,
    interrupt: &Interrupt,
) -> Result<u64> {
    let paths = store.resolve(key);
    if paths.is_deployed() {
        return Err(ZnxError::AlreadyDeployed(key.to_string()));
    }

    let vendor_existed = paths.vendor_dir.exists();

    match materialize(&paths, source, fetcher, opts, interrupt) {
        Ok(size) => Ok(size),
        Err(err) => {
            discard_partial(&paths, vendor_existed);
            match err {
                ZnxError::Interrupted => Err(ZnxError::Interrupted),
                other => Err(ZnxError::DeployFailed {
                    image: key.to_string(),
                    reason: other.to_string(),
                }),
            }
        }
    }
}

/// Remove what a failed deployment left behind: the staging file, the
/// release directory while it holds no active image, and the vendor
/// directory if this deployment created it.
fn discard_partial(paths: &ImagePaths, vendor_existed: bool) {
    if let Err(err) = remove_if_present(&paths.staging) {
        warn!("compensating cleanup failed: {err:#}");
    }
    if paths.is_deployed() {
        return;
    }
    let target = if vendor_existed {
        &paths.dir
    } else {
        &paths.vendor_dir
    };
    if target.exists() {
        if let Err(err) = fs::remove_dir_all(target) {
            warn!(dir = %target.display(), "compensating cleanup failed: {err}");
        }
    }
}

fn materialize(
    paths: &ImagePaths,
    source: &Source,
    fetcher: &dyn Fetch,
    opts: &DeployOptions,
    interrupt: &Interrupt,
) -> Result<u64> {
    fs::create_dir_all(&paths.user_data)
        .with_context(|| format!("create {}", paths.user_data.display()))?;

    match source {
        Source::Local(src) => copy_local(src, &paths.staging, opts.verify_copy, interrupt)?,
        Source::Remote(url) => fetcher.fetch(url, &paths.staging, interrupt)?,
    }
    interrupt.check()?;

    let size = fs::metadata(&paths.staging)
        .with_context(|| format!("stat {}", paths.staging.display()))?
        .len();
    rename_durable(&paths.staging, &paths.active)?;
    Ok(size)
}

/// Byte-for-byte copy in chunks, polling `interrupt` between chunks.
fn copy_local(src: &Path, dest: &Path, verify: bool, interrupt: &Interrupt) -> Result<()> {
    let mut input = File::open(src).with_context(|| format!("open {}", src.display()))?;
    if !input.metadata().map(|m| m.is_file()).unwrap_or(false) {
        return Err(anyhow!("{} is not a regular file", src.display()).into());
    }
    let mut output = File::create(dest).with_context(|| format!("create {}", dest.display()))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        interrupt.check()?;
        let n = input
            .read(&mut buf)
            .with_context(|| format!("read {}", src.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        output
            .write_all(&buf[..n])
            .with_context(|| format!("write {}", dest.display()))?;
    }
    output
        .sync_all()
        .with_context(|| format!("sync {}", dest.display()))?;

    if verify {
        let expected = hex::encode(hasher.finalize());
        let actual = sha256_file(dest, interrupt)?;
        if expected != actual {
            return Err(anyhow!(
                "integrity check failed for {} (expected {}, found {})",
                dest.display(),
                expected,
                actual
            )
            .into());
        }
    }
    Ok(())
}

fn sha256_file(path: &Path, interrupt: &Interrupt) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        interrupt.check()?;
        let n = file
            .read(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn run_deploy(
    ui: &UX,
    cfg: &Config,
    device: &Path,
    image: &str,
    locator: &str,
    interrupt: &Interrupt,
) -> Result<()> {
    let key: ImageKey = image.parse()?;
    let source = Source::parse(locator);
    let session = MountSession::acquire(device, &cfg.store.root, cfg.timeouts.command())?;
    let store = Store::new(session.store_root());

    ui.info(&format!("Deploying {key} from {locator}..."));
    let fetcher = Axel {
        timeout: cfg.timeouts.transfer(),
    };
    let opts = DeployOptions {
        verify_copy: cfg.transfer.verify_copy,
    };
    let size = deploy_image(&store, &key, &source, &fetcher, &opts, interrupt)?;

    info!(image = %key, size, "deployed");
    audit_log("DEPLOY", &format!("image={key} source={locator} size={size}"));
    session.release()?;
    ui.success(&format!("Deployed {key} ({}).", human_size(size)));
    Ok(())
}
