// ============================================================================
// src/cmd/base.rs – Allowlisted external command runner (for system utilities)
// ============================================================================

use crate::error::ZnxError;
use crate::util::interrupt::Interrupt;
use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

pub const WIPEFS_BINARIES: &[&str] = &["/sbin/wipefs", "/usr/sbin/wipefs", "/usr/bin/wipefs"];
pub const SGDISK_BINARIES: &[&str] = &["/sbin/sgdisk", "/usr/sbin/sgdisk", "/usr/bin/sgdisk"];
pub const MKFS_VFAT_BINARIES: &[&str] = &[
    "/sbin/mkfs.vfat",
    "/usr/sbin/mkfs.vfat",
    "/usr/bin/mkfs.vfat",
];
pub const MKFS_BTRFS_BINARIES: &[&str] = &[
    "/sbin/mkfs.btrfs",
    "/usr/sbin/mkfs.btrfs",
    "/usr/bin/mkfs.btrfs",
];
pub const MKFS_EXT4_BINARIES: &[&str] = &[
    "/sbin/mkfs.ext4",
    "/usr/sbin/mkfs.ext4",
    "/usr/bin/mkfs.ext4",
];
pub const LSBLK_BINARIES: &[&str] = &["/bin/lsblk", "/usr/bin/lsblk"];
pub const MOUNT_BINARIES: &[&str] = &["/bin/mount", "/usr/bin/mount"];
pub const UMOUNT_BINARIES: &[&str] = &["/bin/umount", "/usr/bin/umount"];
pub const UDEVADM_BINARIES: &[&str] = &["/sbin/udevadm", "/usr/sbin/udevadm", "/usr/bin/udevadm"];
pub const AXEL_BINARIES: &[&str] = &["/usr/bin/axel", "/usr/local/bin/axel"];
pub const ZSYNC_BINARIES: &[&str] = &["/usr/bin/zsync", "/usr/local/bin/zsync"];

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Safe wrapper for external process execution.
/// Used for invoking allowlisted system tools like `sgdisk`, `mount`, `zsync`.
#[derive(Debug)]
pub struct Cmd {
    pub path: String,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct OutputData {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl OutputData {
    /// Fail with the tool's own diagnostics when it exited non-zero.
    pub fn ensure_success(self, what: &str) -> Result<Self> {
        if self.status != 0 {
            return Err(anyhow!(
                "{} exited with status {}: {}",
                what,
                self.status,
                self.stderr.trim()
            ));
        }
        Ok(self)
    }
}

fn is_allowlisted(path: &str) -> bool {
    [
        WIPEFS_BINARIES,
        SGDISK_BINARIES,
        MKFS_VFAT_BINARIES,
        MKFS_BTRFS_BINARIES,
        MKFS_EXT4_BINARIES,
        LSBLK_BINARIES,
        MOUNT_BINARIES,
        UMOUNT_BINARIES,
        UDEVADM_BINARIES,
        AXEL_BINARIES,
        ZSYNC_BINARIES,
    ]
    .iter()
    .any(|group| group.contains(&path))
}

impl Cmd {
    /// Create a new allowlisted command runner.
    pub fn new_allowlisted<S: Into<String>>(path: S, timeout: Duration) -> Result<Self> {
        let path_str = path.into();
        if !is_allowlisted(&path_str) {
            return Err(anyhow!("Command '{}' not in allowlist", path_str));
        }

        Ok(Self {
            path: path_str,
            timeout,
        })
    }

    /// Run command with arguments, returning `OutputData`
    pub fn run(&self, args: &[&str]) -> Result<OutputData> {
        let child = self.spawn(args)?;
        self.wait(child, None)
    }

    /// Like `run`, but terminates the child and fails with
    /// `ZnxError::Interrupted` once the token is raised.
    pub fn run_cancellable(
        &self,
        args: &[&str],
        interrupt: &Interrupt,
    ) -> std::result::Result<OutputData, ZnxError> {
        interrupt.check()?;
        let child = self.spawn(args)?;
        Ok(self.wait(child, Some(interrupt))?)
    }

    fn spawn(&self, args: &[&str]) -> Result<Child> {
        debug!(program = %self.path, ?args, "spawning");
        Command::new(&self.path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn {}", self.path))
    }

    fn wait(&self, mut child: Child, interrupt: Option<&Interrupt>) -> Result<OutputData> {
        let start = Instant::now();
        // Progress output of transfer tools fills a pipe long before they exit.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        loop {
            if let Some(status) = child.try_wait().context("try_wait")? {
                return Ok(OutputData {
                    stdout: collect(stdout),
                    stderr: collect(stderr),
                    status: status.code().unwrap_or(-1),
                });
            }
            if interrupt.is_some_and(Interrupt::is_raised) {
                terminate(&mut child);
                return Err(ZnxError::Interrupted.into());
            }
            if start.elapsed() > self.timeout {
                terminate(&mut child);
                return Err(anyhow!(
                    "{} timed out after {:?}",
                    self.path,
                    self.timeout
                ));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Best effort terminate, then kill.
fn terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal::SIGTERM};
    use nix::unistd::Pid;

    let _ = kill(Pid::from_raw(child.id() as i32), SIGTERM);
    thread::sleep(Duration::from_millis(200));
    let _ = child.kill();
    let _ = child.wait();
}

/// Run the first candidate binary that exists on this system.
pub fn run_external(candidates: &[&str], args: &[&str], timeout: Duration) -> Result<OutputData> {
    resolve(candidates, timeout)?.run(args)
}

pub fn resolve(candidates: &[&str], timeout: Duration) -> Result<Cmd> {
    for &path in candidates {
        if Path::new(path).exists() {
            return Cmd::new_allowlisted(path, timeout);
        }
    }
    Err(anyhow!(
        "None of the candidate binaries {:?} were found on this system",
        candidates
    ))
}
