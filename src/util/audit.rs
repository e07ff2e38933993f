// ============================================================================
// src/util/audit.rs – Minimal append-only audit trail
// ============================================================================

use chrono::Local;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::OnceLock;

static AUDIT_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Point the audit trail at `path`. Without this call auditing is a no-op.
pub fn init(path: PathBuf) {
    let _ = AUDIT_PATH.set(path);
}

/// Append a timestamped event to the audit log (0600 permissions).
/// Silent failure if log is unwritable – avoids blocking main logic.
pub fn audit_log(event: &str, detail: &str) {
    let Some(path) = AUDIT_PATH.get() else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
    {
        let ts = Local::now().format("%Y-%m-%d %H:%M:%S");
        let _ = writeln!(file, "[{ts}] {event}: {detail}");
    }
}
