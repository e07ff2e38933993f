// ============================================================================
// src/util/interrupt.rs – Turn termination signals into a pollable flag
// ============================================================================

use crate::error::{Result, ZnxError};
use anyhow::Context;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static SIGNALLED: AtomicBool = AtomicBool::new(false);

/// Cancellation token shared by the long-running phases of a command.
///
/// Once `install` has run, SIGINT, SIGTERM and SIGHUP no longer terminate the
/// process. They raise the flag, the running phase returns
/// `ZnxError::Interrupted`, and every guard on the stack unwinds normally.
#[derive(Clone, Debug, Default)]
pub struct Interrupt {
    local: Arc<AtomicBool>,
    watch_signals: bool,
}

impl Interrupt {
    /// Route termination signals into the process-wide flag. Call once.
    pub fn install() -> Result<Self> {
        ctrlc::set_handler(|| {
            SIGNALLED.store(true, Ordering::SeqCst);
        })
        .context("install termination signal handler")?;
        Ok(Self {
            local: Arc::new(AtomicBool::new(false)),
            watch_signals: true,
        })
    }

    /// Token that ignores process signals; only `trigger` raises it.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.local.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.local.load(Ordering::SeqCst)
            || (self.watch_signals && SIGNALLED.load(Ordering::SeqCst))
    }

    pub fn check(&self) -> Result<()> {
        if self.is_raised() {
            return Err(ZnxError::Interrupted);
        }
        Ok(())
    }
}
