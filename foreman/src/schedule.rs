//! Polling-loop scaffolding: cooperative shutdown and `run_once`/`run_forever`.
//!
//! Every role (batch driver, inbox poller, bridge, watcher) is a [`Pass`]. Tests
//! call `run_once` directly; binaries call `run_forever` with a [`Shutdown`]
//! wired to SIGINT/SIGTERM.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::error::is_cancelled;

/// Granularity at which sleeping loops notice a shutdown request.
pub const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Cloneable cooperative shutdown flag.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag from SIGINT/SIGTERM. Call at most once per process.
    pub fn install_signal_handler(&self) -> Result<()> {
        let flag = self.flag.clone();
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::SeqCst);
        })
        .context("install signal handler")
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early on shutdown.
    ///
    /// Returns `false` if shutdown was requested.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_requested() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            thread::sleep(remaining.min(SHUTDOWN_POLL));
        }
    }
}

/// One scan-and-act cycle of a polling role.
pub trait Pass {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Perform exactly one cycle.
    fn run_once(&mut self) -> Result<()>;

    /// Repeat `run_once` every `interval` until shutdown.
    ///
    /// A failed cycle is logged and the loop continues; cancellation ends it.
    fn run_forever(&mut self, interval: Duration, shutdown: &Shutdown) -> Result<()> {
        info!(pass = self.name(), interval_secs = interval.as_secs_f64(), "loop started");
        let mut cycles = 0u64;
        while !shutdown.is_requested() {
            cycles += 1;
            match self.run_once() {
                Ok(()) => debug!(pass = self.name(), cycles, "cycle complete"),
                Err(err) if is_cancelled(&err) => break,
                Err(err) => warn!(pass = self.name(), cycles, err = %format!("{err:#}"), "cycle failed"),
            }
            if !shutdown.sleep(interval) {
                break;
            }
        }
        info!(pass = self.name(), cycles, "loop stopped");
        Ok(())
    }
}
