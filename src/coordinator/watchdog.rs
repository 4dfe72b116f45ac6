//! Heartbeat and interrupt handling
//!
//! The coordinator calls [`Heartbeat::beat`] at every step of its main loop.
//! When the user presses Ctrl-C the handler looks at how long ago the last
//! beat was:
//!
//! - within the grace period: the run is healthy, so the shared
//!   [`CancelToken`] is triggered and the coordinator winds down on its own
//!   (reported as "Exiting.", exit status 0)
//! - older than that: the coordinator is wedged somewhere, so the process
//!   prints "Aborting stuck process." and exits with status 1 immediately

use super::Phase;
use crate::util::time::format_duration;
use crate::worker::channel::CancelToken;
use crate::Result;
use anyhow::Context;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Grace period used when none is configured
pub const DEFAULT_STUCK_GRACE: Duration = Duration::from_secs(5);

/// Last sign of life from the coordinator
#[derive(Debug, Clone)]
pub struct Heartbeat {
    origin: Instant,
    /// Milliseconds since `origin` at the last beat
    last_ms: Arc<AtomicU64>,
    phase: Arc<AtomicU8>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: Arc::new(AtomicU64::new(0)),
            phase: Arc::new(AtomicU8::new(Phase::Validating as u8)),
        }
    }

    pub fn beat(&self, phase: Phase) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::SeqCst);
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    pub fn since_last(&self) -> Duration {
        let now = self.origin.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::SeqCst)))
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// How an interrupt should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptVerdict {
    /// The coordinator is responsive; cancel and let it exit cleanly
    Clean,
    /// No heartbeat for `idle` while in `phase`
    Stuck { idle: Duration, phase: Phase },
}

pub fn classify(heartbeat: &Heartbeat, grace: Duration) -> InterruptVerdict {
    let idle = heartbeat.since_last();
    if idle > grace {
        InterruptVerdict::Stuck { idle, phase: heartbeat.phase() }
    } else {
        InterruptVerdict::Clean
    }
}

/// Install the process-wide Ctrl-C handler
pub fn install_interrupt_handler(heartbeat: Heartbeat, cancel: CancelToken, grace: Duration) -> Result<()> {
    ctrlc::set_handler(move || match classify(&heartbeat, grace) {
        InterruptVerdict::Clean => cancel.cancel(),
        InterruptVerdict::Stuck { idle, phase } => {
            eprintln!();
            eprintln!("Aborting stuck process.");
            eprintln!("No progress for {} while {}.", format_duration(idle), phase.describe());
            std::process::exit(1);
        }
    })
    .context("Failed to install Ctrl-C handler")
}
