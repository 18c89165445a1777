//! Drain-then-release shutdown protocol.
//!
//! Signal handlers and explicit shutdown requests converge on one
//! sequence: wait (bounded) for the active batch to drain, then release
//! external resources exactly once. An atomic one-shot makes repeated
//! requests from any thread safe; only the first performs the sequence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{info, warn};

use crate::batch::BatchState;
use crate::config::EngineConfig;

type ReleaseFn = Box<dyn FnOnce() + Send>;

pub struct ShutdownCoordinator {
    state: Arc<BatchState>,
    config: EngineConfig,
    requested: AtomicBool,
    release: Mutex<Option<ReleaseFn>>,
}

impl ShutdownCoordinator {
    pub fn new(state: Arc<BatchState>, config: EngineConfig) -> Self {
        Self {
            state,
            config,
            requested: AtomicBool::new(false),
            release: Mutex::new(None),
        }
    }

    /// Register the resource-release step; runs exactly once, after the
    /// drain wait, on whichever thread wins the shutdown race.
    pub fn on_release<F>(&self, release: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.release.lock().expect("release slot poisoned");
        *slot = Some(Box::new(release));
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Perform the shutdown sequence. Returns true for the caller that
    /// won the one-shot; later callers get false and nothing runs twice.
    pub fn request_shutdown(&self) -> bool {
        if self
            .requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("Shutdown already in progress");
            return false;
        }

        info!("Shutdown requested");
        self.drain();

        let release = {
            let mut slot = self.release.lock().expect("release slot poisoned");
            slot.take()
        };
        if let Some(release) = release {
            release();
        }
        info!("Shutdown complete");
        true
    }

    /// Bounded wait for the active batch; on expiry the batch is forced
    /// inactive so release can proceed.
    fn drain(&self) {
        if !self.state.is_active() {
            return;
        }

        let batch_id = self.state.batch_id();
        info!(batch_id = %batch_id, "Waiting for active batch to drain");

        let deadline = Instant::now() + self.config.drain_timeout;
        while self.state.is_active() && Instant::now() < deadline {
            std::thread::sleep(self.config.drain_poll_interval);
        }

        if self.state.is_active() {
            warn!(
                batch_id = %batch_id,
                timeout_secs = self.config.drain_timeout.as_secs(),
                "Batch did not drain in time, forcing termination"
            );
            self.state.mark_complete();
        } else {
            info!(batch_id = %batch_id, "Batch drained");
        }
    }
}
