//! Gate that silences sandbox timers once a render is being torn down.
//!
//! The sandbox wraps every callback handed to `setTimeout`, `setInterval` and
//! `requestAnimationFrame` in a trampoline that asks [`TimerGate::admit`]
//! before running it. The real scheduler still runs and still returns real
//! timer ids; only the payload is skipped once the gate is closed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::logging::Logger;
use crate::teardown::Closeable;

struct GateState {
    open: AtomicBool,
    warned: AtomicBool,
}

#[derive(Clone)]
pub struct TimerGate {
    state: Arc<GateState>,
    logger: Arc<dyn Logger>,
}

impl TimerGate {
    /// A new gate, initially open.
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self {
            state: Arc::new(GateState {
                open: AtomicBool::new(true),
                warned: AtomicBool::new(false),
            }),
            logger,
        }
    }

    pub fn open(&self) {
        self.state.open.store(true, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.state.open.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    /// Called by the trampoline when a timer fires; `false` means skip the callback.
    ///
    /// Only the first suppressed callback is reported, so a closed interval
    /// cannot flood the log.
    pub fn admit(&self) -> bool {
        if self.is_open() {
            return true;
        }
        if !self.state.warned.swap(true, Ordering::SeqCst) {
            self.logger.warn(
                "Dangling timer detected: a timer fired after the render environment was closed",
                None,
            );
        }
        false
    }
}

impl Closeable for TimerGate {
    fn close(&mut self) -> anyhow::Result<()> {
        TimerGate::close(self);
        Ok(())
    }
}
