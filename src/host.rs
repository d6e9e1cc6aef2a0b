//! Host-side application context.
//!
//! The host owns its main loop and calls [`HostContext::tick`] once per frame;
//! the context never assumes it runs the loop itself. Work submitted through
//! the forwarder can call back into the host, so `tick` may be re-entered from
//! inside itself. The guard detects that and skips the nested call.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::backend::CodeExecutor;
use crate::error::{BridgeError, Result};
use crate::forwarder::Forwarder;
use crate::transport::ForwarderState;

/// Minimum spacing between re-entry warnings.
const REENTRY_WARN_INTERVAL: Duration = Duration::from_secs(1);

/// Detects nested invocations of a tick handler.
#[derive(Debug)]
pub struct TickGuard {
    in_tick: AtomicBool,
    last_warning: Mutex<Option<Instant>>,
    warn_interval: Duration,
}

impl TickGuard {
    pub const fn new(warn_interval: Duration) -> Self {
        Self {
            in_tick: AtomicBool::new(false),
            last_warning: Mutex::new(None),
            warn_interval,
        }
    }

    /// Mark a tick as in progress.
    ///
    /// Returns `None` if one already is; the caller must skip its work.
    pub fn enter(&self) -> Option<TickToken<'_>> {
        if self
            .in_tick
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.warn_reentry();
            return None;
        }
        Some(TickToken { guard: self })
    }

    pub fn in_tick(&self) -> bool {
        self.in_tick.load(Ordering::Acquire)
    }

    fn warn_reentry(&self) {
        let Ok(mut last) = self.last_warning.lock() else {
            return;
        };
        let now = Instant::now();
        if last.map_or(true, |at| now.duration_since(at) >= self.warn_interval) {
            *last = Some(now);
            warn!("Tick re-entered while already running; skipping nested tick");
        }
    }
}

impl Default for TickGuard {
    fn default() -> Self {
        Self::new(REENTRY_WARN_INTERVAL)
    }
}

/// Proof that a tick is in progress; clears the flag on drop.
#[derive(Debug)]
pub struct TickToken<'a> {
    guard: &'a TickGuard,
}

impl Drop for TickToken<'_> {
    fn drop(&mut self) {
        self.guard.in_tick.store(false, Ordering::Release);
    }
}

/// Owns the forwarder for the lifetime of the host application.
///
/// Create it once, `start` it, call `tick` every frame, `stop` it on
/// shutdown. Start and stop are idempotent. A `stop` issued from inside a
/// tick is applied when that tick finishes.
pub struct HostContext<E> {
    host: String,
    port: u16,
    forwarder: RefCell<Forwarder<E>>,
    guard: TickGuard,
    stop_requested: Cell<bool>,
    /// Forwarder status as of the last start, stop or tick; readable mid-tick.
    running: Cell<bool>,
    connected: Cell<bool>,
}

impl<E: CodeExecutor> HostContext<E> {
    pub fn new(host: impl Into<String>, port: u16, executor: E) -> Self {
        Self {
            host: host.into(),
            port,
            forwarder: RefCell::new(Forwarder::new(executor)),
            guard: TickGuard::default(),
            stop_requested: Cell::new(false),
            running: Cell::new(false),
            connected: Cell::new(false),
        }
    }

    /// Start listening. A bind failure leaves the host untouched.
    pub fn start(&self) -> Result<()> {
        let mut forwarder = self
            .forwarder
            .try_borrow_mut()
            .map_err(|_| BridgeError::TickInProgress)?;
        self.stop_requested.set(false);
        let started = forwarder.start(&self.host, self.port);
        self.record(&forwarder);
        started
    }

    /// Stop listening and drop the client connection.
    pub fn stop(&self) {
        match self.forwarder.try_borrow_mut() {
            Ok(mut forwarder) => {
                forwarder.stop();
                self.record(&forwarder);
            }
            Err(_) => {
                info!("Stop requested during tick; deferring");
                self.stop_requested.set(true);
            }
        }
    }

    /// Run one batch of ready work. Returns `false` if the call was a nested
    /// invocation and was skipped.
    pub fn tick(&self, delta_time: f32) -> bool {
        let Some(_token) = self.guard.enter() else {
            return false;
        };
        let Ok(mut forwarder) = self.forwarder.try_borrow_mut() else {
            return false;
        };

        forwarder.tick(delta_time);

        if self.stop_requested.replace(false) {
            forwarder.stop();
        }
        self.record(&forwarder);
        true
    }

    /// Whether the forwarder is listening. During a tick this reports the
    /// status from when the tick began.
    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Whether a client is attached. During a tick this reports the status
    /// from when the tick began.
    pub fn is_connected(&self) -> bool {
        self.connected.get()
    }

    /// Forwarder state; `Executing` while a tick is running work.
    pub fn state(&self) -> ForwarderState {
        self.with_forwarder(Forwarder::state)
            .unwrap_or(ForwarderState::Executing)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.with_forwarder(Forwarder::local_addr).flatten()
    }

    /// Inspect the forwarder. `None` while a tick holds it.
    pub fn with_forwarder<R>(&self, f: impl FnOnce(&Forwarder<E>) -> R) -> Option<R> {
        self.forwarder.try_borrow().ok().map(|forwarder| f(&forwarder))
    }

    fn record(&self, forwarder: &Forwarder<E>) {
        self.running.set(forwarder.is_running());
        self.connected.set(forwarder.is_connected());
    }
}
