//! Monitoring lifecycle
//!
//! ```text
//!  on_device_change ──► Monitor::subscribe
//!                          │ first subscriber:
//!                          │   populate directory
//!                          │   backend.register(sink)
//!                          │   catch-up reconcile
//!                          ▼
//!  native thread ──► sink ──► CallbackGate::enter ──► EventNormalizer
//!                                                       │
//!                                                       ▼
//!                                           Directory / CallbackRegistry
//! ```
//!
//! A [`Subscription`] owns the session. Dropping the current one stops
//! monitoring: unregister from the native source, wait until no native
//! callback is still running against the shared state, then clear the
//! handler and the directory. Dropping a superseded subscription does nothing.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::audio::backend::NativeSink;
use crate::audio::context::AudioContext;
use crate::audio::error::{AudioControlError, Result};
use crate::audio::normalizer::{self, EventNormalizer};
use crate::audio::types::DeviceEventCallback;

// === Callback gate ===

thread_local! {
    /// Gate entries held by the current thread
    static CALLBACK_DEPTH: Cell<usize> = Cell::new(0);
}

#[derive(Debug, Default)]
struct GateState {
    open: bool,
    in_flight: usize,
}

/// Counts native callbacks currently executing against the shared state
#[derive(Debug, Default)]
pub struct CallbackGate {
    state: Mutex<GateState>,
    idle: Condvar,
}

pub struct GateGuard<'a> {
    gate: &'a CallbackGate,
}

impl CallbackGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        self.state.lock().open = true;
    }

    /// Reject new entries; running callbacks are unaffected
    pub fn close(&self) {
        self.state.lock().open = false;
    }

    pub fn enter(&self) -> Option<GateGuard<'_>> {
        let mut state = self.state.lock();
        if !state.open {
            return None;
        }
        state.in_flight += 1;
        CALLBACK_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Some(GateGuard { gate: self })
    }

    /// Block until every callback other than the caller's own has left
    pub fn wait_idle(&self) {
        let own = CALLBACK_DEPTH.with(Cell::get);
        let mut state = self.state.lock();
        while state.in_flight > own {
            self.idle.wait(&mut state);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        CALLBACK_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
        let mut state = self.gate.state.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.gate.idle.notify_all();
        } else {
            self.gate.idle.notify_one();
        }
    }
}

fn in_callback() -> bool {
    CALLBACK_DEPTH.with(Cell::get) > 0
}

// === Monitor ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopping,
}

#[derive(Debug)]
struct Lifecycle {
    phase: Phase,
    generation: u64,
}

pub struct Monitor {
    ctx: Arc<AudioContext>,
    normalizer: Arc<dyn EventNormalizer>,
    gate: Arc<CallbackGate>,
    lifecycle: Mutex<Lifecycle>,
    settled: Condvar,
}

impl Monitor {
    pub fn new(ctx: Arc<AudioContext>) -> Self {
        let normalizer = normalizer::for_model(ctx.backend.signal_model());
        Self {
            ctx,
            normalizer,
            gate: Arc::new(CallbackGate::new()),
            lifecycle: Mutex::new(Lifecycle {
                phase: Phase::Idle,
                generation: 0,
            }),
            settled: Condvar::new(),
        }
    }

    pub fn context(&self) -> &AudioContext {
        &self.ctx
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.lock().phase == Phase::Running
    }

    /// Install `handler` and start monitoring if it is not running yet
    pub fn subscribe(self: &Arc<Self>, handler: DeviceEventCallback) -> Result<Subscription> {
        let mut life = self.lifecycle.lock();
        while life.phase == Phase::Stopping {
            if in_callback() {
                return Err(AudioControlError::NotSupported(
                    "cannot subscribe from a device event callback while monitoring stops".to_string(),
                ));
            }
            self.settled.wait(&mut life);
        }

        self.ctx.registry.set_handler(handler);
        life.generation += 1;
        let generation = life.generation;

        let started = life.phase == Phase::Idle;
        if started {
            if let Err(e) = self.start() {
                self.ctx.registry.clear_handler();
                return Err(e);
            }
            life.phase = Phase::Running;
        }
        drop(life);

        if started && self.ctx.config.catch_up_on_start {
            // Not under the lifecycle lock: the handler may run from here
            if let Some(_entry) = self.gate.enter() {
                self.normalizer.catch_up(&self.ctx);
            }
        }

        debug!("[{}] Subscription #{} active", self.ctx.tag(), generation);
        Ok(Subscription {
            monitor: Arc::clone(self),
            generation,
            active: true,
        })
    }

    fn start(&self) -> Result<()> {
        let ctx = &self.ctx;
        self.gate.open();

        if let Err(e) = ctx.reconciler().populate() {
            self.gate.close();
            return Err(e);
        }

        let gate = Arc::clone(&self.gate);
        let shared = Arc::clone(&self.ctx);
        let normalizer = Arc::clone(&self.normalizer);
        let sink: NativeSink = Arc::new(move |event| {
            let Some(_entry) = gate.enter() else {
                return;
            };
            let tag = shared.tag();
            if catch_unwind(AssertUnwindSafe(|| normalizer.normalize(&shared, event))).is_err() {
                error!("[{}] Native event processing panicked", tag);
            }
        });

        if let Err(e) = ctx.backend.register(sink) {
            self.gate.close();
            self.unwatch_all();
            ctx.directory.clear();
            return Err(e);
        }

        info!(
            "[{}] Monitoring started ({} devices)",
            ctx.tag(),
            ctx.directory.len()
        );
        Ok(())
    }

    /// Stop the session if `generation` is still the current one
    fn stop(&self, generation: u64) -> Result<()> {
        {
            let mut life = self.lifecycle.lock();
            if life.generation != generation || life.phase != Phase::Running {
                return Ok(());
            }
            life.phase = Phase::Stopping;
        }

        let ctx = &self.ctx;
        self.gate.close();
        let result = ctx.backend.unregister();
        if let Err(e) = &result {
            warn!("[{}] Native unregister failed: {}", ctx.tag(), e);
        }
        self.unwatch_all();

        self.gate.wait_idle();

        ctx.registry.clear_handler();
        ctx.registry.discard_pending();
        ctx.directory.clear();

        let mut life = self.lifecycle.lock();
        life.phase = Phase::Idle;
        self.settled.notify_all();
        drop(life);

        info!("[{}] Monitoring stopped", ctx.tag());
        result
    }

    fn unwatch_all(&self) {
        if self.ctx.config.track_liveness {
            for handle in self.ctx.directory.handles() {
                self.ctx.backend.unwatch_liveness(handle);
            }
        }
    }
}

// === Subscription ===

/// Handle for a device-change subscription
///
/// Monitoring stays alive for as long as the current subscription does.
#[must_use = "dropping the subscription stops monitoring"]
pub struct Subscription {
    monitor: Arc<Monitor>,
    generation: u64,
    active: bool,
}

impl Subscription {
    /// Whether this is still the subscription receiving events
    pub fn is_current(&self) -> bool {
        let life = self.monitor.lifecycle.lock();
        self.active && life.generation == self.generation && life.phase == Phase::Running
    }

    /// Stop monitoring, surfacing a failed native unregister
    pub fn stop(mut self) -> Result<()> {
        self.active = false;
        self.monitor.stop(self.generation)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.active {
            self.active = false;
            let _ = self.monitor.stop(self.generation);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("generation", &self.generation)
            .field("active", &self.active)
            .finish()
    }
}
