use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use log::{debug, warn};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use tokio::sync::mpsc;

use crate::config::EdgeDetect;
use crate::dispatch::{InterruptDispatcher, Sink};
use crate::error::GpioError;
use crate::gpio::{EdgeEvent, Pin, SysfsGateway, Value};

/// One armed readiness registration on a pin's value descriptor.
///
/// Lives in the pin's slot from arm until cancel. Dispatchers keep their own
/// reference, so descriptors are released only after the last user is gone.
pub(crate) struct Watch<G: SysfsGateway> {
    pub(crate) mode: EdgeDetect,
    pub(crate) file: Arc<G::ValueFile>,
    pub(crate) registration: G::Registration,
    primed: Mutex<bool>,
    // set once a dispatcher loop has been handed this watch
    dispatched: AtomicBool,
    // held across every delivery; cleared by whoever detaches the watch
    active: ReentrantMutex<Cell<bool>>,
}

impl<G: SysfsGateway> Watch<G> {
    fn new(
        mode: EdgeDetect,
        file: Arc<G::ValueFile>,
        registration: G::Registration,
        dispatched: bool,
    ) -> Self {
        Self {
            mode,
            file,
            registration,
            primed: Mutex::new(false),
            dispatched: AtomicBool::new(dispatched),
            active: ReentrantMutex::new(Cell::new(true)),
        }
    }

    /// Swallows the readiness the kernel reports right after arming. It
    /// carries the current level, not an edge.
    pub(crate) fn prime(&self, gateway: &G) -> Result<(), GpioError> {
        let mut primed = self.primed.lock();
        if !*primed {
            wait_for_readiness(gateway, &self.registration)?;
            *primed = true;
        }
        Ok(())
    }

    pub(crate) fn gate(&self) -> ReentrantMutexGuard<'_, Cell<bool>> {
        self.active.lock()
    }

    /// Blocks until an in-flight delivery has finished.
    fn deactivate(&self) {
        self.active.lock().set(false);
    }
}

/// Blocks until the registration reports readiness. Signal interruptions
/// are retried; cancellation and real failures are returned.
pub(crate) fn wait_for_readiness<G: SysfsGateway>(
    gateway: &G,
    registration: &G::Registration,
) -> Result<(), GpioError> {
    loop {
        match gateway.wait(registration, None) {
            Err(GpioError::Interrupted) => continue,
            other => return other,
        }
    }
}

impl<G: SysfsGateway> Pin<G> {
    /// Blocks until the next real edge of kind `mode` and returns the level
    /// read right after it.
    ///
    /// Arms on first use; later calls with the same mode reuse the
    /// registration. There is no timeout: race [`Pin::cancel`] against a
    /// timer instead, which makes this return [`GpioError::Cancelled`].
    pub fn wait_for_edge(&self, mode: EdgeDetect) -> Result<Value, GpioError> {
        let watch = self.request_edge(mode)?;
        watch.prime(&self.inner.gateway)?;
        wait_for_readiness(&*self.inner.gateway, &watch.registration)?;
        self.read_from(&watch.file)
    }

    /// Calls `callback` from a dedicated thread once per detected edge until
    /// the watch is cancelled. Failures inside the loop stop it quietly.
    ///
    /// A pin runs at most one loop. Starting another, in any mode, retires
    /// the running one the way a mode switch does: its registration is
    /// closed, its thread finishes and edges go to the new loop.
    pub fn start_callbacks<F>(
        &self,
        mode: EdgeDetect,
        callback: F,
    ) -> Result<JoinHandle<()>, GpioError>
    where
        F: FnMut(Value) + Send + 'static,
    {
        let watch = self.acquire(mode, true)?;
        InterruptDispatcher::new(self.clone(), watch, Sink::Callback(Box::new(callback))).spawn()
    }

    /// Like [`Pin::start_callbacks`] but pushes timestamped events into
    /// `sink`.
    ///
    /// The loop never blocks on the receiver. An edge that arrives while the
    /// buffer is full is dropped with a warning, so size the channel for the
    /// longest burst the consumer may fall behind on.
    pub fn start_event_channel(
        &self,
        mode: EdgeDetect,
        sink: mpsc::Sender<EdgeEvent>,
    ) -> Result<JoinHandle<()>, GpioError> {
        let watch = self.acquire(mode, true)?;
        InterruptDispatcher::new(self.clone(), watch, Sink::Channel(sink)).spawn()
    }

    /// True from arming until cancel.
    pub fn is_watching(&self) -> bool {
        self.inner.slot.lock().is_some()
    }

    /// Stops edge detection: detaches the registration, closes it so blocked
    /// waiters return, and writes `none` to the edge attribute. Returns only
    /// after any delivery in progress has completed. Safe to repeat.
    pub fn cancel(&self) -> Result<(), GpioError> {
        let mut first_error = None;
        let detached = {
            let _arming = self.inner.arming.lock();
            let detached = self.inner.slot.lock().take();
            if let Some(watch) = &detached
                && let Err(e) = self.inner.gateway.close(&watch.registration)
            {
                first_error = Some(e);
            }
            if let Err(e) = self.set_edge(EdgeDetect::None) {
                first_error.get_or_insert(e);
            }
            detached
        };

        if let Some(watch) = detached {
            watch.deactivate();
            debug!("gpio{}: {} edge detection cancelled", self.inner.line, watch.mode);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Returns the live watch for `mode`, arming one if needed. A watch for a
    /// different mode is closed before the new one is armed.
    pub(crate) fn request_edge(&self, mode: EdgeDetect) -> Result<Arc<Watch<G>>, GpioError> {
        self.acquire(mode, false)
    }

    /// With `dispatch` set the returned watch is claimed for a new loop; a
    /// watch already driven by one is retired and a fresh one armed.
    fn acquire(&self, mode: EdgeDetect, dispatch: bool) -> Result<Arc<Watch<G>>, GpioError> {
        if mode == EdgeDetect::None {
            return Err(GpioError::InvalidValue(
                "edge mode none cannot be watched".into(),
            ));
        }

        let mut retired = None;
        let result = {
            let _arming = self.inner.arming.lock();
            self.rearm(mode, dispatch, &mut retired)
        };
        // outside the arming lock: the retired loop may be inside a callback
        // that touches this pin
        if let Some(previous) = retired {
            previous.deactivate();
        }
        result
    }

    fn rearm(
        &self,
        mode: EdgeDetect,
        dispatch: bool,
        retired: &mut Option<Arc<Watch<G>>>,
    ) -> Result<Arc<Watch<G>>, GpioError> {
        let previous = {
            let mut slot = self.inner.slot.lock();
            if let Some(current) = slot.as_ref()
                && current.mode == mode
                && !(dispatch && current.dispatched.load(Ordering::Acquire))
            {
                if dispatch {
                    current.dispatched.store(true, Ordering::Release);
                }
                return Ok(current.clone());
            }
            slot.take()
        };
        if let Some(previous) = previous {
            if let Err(e) = self.inner.gateway.close(&previous.registration) {
                warn!(
                    "gpio{}: closing {} registration: {e}",
                    self.inner.line, previous.mode
                );
            }
            *retired = Some(previous);
        }

        self.set_edge(mode)?;
        let armed = self.value_file().and_then(|file| {
            let registration = self.inner.gateway.arm(&file)?;
            Ok((file, registration))
        });
        let (file, registration) = match armed {
            Ok(armed) => armed,
            Err(e) => {
                if let Err(reset) = self.set_edge(EdgeDetect::None) {
                    warn!("gpio{}: resetting edge mode: {reset}", self.inner.line);
                }
                return Err(e);
            }
        };
        let watch = Arc::new(Watch::new(mode, file, registration, dispatch));
        *self.inner.slot.lock() = Some(watch.clone());
        debug!("gpio{}: armed {mode} edge detection", self.inner.line);
        Ok(watch)
    }

    /// Tears down `watch` if it is still the live one. Used by a dispatcher
    /// leaving on its own, so a racing `cancel` and the loop close it once.
    pub(crate) fn detach(&self, watch: &Arc<Watch<G>>) {
        let detached = {
            let _arming = self.inner.arming.lock();
            let mut slot = self.inner.slot.lock();
            if !slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, watch)) {
                return;
            }
            let detached = slot.take();
            drop(slot);
            if let Err(e) = self.inner.gateway.close(&watch.registration) {
                debug!("gpio{}: closing registration: {e}", self.inner.line);
            }
            if let Err(e) = self.set_edge(EdgeDetect::None) {
                debug!("gpio{}: resetting edge mode: {e}", self.inner.line);
            }
            detached
        };
        if let Some(watch) = detached {
            watch.deactivate();
        }
    }
}
