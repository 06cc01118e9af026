//! The event loop: lifecycle, dispatch cycle, timers, delayed callbacks.
//!
//! One dispatch cycle runs the delayed-callback FIFO, fires due timers,
//! polls with a deadline bounded by the caller and the next timer, routes
//! readiness to the owning event sources, and gives every source a
//! housekeeping turn. All callbacks execute on the thread that called `run`;
//! the only operation safe from other threads is the delayed-callback
//! enqueue, which wakes the poller.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, resource_error};
use crate::params::ParamMap;
use crate::poller::{PollEvent, Poller, SourceId};
use crate::source::{EventSource, Registry, SourceState};
use crate::timer::{TimerId, TimerPolicy, TimerQueue};

/// Callback executed exactly once at the start of the next dispatch cycle.
pub type DelayedCallback = Box<dyn FnOnce(&mut EventLoop) + Send>;

/// Lifecycle state of the loop. Transitions are
/// `Fresh -> Started -> Stopping -> Stopped`; a stopped loop can be started
/// again, but `free` is only legal in `Fresh` or `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopState {
    #[default]
    Fresh,
    Started,
    Stopping,
    Stopped,
}

/// Cross-thread handle for enqueueing delayed callbacks.
///
/// This is the only entry point that may be used from a thread other than the
/// one driving the loop. Every enqueue wakes the poller (via the poller's
/// waker: eventfd on Linux, a pipe elsewhere), so a blocked `run` returns
/// promptly and the callback executes at the start of the following cycle.
#[derive(Clone)]
pub struct DelayedSender {
    tx: Sender<DelayedCallback>,
    waker: Arc<mio::Waker>,
}

impl DelayedSender {
    pub fn send(&self, callback: impl FnOnce(&mut EventLoop) + Send + 'static) {
        // The receiver lives as long as the loop; a send after the loop is
        // gone is silently dropped.
        let _ = self.tx.send(Box::new(callback));
        if let Err(e) = self.waker.wake() {
            tracing::warn!(error = %e, "failed to wake event loop");
        }
    }
}

pub struct EventLoop {
    state: LoopState,
    freed: bool,
    /// Reentrancy guard: set for the duration of a dispatch cycle.
    running: bool,
    params: ParamMap,
    clock: Arc<dyn Clock>,
    timers: TimerQueue,
    delayed_tx: Sender<DelayedCallback>,
    delayed_rx: Receiver<DelayedCallback>,
    poller: Poller,
    registry: Registry,
    poll_events: Vec<PollEvent>,
}

impl EventLoop {
    /// A loop on the system clock.
    pub fn new() -> Result<Self, Error> {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// A loop with its own clock domain (e.g. a simulated clock in tests).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Result<Self, Error> {
        let poller = Poller::new().map_err(|e| {
            tracing::warn!(error = %e, "failed to initialize poller");
            resource_error(&e)
        })?;
        let (delayed_tx, delayed_rx) = unbounded();
        Ok(EventLoop {
            state: LoopState::Fresh,
            freed: false,
            running: false,
            params: ParamMap::new(),
            clock,
            timers: TimerQueue::new(),
            delayed_tx,
            delayed_rx,
            poller,
            registry: Registry::new(),
            poll_events: Vec::with_capacity(256),
        })
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn params(&self) -> &ParamMap {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParamMap {
        &mut self.params
    }

    // Time domain.

    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }

    pub fn now_monotonic(&self) -> Duration {
        self.clock.now_monotonic()
    }

    pub fn utc_offset(&self) -> i64 {
        self.clock.utc_offset()
    }

    pub(crate) fn poller(&mut self) -> &mut Poller {
        &mut self.poller
    }

    // Lifecycle.

    /// Start the loop and every registered event source, in registration
    /// order. The first source failure is surfaced; sources started before it
    /// remain started (the caller is expected to `stop` and then `free`).
    pub fn start(&mut self) -> Result<(), Error> {
        self.check_alive()?;
        if !matches!(self.state, LoopState::Fresh | LoopState::Stopped) {
            return Err(Error::InvalidState);
        }
        self.state = LoopState::Started;
        tracing::debug!("event loop started");
        for idx in self.registry.occupied() {
            self.start_source(idx)?;
        }
        Ok(())
    }

    /// Request every source to stop and enter `Stopping`. Returns
    /// immediately; keep calling `run` until the state reaches `Stopped`.
    pub fn stop(&mut self) -> Result<(), Error> {
        self.check_alive()?;
        if self.state != LoopState::Started {
            return Err(Error::InvalidState);
        }
        self.state = LoopState::Stopping;
        tracing::debug!("event loop stopping");
        for idx in self.registry.occupied() {
            if let Some(mut source) = self.registry.take(idx) {
                source.stop(self);
                self.registry.restore(idx, source);
            }
        }
        Ok(())
    }

    /// Execute one dispatch cycle, blocking in the poller for at most
    /// `timeout`. Returns the wall-clock instant the next timer is due, or
    /// `None` when no timer is pending. Fails with `Internal` when invoked
    /// from inside a callback of the same loop.
    pub fn run(&mut self, timeout: Duration) -> Result<Option<SystemTime>, Error> {
        self.check_alive()?;
        if self.running {
            return Err(Error::Internal);
        }
        if !matches!(self.state, LoopState::Started | LoopState::Stopping) {
            return Err(Error::InvalidState);
        }
        self.running = true;
        let result = self.dispatch_cycle(timeout);
        self.running = false;
        result
    }

    /// Release every owned resource. Only legal in `Fresh` or `Stopped`;
    /// registered sources are dropped in reverse registration order and no
    /// operation is legal afterwards.
    pub fn free(&mut self) -> Result<(), Error> {
        self.check_alive()?;
        if !matches!(self.state, LoopState::Fresh | LoopState::Stopped) {
            return Err(Error::InvalidState);
        }
        self.registry.drain_reverse();
        self.timers.clear();
        while self.delayed_rx.try_recv().is_ok() {}
        self.freed = true;
        Ok(())
    }

    // Event sources.

    /// Attach a source to the loop. When the loop is already started the
    /// source is started immediately; otherwise it starts together with the
    /// loop.
    pub fn register_event_source(&mut self, source: Box<dyn EventSource>) -> Result<(), Error> {
        self.check_alive()?;
        let name = source.name().to_string();
        let idx = self.registry.insert(source)?;
        tracing::debug!(name = %name, "event source registered");
        if self.state == LoopState::Started
            && let Err(e) = self.start_source(idx)
        {
            self.registry.vacate(idx);
            return Err(e);
        }
        Ok(())
    }

    /// Request the named source to stop and remove it once it reports
    /// stopped. Unknown names are a no-op. Removal may take several cycles.
    pub fn deregister_event_source(&mut self, name: &str) -> Result<(), Error> {
        self.check_alive()?;
        let Some(idx) = self.registry.find(name) else {
            return Ok(());
        };
        if let Some(mut source) = self.registry.take(idx) {
            source.stop(self);
            let done = matches!(
                source.state(),
                SourceState::Stopped | SourceState::Fresh
            );
            self.registry.restore(idx, source);
            if done {
                self.registry.vacate(idx);
            } else {
                self.registry.mark_pending_remove(idx);
            }
        }
        Ok(())
    }

    /// First registered source of that name.
    pub fn find_event_source(&self, name: &str) -> Option<&dyn EventSource> {
        self.registry.find(name).and_then(|idx| self.registry.get(idx))
    }

    /// Borrow the named source, downcast to its concrete type, together with
    /// the loop. The source is taken out of its registry slot for the
    /// duration of the closure, so connection operations invoked through it
    /// see the loop without aliasing.
    pub fn with_source<T: EventSource, R>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut T, &mut EventLoop) -> R,
    ) -> Result<R, Error> {
        self.check_alive()?;
        let idx = self.registry.find(name).ok_or(Error::NotFound)?;
        let mut boxed = self.registry.take(idx).ok_or(Error::NotFound)?;
        let result = match boxed.as_any_mut().downcast_mut::<T>() {
            Some(t) => Ok(f(t, self)),
            None => Err(Error::NotFound),
        };
        self.registry.restore(idx, boxed);
        result
    }

    // Timers.

    /// Register a cyclic callback. With a `base_time` anchor the phase is
    /// aligned: the first fire is the smallest `base_time + k * interval` at
    /// or after now. Without one, the first fire is one interval out.
    pub fn add_cyclic_callback(
        &mut self,
        callback: impl FnMut(&mut EventLoop) + 'static,
        interval: Duration,
        base_time: Option<Duration>,
        policy: TimerPolicy,
    ) -> Result<TimerId, Error> {
        self.check_alive()?;
        let now = self.clock.now_monotonic();
        self.timers
            .add_cyclic(Box::new(callback), interval, base_time, policy, now)
    }

    /// Register a one-shot callback for the monotonic instant `when`.
    pub fn add_timed_callback(
        &mut self,
        callback: impl FnMut(&mut EventLoop) + 'static,
        when: Duration,
    ) -> Result<TimerId, Error> {
        self.check_alive()?;
        Ok(self.timers.add_timed(Box::new(callback), when))
    }

    /// Re-parameterize a cyclic callback as if it were newly added.
    pub fn modify_cyclic_callback(
        &mut self,
        id: TimerId,
        interval: Duration,
        base_time: Option<Duration>,
        policy: TimerPolicy,
    ) -> Result<(), Error> {
        self.check_alive()?;
        let now = self.clock.now_monotonic();
        self.timers.modify(id, interval, base_time, policy, now)
    }

    /// Remove a timer. Unknown ids are a no-op.
    pub fn remove_cyclic_callback(&mut self, id: TimerId) {
        self.timers.remove(id);
    }

    /// Monotonic instant of the next pending timer.
    pub fn next_cyclic_time(&self) -> Option<Duration> {
        self.timers.next_time()
    }

    // Delayed callbacks.

    /// Enqueue a callback for the start of the next dispatch cycle.
    pub fn add_delayed_callback(&mut self, callback: impl FnOnce(&mut EventLoop) + Send + 'static) {
        let _ = self.delayed_tx.send(Box::new(callback));
    }

    /// A cloneable, `Send` handle for enqueueing delayed callbacks from other
    /// threads.
    pub fn delayed_sender(&self) -> DelayedSender {
        DelayedSender {
            tx: self.delayed_tx.clone(),
            waker: self.poller.waker(),
        }
    }

    // Dispatch internals.

    fn dispatch_cycle(&mut self, timeout: Duration) -> Result<Option<SystemTime>, Error> {
        // 1. Delayed callbacks, FIFO. The queue head is detached up front so
        //    callbacks enqueued from here on run in the next cycle, which
        //    bounds the work per cycle.
        let batch: Vec<DelayedCallback> = self.delayed_rx.try_iter().collect();
        for callback in batch {
            dispatch_protected("delayed callback", AssertUnwindSafe(|| callback(self)));
        }

        // 2. Due timers, stable by insertion among equal fire times. The
        //    cycle's `now` is fixed so OnceInCurrent catch-up terminates.
        let now = self.clock.now_monotonic();
        while let Some(mut entry) = self.timers.pop_due(now) {
            dispatch_protected("timer callback", AssertUnwindSafe(|| (entry.callback)(self)));
            let fire_time = self.clock.now_monotonic();
            self.timers.reinsert_after_fire(entry, fire_time);
        }

        // 3. Poll deadline: the caller's bound, capped by the next timer, and
        //    zero while any source is still stopping.
        let mut deadline = timeout;
        if let Some(next) = self.timers.next_time() {
            deadline = deadline.min(next.saturating_sub(self.clock.now_monotonic()));
        }
        if self.registry.any_stopping() {
            deadline = Duration::ZERO;
        }

        // 4. Poll and route readiness to the owning sources.
        let mut events = std::mem::take(&mut self.poll_events);
        events.clear();
        if let Err(e) = self.poller.wait(Some(deadline), &mut events) {
            tracing::warn!(error = %e, "poll failed");
            self.poll_events = events;
            return Err(Error::Internal);
        }
        for event in events.drain(..) {
            let Some(mut source) = self.registry.take(event.source.0) else {
                continue;
            };
            dispatch_protected(
                "poll event",
                AssertUnwindSafe(|| source.on_poll_event(self, event.key, event.ready)),
            );
            self.registry.restore(event.source.0, source);
        }
        self.poll_events = events;

        // 5. Per-source housekeeping (close finalization, stop convergence).
        for idx in self.registry.occupied() {
            let Some(mut source) = self.registry.take(idx) else {
                continue;
            };
            dispatch_protected(
                "cycle hook",
                AssertUnwindSafe(|| source.on_cycle(self)),
            );
            self.registry.restore(idx, source);
        }

        // 6. Complete pending deregistrations.
        for idx in self.registry.removable() {
            self.registry.vacate(idx);
        }

        // 7. Stop convergence.
        if self.state == LoopState::Stopping && self.registry.all_stopped() {
            self.state = LoopState::Stopped;
            tracing::debug!("event loop stopped");
        }

        Ok(self.next_wall_time())
    }

    fn next_wall_time(&self) -> Option<SystemTime> {
        let next = self.timers.next_time()?;
        let now = self.clock.now_monotonic();
        Some(self.clock.now() + next.saturating_sub(now))
    }

    fn start_source(&mut self, idx: usize) -> Result<(), Error> {
        let Some(mut source) = self.registry.take(idx) else {
            return Ok(());
        };
        let name = source.name().to_string();
        let result = source.start(self, SourceId(idx));
        self.registry.restore(idx, source);
        if let Err(e) = &result {
            tracing::warn!(name = %name, error = %e, "event source failed to start");
        }
        result
    }

    fn check_alive(&self) -> Result<(), Error> {
        if self.freed {
            return Err(Error::InvalidState);
        }
        Ok(())
    }
}

/// Invoke an application callback, catching panics at the dispatcher
/// boundary. A panicking callback is logged and the cycle continues.
pub(crate) fn dispatch_protected<F: FnOnce()>(what: &str, f: AssertUnwindSafe<F>) {
    if catch_unwind(f).is_err() {
        tracing::error!(callback = what, "callback panicked, continuing dispatch");
    }
}
