//! The Hub: event-loop kernel (§4.E). Owns the timer heap, the readiness
//! registry, the backend adapter, and the fiber table; drives the run
//! loop; and is the sole place that ever "switches" a fiber.
//!
//! Realizing a stackful-fiber runtime in a systems language is the
//! central re-architecture this crate makes (§9, option (a)): each fiber
//! is a real `std::thread`, and "exactly one fiber runs at a time" is
//! enforced by a `Mutex<Running>` + `Condvar` baton passed back and forth
//! between the hub thread and whichever fiber thread currently holds it.
//! `switch_to`/`throw_into` hand the baton to a fiber with a resume
//! payload; `suspend_self` (called from a fiber thread) hands it back and
//! blocks until the next turn.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::backend::{Backend, PollBackend};
use crate::config;
use crate::error::{Error, FiberId, Result};
use crate::registry::{Direction, Registry};
use crate::timer::{TimerCallback, TimerHandle, TimerHeap};

/// What a suspended fiber is resumed with: a plain value, or an exception
/// to be raised at its suspension point (§9, "throw-into-fiber").
pub enum Resume {
    Value(Box<dyn std::any::Any + Send>),
    Exception(Error),
}

impl Resume {
    pub fn unit() -> Self {
        Resume::Value(Box::new(()))
    }

    pub fn into_result(self) -> Result<Box<dyn std::any::Any + Send>> {
        match self {
            Resume::Value(v) => Ok(v),
            Resume::Exception(e) => Err(e),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Running {
    Hub,
    Fiber(FiberId),
}

struct Baton {
    state: Mutex<Running>,
    cond: Condvar,
}

impl Baton {
    fn new() -> Self {
        Self {
            state: Mutex::new(Running::Hub),
            cond: Condvar::new(),
        }
    }

    fn hand_to(&self, who: Running) {
        let mut guard = self.state.lock().unwrap();
        *guard = who;
        self.cond.notify_all();
    }

    fn wait_for(&self, who: Running) {
        let mut guard = self.state.lock().unwrap();
        while *guard != who {
            guard = self.cond.wait(guard).unwrap();
        }
    }
}

struct FiberHandle {
    id: FiberId,
    dead: AtomicBool,
    resume_slot: Mutex<Option<Resume>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RunState {
    Stopped,
    Running,
    Aborting,
}

struct HubInner {
    baton: Baton,
    run_state: Mutex<RunState>,
    timers: Mutex<TimerHeap>,
    registry: Mutex<Registry>,
    backend: Box<dyn Backend>,
    fibers: Mutex<HashMap<FiberId, Arc<FiberHandle>>>,
    next_fiber_id: AtomicU64,
    csw: AtomicU64,
}

/// Cheaply-cloneable handle to a hub; all clones share the same run
/// state, timers, registry, and fiber table.
#[derive(Clone)]
pub struct Hub(Arc<HubInner>);

thread_local! {
    static CURRENT_HUB: RefCell<Option<Hub>> = RefCell::new(None);
    static CURRENT_FIBER: Cell<Option<FiberId>> = Cell::new(None);
}

fn set_current_hub(hub: Hub) {
    CURRENT_HUB.with(|c| *c.borrow_mut() = Some(hub));
}

/// Returns the hub registered on the calling OS thread: either the
/// thread that called [`Hub::run`], or one of its fiber threads.
pub fn get_current_hub() -> Result<Hub> {
    CURRENT_HUB.with(|c| c.borrow().clone().ok_or(Error::NoCurrentHub))
}

/// Registers `hub` as the current hub for the calling thread. Exposed so
/// a consumer can prepare a thread before calling into hub-relative
/// primitives from it; `Hub::run` and fiber threads do this
/// automatically.
pub fn use_hub(hub: Hub) {
    set_current_hub(hub);
}

/// `None` means the calling thread is the hub thread itself.
pub fn current_fiber() -> Option<FiberId> {
    CURRENT_FIBER.with(|c| c.get())
}

impl Hub {
    pub fn new() -> Result<Self> {
        let cfg = config::get()?;
        debug_assert_eq!(cfg.hub_backend, config::POLL_BACKEND);
        let backend = PollBackend::new()?;
        Ok(Self::with_backend(Box::new(backend)))
    }

    pub fn with_backend(backend: Box<dyn Backend>) -> Self {
        Hub(Arc::new(HubInner {
            baton: Baton::new(),
            run_state: Mutex::new(RunState::Stopped),
            timers: Mutex::new(TimerHeap::new()),
            registry: Mutex::new(Registry::new()),
            backend,
            fibers: Mutex::new(HashMap::new()),
            next_fiber_id: AtomicU64::new(1),
            csw: AtomicU64::new(0),
        }))
    }

    /// Convenience constructor for tests and examples: builds a hub with
    /// the default backend, panicking on backend construction failure
    /// rather than threading a `Result` through every test.
    pub fn new_for_test() -> Self {
        Self::new().expect("failed to build a test hub")
    }

    pub fn state(&self) -> RunState {
        *self.0.run_state.lock().unwrap()
    }

    /// Number of completed fiber switches, used by [`crate::csw`].
    pub fn csw(&self) -> u64 {
        self.0.csw.load(Ordering::Relaxed)
    }

    // -- fiber table -----------------------------------------------------

    pub fn spawn<F>(&self, f: F) -> FiberId
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let id = self.0.next_fiber_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(FiberHandle {
            id,
            dead: AtomicBool::new(false),
            resume_slot: Mutex::new(None),
            thread: Mutex::new(None),
        });
        self.0.fibers.lock().unwrap().insert(id, handle.clone());

        let hub = self.clone();
        let thread_handle = thread::Builder::new()
            .name(format!("fiber-{id}"))
            .spawn(move || Self::fiber_main(hub, id, f))
            .expect("failed to spawn fiber thread");
        *handle.thread.lock().unwrap() = Some(thread_handle);

        // Contract (§4.A): spawning does not run the fiber immediately;
        // it is registered for the next tick. This must be a global timer:
        // a fiber-local one would bind to whoever is *currently* running
        // (the caller of `spawn`, not the new child), and get cancelled
        // along with the rest of that fiber's timers if the caller exits
        // before the next tick.
        self.schedule_call_global(Duration::from_secs(0), move |hub| {
            hub.switch_to(id, Resume::unit())
        });
        id
    }

    fn fiber_main<F>(hub: Hub, id: FiberId, f: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        set_current_hub(hub.clone());
        CURRENT_FIBER.with(|c| c.set(Some(id)));
        hub.0.baton.wait_for(Running::Fiber(id));
        let first = hub.take_resume(id);

        let result = match first {
            Some(Resume::Exception(e)) => Err(e),
            _ => {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
                match outcome {
                    Ok(r) => r,
                    Err(payload) => {
                        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                            s.to_string()
                        } else if let Some(s) = payload.downcast_ref::<String>() {
                            s.clone()
                        } else {
                            "fiber panicked with a non-string payload".to_string()
                        };
                        Err(Error::FiberPanic(msg))
                    }
                }
            }
        };

        if let Err(e) = &result {
            if !matches!(e, Error::FiberExit { .. }) {
                log::warn!("fiber {id} exited with an unhandled error: {e}");
            }
        }

        if let Some(handle) = hub.0.fibers.lock().unwrap().get(&id).cloned() {
            handle.dead.store(true, Ordering::SeqCst);
        }
        hub.0.timers.lock().unwrap().cancel_all_for_fiber(id);

        // Hand control back to the hub one last time so `switch_to`'s
        // caller (the callback that resumed us for the final time)
        // observes a normal return rather than hanging forever.
        hub.0.baton.hand_to(Running::Hub);
    }

    fn take_resume(&self, fiber: FiberId) -> Option<Resume> {
        self.0
            .fibers
            .lock()
            .unwrap()
            .get(&fiber)
            .and_then(|h| h.resume_slot.lock().unwrap().take())
    }

    /// Resumes `fiber` with `resume`, blocking the calling (hub) thread
    /// until the fiber suspends again or exits. Must be called from the
    /// hub thread; calling it from a fiber thread is a logic error in
    /// this crate's own code, not a documented public contract, so it
    /// only debug-asserts.
    pub(crate) fn switch_to(&self, fiber: FiberId, resume: Resume) {
        debug_assert!(current_fiber().is_none(), "switch_to called off the hub thread");
        let handle = match self.0.fibers.lock().unwrap().get(&fiber).cloned() {
            Some(h) => h,
            None => return,
        };
        if handle.dead.load(Ordering::SeqCst) {
            return;
        }
        *handle.resume_slot.lock().unwrap() = Some(resume);
        self.0.baton.hand_to(Running::Fiber(fiber));
        self.0.baton.wait_for(Running::Hub);
        self.0.csw.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn throw_into(&self, fiber: FiberId, exc: Error) {
        self.switch_to(fiber, Resume::Exception(exc));
    }

    /// Called from a fiber thread: hands the baton back to the hub and
    /// blocks until this fiber's next turn, returning whatever it was
    /// resumed with.
    pub(crate) fn suspend_self(&self) -> Resume {
        let id = current_fiber().expect("suspend_self called from the hub fiber");
        self.0.baton.hand_to(Running::Hub);
        self.0.baton.wait_for(Running::Fiber(id));
        self.take_resume(id)
            .expect("a resumed fiber always has a resume payload")
    }

    pub fn is_dead(&self, fiber: FiberId) -> bool {
        self.0
            .fibers
            .lock()
            .unwrap()
            .get(&fiber)
            .map(|h| h.dead.load(Ordering::SeqCst))
            .unwrap_or(true)
    }

    pub fn kill(&self, fiber: FiberId) {
        self.switch_to(fiber, Resume::Exception(Error::FiberExit { id: fiber }));
    }

    // -- timers ------------------------------------------------------------

    pub fn schedule_call<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce(&Hub) + Send + 'static,
    {
        let bound = current_fiber();
        self.schedule_inner(delay, bound, Box::new(callback))
    }

    pub fn schedule_call_global<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce(&Hub) + Send + 'static,
    {
        self.schedule_inner(delay, None, Box::new(callback))
    }

    fn schedule_inner(
        &self,
        delay: Duration,
        bound: Option<FiberId>,
        callback: TimerCallback,
    ) -> TimerHandle {
        self.0
            .timers
            .lock()
            .unwrap()
            .schedule(delay, bound, callback)
    }

    pub fn cancel_timer(&self, handle: &TimerHandle) {
        handle.cancel();
    }

    // -- readiness registry / backend --------------------------------------

    pub(crate) fn add_listener(
        &self,
        direction: Direction,
        fd: std::os::unix::io::RawFd,
        callback: crate::registry::ReadinessCallback,
    ) -> Result<crate::registry::ListenerId> {
        let listener = self.0.registry.lock().unwrap().add(direction, fd, callback)?;
        let (read, write) = match direction {
            Direction::Read => (true, false),
            Direction::Write => (false, true),
        };
        self.0.backend.add_descriptor(fd, read, write)?;
        Ok(listener)
    }

    pub(crate) fn remove_listener(&self, listener: crate::registry::ListenerId) {
        self.0.registry.lock().unwrap().remove(listener);
        let still_listened = {
            let reg = self.0.registry.lock().unwrap();
            reg.has_read(listener.fd) || reg.has_write(listener.fd)
        };
        if !still_listened {
            let _ = self.0.backend.remove_descriptor(listener.fd);
        }
    }

    // -- run loop -----------------------------------------------------------

    /// Runs the hub's event loop on the calling thread until there is no
    /// more pending work (no timers, no listeners) or until [`Hub::abort`]
    /// is observed (§4.E).
    pub fn run(&self) {
        set_current_hub(self.clone());
        *self.0.run_state.lock().unwrap() = RunState::Running;

        loop {
            let now = Instant::now();
            let next_deadline = self.0.timers.lock().unwrap().next_deadline();
            let has_listeners = !self.0.registry.lock().unwrap().is_empty();

            if next_deadline.is_none() && !has_listeners {
                log::debug!("hub: no pending timers or listeners, stopping");
                break;
            }

            let wait_for = next_deadline.map(|d| d.saturating_duration_since(now));
            log::trace!("hub: tick, wait_for={wait_for:?}");

            match self.0.backend.wait(wait_for) {
                Ok(ready) => {
                    for (fd, readiness) in ready {
                        self.dispatch_readiness(fd, readiness);
                    }
                }
                Err(e) => {
                    if e.is_system() {
                        log::error!("hub: system backend error, aborting loop: {e}");
                        break;
                    }
                    log::warn!("hub: backend error, continuing: {e}");
                }
            }

            self.0
                .timers
                .lock()
                .unwrap()
                .expire_ready(Instant::now(), self);

            if *self.0.run_state.lock().unwrap() == RunState::Aborting {
                break;
            }
        }

        *self.0.run_state.lock().unwrap() = RunState::Stopped;
    }

    fn dispatch_readiness(&self, fd: std::os::unix::io::RawFd, readiness: crate::backend::Readiness) {
        let mut registry = self.0.registry.lock().unwrap();
        let has_exc_semantics = readiness.error;
        let read_cb = if readiness.read || has_exc_semantics {
            registry.take(Direction::Read, fd)
        } else {
            None
        };
        let write_cb = if readiness.write || has_exc_semantics {
            registry.take(Direction::Write, fd)
        } else {
            None
        };
        drop(registry);
        if let Some(cb) = read_cb {
            cb(self);
        }
        if let Some(cb) = write_cb {
            cb(self);
        }
    }

    /// Requests a clean shutdown: the next loop iteration (after the
    /// in-flight backend `wait` returns) will stop. Safe to call from any
    /// thread.
    pub fn abort(&self) {
        *self.0.run_state.lock().unwrap() = RunState::Aborting;
        let _ = self.0.backend.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_returns_when_nothing_pending() {
        let hub = Hub::new_for_test();
        hub.run();
        assert_eq!(hub.state(), RunState::Stopped);
    }

    #[test]
    fn spawned_fiber_runs_to_completion() {
        let hub = Hub::new_for_test();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        hub.spawn(move || {
            ran2.store(true, Ordering::SeqCst);
            Ok(())
        });
        hub.run();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn abort_stops_the_loop() {
        let hub = Hub::new_for_test();
        hub.schedule_call_global(Duration::from_secs(3600), |_| {});
        let hub2 = hub.clone();
        let runner = thread::spawn(move || hub2.run());
        thread::sleep(Duration::from_millis(50));
        hub.abort();
        runner.join().unwrap();
        assert_eq!(hub.state(), RunState::Stopped);
    }
}
