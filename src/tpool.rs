//! tpool: a bridge to a fixed pool of native OS threads for running
//! blocking work without stalling the hub (§4.K).
//!
//! Grounded on the teacher's `cbus::sync::std` module: the `Thread {
//! inner, flag: Arc<AtomicBool> }` park/unpark pattern used there to
//! wake a producer blocked on a full channel is reused here to park and
//! wake idle native worker threads, and `crossbeam_queue::SegQueue` is
//! reused for the job/completion queues in place of `cbus`'s
//! tarantool-FFI endpoint.
//!
//! Completions cross back from native threads to the hub through a
//! self-pipe, the same mechanism `backend.rs` uses for `abort()`: one
//! dedicated "bridge" fiber blocks in [`crate::trampoline::trampoline`]
//! on the pipe's read end and, each time it wakes, drains every
//! finished job's [`crate::event::Event`].

use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_queue::SegQueue;

use crate::error::{Error, FiberId, Result};
use crate::event::Event;
use crate::fiber;

type Job = Box<dyn FnOnce() -> std::result::Result<Box<dyn std::any::Any + Send>, String> + Send>;

struct Completion {
    slot: Arc<Mutex<Option<Result<Box<dyn std::any::Any + Send>>>>>,
    done: Event<()>,
}

#[derive(Clone)]
struct ParkedThread {
    inner: thread::Thread,
    flag: Arc<AtomicBool>,
}

impl ParkedThread {
    fn current() -> Self {
        Self {
            inner: thread::current(),
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    fn park(&self) {
        if !self.flag.load(Ordering::Acquire) {
            thread::park();
        }
    }

    fn unpark(&self) {
        self.flag.store(true, Ordering::Release);
        self.inner.unpark();
    }
}

struct ThreadWaker {
    parked: SegQueue<ParkedThread>,
}

impl ThreadWaker {
    fn new() -> Self {
        Self {
            parked: SegQueue::new(),
        }
    }

    fn wait(&self, shutdown: &AtomicBool) {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        let t = ParkedThread::current();
        self.parked.push(t.clone());
        t.park();
    }

    fn wakeup_one(&self) {
        if let Some(t) = self.parked.pop() {
            t.unpark();
        }
    }

    fn wakeup_all(&self) {
        while let Some(t) = self.parked.pop() {
            t.unpark();
        }
    }
}

struct Inner {
    jobs: SegQueue<(Job, Arc<Mutex<Option<Result<Box<dyn std::any::Any + Send>>>>>, Event<()>)>,
    completions: SegQueue<Completion>,
    waker: ThreadWaker,
    shutdown: AtomicBool,
    wake_r: RawFd,
    wake_w: RawFd,
    threads: Mutex<Vec<JoinHandle<()>>>,
    bridge: Mutex<Option<FiberId>>,
}

/// A fixed-size pool of native OS threads, bridged back into a single
/// hub so blocking or CPU-bound work never stalls the fiber scheduler.
#[derive(Clone)]
pub struct Tpool {
    inner: Arc<Inner>,
}

impl Tpool {
    /// Spawns `size` OS worker threads and one bridge fiber on the
    /// current hub. `size` defaults to [`crate::config::get`]'s
    /// `tpool_size` when not overridden by the caller.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::usage("Tpool requires at least one thread"));
        }
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(Error::backend(std::io::Error::last_os_error()));
        }
        let [wake_r, wake_w] = fds;

        let inner = Arc::new(Inner {
            jobs: SegQueue::new(),
            completions: SegQueue::new(),
            waker: ThreadWaker::new(),
            shutdown: AtomicBool::new(false),
            wake_r,
            wake_w,
            threads: Mutex::new(Vec::new()),
            bridge: Mutex::new(None),
        });

        let mut threads = Vec::with_capacity(size);
        for _ in 0..size {
            let inner = inner.clone();
            threads.push(thread::spawn(move || worker_thread_main(inner)));
        }
        *inner.threads.lock().unwrap() = threads;

        let bridge_inner = inner.clone();
        let bridge = fiber::spawn(move || bridge_fiber_main(bridge_inner))?;
        *inner.bridge.lock().unwrap() = Some(bridge);

        Ok(Self { inner })
    }

    /// Convenience constructor using [`crate::config::get`]'s configured
    /// `tpool_size`.
    pub fn from_config() -> Result<Self> {
        Self::new(crate::config::get()?.tpool_size)
    }

    /// Runs `job` on a native thread, blocking the calling fiber until it
    /// finishes. A panic inside `job` surfaces as `Error::TpoolPanic`
    /// rather than unwinding into the fiber. Must not be called from the
    /// hub fiber.
    pub fn execute<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let slot: Arc<Mutex<Option<Result<Box<dyn std::any::Any + Send>>>>> =
            Arc::new(Mutex::new(None));
        let done: Event<()> = Event::new();
        let boxed: Job = Box::new(move || Ok(Box::new(job()) as Box<dyn std::any::Any + Send>));

        self.inner.jobs.push((boxed, slot.clone(), done.clone()));
        self.inner.waker.wakeup_one();

        done.wait()?;
        let result = slot.lock().unwrap().take().expect("worker always fills the slot");
        result.map(|boxed| {
            *boxed
                .downcast::<R>()
                .expect("Tpool job result type mismatch")
        })
    }

    /// Shuts down every worker thread and the bridge fiber. Jobs already
    /// queued but not yet picked up by a worker are dropped.
    pub fn killall(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.waker.wakeup_all();
        for handle in self.inner.threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        if let Some(bridge) = self.inner.bridge.lock().unwrap().take() {
            let _ = fiber::kill(bridge);
        }
    }
}

// `Tpool` is a cheap `Arc<Inner>` handle and may be cloned (e.g. into a
// `Proxy`), so the pipe fds are closed when the last `Inner` drops, not
// on every `Tpool` clone's drop.
impl Drop for Inner {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_r);
            libc::close(self.wake_w);
        }
    }
}

/// Auto-wrap for a value that should only ever be touched on a native
/// thread (§4.K "Auto-wrap Proxy"). Rust has no runtime reflection, so
/// unlike the teacher's dynamic method-forwarding proxy, a caller builds
/// the forwarding methods they need by hand (or with a small macro)
/// around [`Proxy::call`]; non-blocking accesses that don't need to cross
/// the bridge (equality, length, and the like) go through
/// [`Proxy::with_local`] instead.
pub struct Proxy<T> {
    inner: Arc<Mutex<T>>,
    pool: Tpool,
}

impl<T: Send + 'static> Proxy<T> {
    pub fn new(pool: Tpool, value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(value)),
            pool,
        }
    }

    /// Runs `f` against the wrapped value on a native thread via
    /// [`Tpool::execute`], blocking the calling fiber until it returns.
    pub fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut T) -> R + Send + 'static,
        R: Send + 'static,
    {
        let inner = self.inner.clone();
        self.pool.execute(move || {
            let mut guard = inner.lock().unwrap();
            f(&mut guard)
        })
    }

    /// Non-blocking access that never crosses the bridge.
    pub fn with_local<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&T) -> R,
    {
        let guard = self.inner.lock().unwrap();
        f(&guard)
    }
}

fn worker_thread_main(inner: Arc<Inner>) {
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        match inner.jobs.pop() {
            Some((job, slot, done)) => {
                let result = catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|panic| {
                    Err(panic_message(panic))
                });
                *slot.lock().unwrap() = Some(result.map_err(Error::TpoolPanic));
                inner.completions.push(Completion { slot, done });
                unsafe {
                    libc::write(inner.wake_w, b"x".as_ptr() as *const _, 1);
                }
            }
            None => inner.waker.wait(&inner.shutdown),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "tpool job panicked with a non-string payload".to_string()
    }
}

fn bridge_fiber_main(inner: Arc<Inner>) -> Result<()> {
    let mut buf = [0u8; 64];
    loop {
        crate::trampoline::trampoline(inner.wake_r, true, false, None, None)?;
        loop {
            let n = unsafe { libc::read(inner.wake_r, buf.as_mut_ptr() as *mut _, buf.len()) };
            if n <= 0 {
                break;
            }
        }
        while let Some(completion) = inner.completions.pop() {
            let _ = completion.done.send(Ok(()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;

    #[test]
    fn execute_runs_on_a_native_thread_and_returns_its_value() {
        let hub = Hub::new_for_test();
        crate::hub::use_hub(hub.clone());
        hub.spawn(|| {
            let pool = Tpool::new(2)?;
            let v = pool.execute(|| 6 * 7)?;
            assert_eq!(v, 42);
            pool.killall();
            Ok(())
        });
        hub.run();
    }

    #[test]
    fn panicking_job_surfaces_as_tpool_panic() {
        let hub = Hub::new_for_test();
        crate::hub::use_hub(hub.clone());
        hub.spawn(|| {
            let pool = Tpool::new(1)?;
            let err = pool.execute(|| -> i32 { panic!("boom") }).unwrap_err();
            assert!(matches!(err, Error::TpoolPanic(_)));
            pool.killall();
            Ok(())
        });
        hub.run();
    }

    #[test]
    fn zero_size_is_rejected() {
        let hub = Hub::new_for_test();
        crate::hub::use_hub(hub);
        assert!(Tpool::new(0).is_err());
    }

    #[test]
    fn proxy_forwards_mutation_through_execute() {
        let hub = Hub::new_for_test();
        crate::hub::use_hub(hub.clone());
        hub.spawn(|| {
            let pool = Tpool::new(1)?;
            let proxy = Proxy::new(pool.clone(), Vec::<i32>::new());
            proxy.call(|v| v.push(1))?;
            proxy.call(|v| v.push(2))?;
            let len = proxy.with_local(|v| v.len());
            assert_eq!(len, 2);
            let sum = proxy.call(|v| v.iter().sum::<i32>())?;
            assert_eq!(sum, 3);
            pool.killall();
            Ok(())
        });
        hub.run();
    }
}
