//! Fiber Pool: a bounded set of long-lived worker fibers that execute
//! submitted jobs one at a time each (§4.I).
//!
//! Grounded on the teacher's `fiber::channel::Channel` — a bounded,
//! multi-producer/multi-consumer queue fibers block on — generalized
//! here from an FFI channel into a small job queue guarded by a
//! [`crate::event::Event`] used purely as a wakeup signal (the same
//! pattern `Mailbox` below reuses).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::fiber::{self, FiberId};

type Job = Box<dyn FnOnce() -> Result<Box<dyn std::any::Any + Send>> + Send>;

struct Submission {
    job: Job,
    done: Event<Arc<Mutex<Option<Result<Box<dyn std::any::Any + Send>>>>>>,
    slot: Arc<Mutex<Option<Result<Box<dyn std::any::Any + Send>>>>>,
}

struct Shared {
    queue: Mutex<VecDeque<Submission>>,
    parked: Mutex<VecDeque<Event<()>>>,
    max_size: usize,
    workers: Mutex<Vec<FiberId>>,
    idle: Mutex<usize>,
}

/// A bounded resource pool of reusable worker fibers (§4.I). `min_size`
/// workers are spawned eagerly as the pool's floor; further workers are
/// created lazily, one per job that finds every existing worker busy,
/// until the pool reaches `max_size`. Once at `max_size`, a submitted job
/// waits in FIFO order for a worker to free up (§4.I invariant: "a pool
/// never runs more than `max_size` jobs concurrently").
pub struct FiberPool {
    shared: Arc<Shared>,
}

impl FiberPool {
    pub fn new(min_size: usize, max_size: usize) -> Result<Self> {
        if max_size == 0 || min_size == 0 || min_size > max_size {
            return Err(Error::usage(
                "FiberPool requires 0 < min_size <= max_size",
            ));
        }
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            parked: Mutex::new(VecDeque::new()),
            max_size,
            workers: Mutex::new(Vec::new()),
            idle: Mutex::new(0),
        });

        let mut workers = Vec::with_capacity(min_size);
        for _ in 0..min_size {
            let shared = shared.clone();
            let id = fiber::spawn(move || worker_main(shared))?;
            workers.push(id);
        }
        *shared.workers.lock().unwrap() = workers;

        Ok(Self { shared })
    }

    /// Submits `job` and blocks the caller until a worker finishes it,
    /// returning its result. Must not be called from the hub fiber.
    pub fn execute<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let done: Event<Arc<Mutex<Option<Result<Box<dyn std::any::Any + Send>>>>>> = Event::new();
        let slot = Arc::new(Mutex::new(None));
        let boxed_job: Job = Box::new(move || job().map(|v| Box::new(v) as Box<dyn std::any::Any + Send>));

        self.submit(Submission {
            job: boxed_job,
            done: done.clone(),
            slot: slot.clone(),
        });

        let handle = done.wait()?;
        let result = handle.lock().unwrap().take().expect("worker always fills the slot");
        result.map(|boxed| {
            *boxed
                .downcast::<R>()
                .expect("FiberPool job result type mismatch")
        })
    }

    /// Submits `job` without waiting for it to start or finish.
    pub fn execute_async<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let done: Event<Arc<Mutex<Option<Result<Box<dyn std::any::Any + Send>>>>>> = Event::new();
        let slot = Arc::new(Mutex::new(None));
        let boxed_job: Job = Box::new(move || job().map(|_| Box::new(()) as Box<dyn std::any::Any + Send>));
        self.submit(Submission {
            job: boxed_job,
            done,
            slot,
        });
        Ok(())
    }

    fn submit(&self, submission: Submission) {
        self.shared.queue.lock().unwrap().push_back(submission);
        if let Some(parked) = self.shared.parked.lock().unwrap().pop_front() {
            let _ = parked.send(Ok(()));
            return;
        }
        self.grow_if_under_capacity();
    }

    /// Every existing worker is busy; spawn one more, up to `max_size`,
    /// so the job just queued doesn't wait on a worker that could exist.
    /// Once `workers.len() == max_size` the job simply waits in the
    /// queue for the next worker to free up.
    fn grow_if_under_capacity(&self) {
        let mut workers = self.shared.workers.lock().unwrap();
        if workers.len() >= self.shared.max_size {
            return;
        }
        let shared = self.shared.clone();
        if let Ok(id) = fiber::spawn(move || worker_main(shared)) {
            workers.push(id);
        }
    }

    /// Number of workers currently idle (waiting for a job).
    pub fn waiting(&self) -> usize {
        *self.shared.idle.lock().unwrap()
    }

    pub fn max_size(&self) -> usize {
        self.shared.max_size
    }

    /// Kills every worker fiber. Jobs already queued but not yet picked up
    /// are dropped; in-flight jobs run to completion since `kill` only
    /// takes effect the next time a fiber suspends.
    pub fn free(&self) {
        for worker in self.shared.workers.lock().unwrap().drain(..) {
            let _ = crate::fiber::kill(worker);
        }
    }
}

/// Blocks until a job is available, registering a private wakeup event in
/// `shared.parked` while holding the queue lock so a concurrent `submit`
/// can never push a job and miss a waiting worker.
fn park_until_job(shared: &Shared) -> Submission {
    loop {
        let park_event = {
            let mut queue = shared.queue.lock().unwrap();
            if let Some(submission) = queue.pop_front() {
                return submission;
            }
            let event = Event::new();
            shared.parked.lock().unwrap().push_back(event.clone());
            event
        };
        *shared.idle.lock().unwrap() += 1;
        let _ = park_event.wait();
        *shared.idle.lock().unwrap() -= 1;
    }
}

fn worker_main(shared: Arc<Shared>) -> Result<()> {
    loop {
        let submission = {
            let popped = shared.queue.lock().unwrap().pop_front();
            match popped {
                Some(s) => s,
                None => park_until_job(&shared),
            }
        };
        let Submission { job, done, slot } = submission;
        let result = job();
        *slot.lock().unwrap() = Some(result);
        let _ = done.send(Ok(slot));
    }
}
