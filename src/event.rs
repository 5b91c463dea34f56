//! Event: the one-shot, multi-waiter rendezvous (§4.G). Every
//! higher-level synchronization primitive in this crate (`Timeout`'s
//! firing notification, `FiberPool`'s worker inbox, the `Mailbox`'s
//! wakeup, `tpool`'s per-job result) is built on top of this.
//!
//! Grounded on the teacher crate's `fiber::r#async::oneshot` channel
//! (a single-waiter `Rc<Cell<State<T>>>` future), generalized from one
//! waiter to the waiter *set* §3 requires, and from polling a `Waker` to
//! this crate's baton-based suspend/resume.

use std::sync::{Arc, Mutex};

use crate::error::{Error, FiberId, Result};
use crate::fiber;
use crate::hub::{get_current_hub, Resume};

enum State<T> {
    Fresh { waiters: Vec<FiberId> },
    Triggered { outcome: Result<T> },
}

/// A one-shot slot: `FRESH` may accumulate waiters; `send` transitions it
/// to `TRIGGERED` exactly once, delivering the same outcome to every
/// waiter. `reset` returns it to `FRESH` so it can be reused.
pub struct Event<T = ()> {
    inner: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Event<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(State::Fresh { waiters: Vec::new() })),
        }
    }

    pub fn ready(&self) -> bool {
        matches!(&*self.inner.lock().unwrap(), State::Triggered { .. })
    }

    /// Blocks the caller if `FRESH`, returning the eventual outcome of
    /// `send`; returns immediately if already `TRIGGERED`. Must not be
    /// called from the hub fiber.
    pub fn wait(&self) -> Result<T> {
        let me = fiber::current()
            .ok_or_else(|| Error::usage("Event::wait may not be called from the hub fiber"))?;

        {
            let mut state = self.inner.lock().unwrap();
            match &mut *state {
                State::Triggered { outcome } => return outcome.clone(),
                State::Fresh { waiters } => {
                    // Invariant 3: each fiber appears at most once.
                    if !waiters.contains(&me) {
                        waiters.push(me);
                    }
                }
            }
        }

        let hub = get_current_hub()?;
        let resume = hub.suspend_self();
        match resume {
            Resume::Value(boxed) => Ok(*boxed
                .downcast::<T>()
                .expect("Event resumed its waiter with the wrong payload type")),
            Resume::Exception(e) => Err(e),
        }
    }

    /// Legal only while `FRESH`. Stores `outcome`, transitions to
    /// `TRIGGERED`, and schedules every current waiter to be resumed with
    /// it (zero-delay timers, so delivery happens on a later tick, never
    /// synchronously inside `send`).
    pub fn send(&self, outcome: Result<T>) -> Result<()> {
        let waiters = {
            let mut state = self.inner.lock().unwrap();
            match &*state {
                State::Triggered { .. } => return Err(Error::usage("Event already triggered")),
                State::Fresh { waiters } => {
                    let waiters = waiters.clone();
                    *state = State::Triggered {
                        outcome: outcome.clone(),
                    };
                    waiters
                }
            }
        };

        let hub = get_current_hub()?;
        for waiter in waiters {
            let outcome = outcome.clone();
            hub.schedule_call_global(std::time::Duration::from_secs(0), move |hub| {
                let resume = match outcome {
                    Ok(v) => Resume::Value(Box::new(v)),
                    Err(e) => Resume::Exception(e),
                };
                hub.switch_to(waiter, resume);
            });
        }
        Ok(())
    }

    /// Legal only while `TRIGGERED`: clears the stored outcome and
    /// waiters, returning to `FRESH`.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        match &*state {
            State::Triggered { .. } => {
                *state = State::Fresh { waiters: Vec::new() };
                Ok(())
            }
            State::Fresh { .. } => Err(Error::usage("reset on a FRESH Event")),
        }
    }

    /// Removes `waiter` from the waiter set and schedules it to be
    /// resumed with [`Error::Cancelled`]. A no-op if `waiter` is not
    /// currently in the `FRESH` waiter set — in particular, a `send`
    /// that has already transitioned this Event to `TRIGGERED` always
    /// wins a race with a concurrent `cancel` (see `DESIGN.md`).
    pub fn cancel(&self, waiter: FiberId) -> Result<()> {
        let removed = {
            let mut state = self.inner.lock().unwrap();
            match &mut *state {
                State::Fresh { waiters } => {
                    let before = waiters.len();
                    waiters.retain(|w| *w != waiter);
                    waiters.len() != before
                }
                State::Triggered { .. } => false,
            }
        };
        if removed {
            let hub = get_current_hub()?;
            hub.schedule_call_global(std::time::Duration::from_secs(0), move |hub| {
                hub.throw_into(waiter, Error::Cancelled);
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc as StdArc;

    #[test]
    fn send_then_wait_delivers_value() {
        let hub = Hub::new_for_test();
        crate::hub::use_hub(hub.clone());
        let evt: Event<i32> = Event::new();
        evt.send(Ok(4)).unwrap();
        let observed = StdArc::new(AtomicU32::new(0));
        let o = observed.clone();
        let evt2 = evt.clone();
        hub.spawn(move || {
            let v = evt2.wait().unwrap();
            o.store(v as u32, Ordering::SeqCst);
            Ok(())
        });
        hub.run();
        assert_eq!(observed.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn event_fan_in_both_waiters_see_value() {
        let hub = Hub::new_for_test();
        crate::hub::use_hub(hub.clone());
        let evt: Event<i32> = Event::new();
        let seen = StdArc::new(Mutex::new(Vec::new()));

        for _ in 0..2 {
            let evt2 = evt.clone();
            let seen2 = seen.clone();
            hub.spawn(move || {
                let v = evt2.wait().unwrap();
                seen2.lock().unwrap().push(v);
                Ok(())
            });
        }
        let evt3 = evt.clone();
        hub.spawn(move || {
            evt3.send(Ok(4)).unwrap();
            Ok(())
        });
        hub.run();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|v| *v == 4));
    }

    #[test]
    fn double_send_is_usage_error() {
        let hub = Hub::new_for_test();
        crate::hub::use_hub(hub);
        let evt: Event<()> = Event::new();
        evt.send(Ok(())).unwrap();
        let err = evt.send(Ok(())).unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[test]
    fn reset_allows_reuse_with_new_value() {
        let hub = Hub::new_for_test();
        crate::hub::use_hub(hub);
        let evt: Event<i32> = Event::new();
        evt.send(Ok(1)).unwrap();
        assert_eq!(evt.wait().unwrap_err().variant_name(), "Usage");
        // wait() from the hub fiber is itself a usage error; exercised
        // for its own sake above. Reset from TRIGGERED then resend:
        evt.reset().unwrap();
        evt.send(Ok(2)).unwrap();
        match &*evt.inner.lock().unwrap() {
            State::Triggered { outcome } => assert_eq!(*outcome.as_ref().unwrap(), 2),
            State::Fresh { .. } => panic!("expected TRIGGERED"),
        }
    }

    #[test]
    fn reset_on_fresh_is_usage_error() {
        let hub = Hub::new_for_test();
        crate::hub::use_hub(hub);
        let evt: Event<()> = Event::new();
        let err = evt.reset().unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }
}
