//! Timeout: a scoped deadline that injects an exception into a bound
//! fiber when it fires (§4.H).
//!
//! §9's own design notes call for replacing "exceptions as control flow"
//! with "a structured scope returning a result variant {Completed,
//! TimedOut}" — that's [`Outcome`] below. The identity-match nesting rule
//! is preserved by tagging every `Timeout` with a unique id (also per
//! §9) and having [`Timeout::scope`] only act on an [`Error::Timeout`]
//! when its id matches; any other id (an outer scope's timeout firing
//! inside this one) is left to propagate as an `Err` untouched.
//!
//! Exception selection (§4.H): a fired timeout's exception is either a
//! default self-identifying value, an explicit instance, a factory
//! invoked on fire, or the `Suppress` sentinel that catches the timeout
//! silently at scope exit. Only `Suppress` turns a fired scope into
//! `Outcome::TimedOut`; the other three still propagate past the scope
//! as an `Err`, matching the default "raises out of scope" behavior.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::fiber;
use crate::hub::get_current_hub;
use crate::timer::TimerHandle;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome<R> {
    Completed(R),
    TimedOut,
}

impl<R> Outcome<R> {
    pub fn completed(self) -> Option<R> {
        match self {
            Outcome::Completed(r) => Some(r),
            Outcome::TimedOut => None,
        }
    }
}

enum State {
    Inactive,
    Pending(TimerHandle),
    Cancelled,
    Fired,
}

/// The exception a fired timeout injects, and what that does to its
/// scope's exit value (§4.H "exception selection").
pub enum ExcOrFactory {
    /// A default, self-identifying error. Propagates past the scope.
    Default,
    /// A specific error value, raised in place of the default. Propagates
    /// past the scope.
    Instance(Error),
    /// Invoked once, on fire, to build the propagated error.
    Factory(fn() -> Error),
    /// The `false`-sentinel case: caught at scope exit as a silent
    /// timeout (`Outcome::TimedOut`) rather than propagated.
    Suppress,
}

impl Default for ExcOrFactory {
    fn default() -> Self {
        ExcOrFactory::Default
    }
}

/// A deadline bound to the fiber that creates it. `seconds = None`
/// produces a permanently-inactive instance whose scope is a no-op,
/// matching §3's "a seconds value of null produces a permanently-INACTIVE
/// instance".
pub struct Timeout {
    id: u64,
    seconds: Option<Duration>,
    exc: ExcOrFactory,
    state: Mutex<State>,
}

impl Timeout {
    pub fn new(seconds: Option<Duration>, exc: ExcOrFactory) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            seconds,
            exc,
            state: Mutex::new(State::Inactive),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pending(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), State::Pending(_))
    }

    /// Schedules the firing timer. A no-op if `seconds` is `None`.
    pub fn start(&self) -> Result<()> {
        let Some(seconds) = self.seconds else {
            return Ok(());
        };
        let hub = get_current_hub()?;
        let me = fiber::current()
            .ok_or_else(|| Error::usage("Timeout may not be started from the hub fiber"))?;
        let id = self.id;
        let handle = hub.schedule_call_global(seconds, move |hub| {
            hub.throw_into(me, Error::Timeout { id });
        });
        *self.state.lock().unwrap() = State::Pending(handle);
        Ok(())
    }

    /// Cancels the timer if still pending. Idempotent and safe on every
    /// exit path, including after the timer already fired.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        if let State::Pending(handle) = &*state {
            handle.cancel();
        }
        if !matches!(&*state, State::Fired) {
            *state = State::Cancelled;
        }
    }

    fn mark_fired(&self) {
        *self.state.lock().unwrap() = State::Fired;
    }

    /// Runs `f` with the deadline active, cancelling it on every exit
    /// path. If `f` returns `Err(Error::Timeout { id })` whose `id`
    /// matches this instance, the outcome depends on this timeout's
    /// configured [`ExcOrFactory`]: `Suppress` turns it into
    /// `Ok(Outcome::TimedOut)`; `Default`/`Instance`/`Factory` propagate
    /// an `Err` (the default, the given instance, or the factory's
    /// output, respectively). Any other error — including a *different*
    /// Timeout's id, the identity-match rule from §4.H — propagates
    /// untouched regardless of this instance's configuration.
    pub fn scope<F, R>(&self, f: F) -> Result<Outcome<R>>
    where
        F: FnOnce() -> Result<R>,
    {
        self.start()?;
        let result = f();
        match result {
            Ok(v) => {
                self.cancel();
                Ok(Outcome::Completed(v))
            }
            Err(Error::Timeout { id }) if id == self.id => {
                self.mark_fired();
                match &self.exc {
                    ExcOrFactory::Suppress => Ok(Outcome::TimedOut),
                    ExcOrFactory::Default => Err(Error::Timeout { id }),
                    ExcOrFactory::Instance(e) => Err(e.clone()),
                    ExcOrFactory::Factory(f) => Err(f()),
                }
            }
            Err(e) => {
                self.cancel();
                Err(e)
            }
        }
    }
}

/// Convenience wrapper: `Timeout::new(seconds, ExcOrFactory::Suppress).scope(f)`.
pub fn timeout<F, R>(seconds: Option<Duration>, f: F) -> Result<Outcome<R>>
where
    F: FnOnce() -> Result<R>,
{
    Timeout::new(seconds, ExcOrFactory::Suppress).scope(f)
}
