//! Public fiber API (§4.A, §6): `spawn`, `switch_to`/`throw_into` (via the
//! hub), `current`, `kill`, `sleep`, and the cooperative `reschedule`
//! yield.
//!
//! A fiber here is a real OS thread gated by the hub's baton (see
//! `hub.rs`); this module is the thin, ergonomic surface consumers use
//! instead of reaching into `Hub` directly.

use std::time::Duration;

use crate::error::{Error, FiberId, Result};
use crate::hub::{current_fiber, get_current_hub, Resume};

/// The currently running fiber, or `None` if called from the hub fiber
/// itself.
pub fn current() -> Option<FiberId> {
    current_fiber()
}

fn require_fiber() -> Result<FiberId> {
    current().ok_or_else(|| Error::usage("this call may not be made from the hub fiber"))
}

/// Spawns a new fiber running `f` on the current hub. Per §4.A, the
/// fiber does not run immediately; it is scheduled for the hub's next
/// tick.
pub fn spawn<F>(f: F) -> Result<FiberId>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let hub = get_current_hub()?;
    Ok(hub.spawn(f))
}

/// Spawns a fiber whose body runs only after `delay` has elapsed.
pub fn spawn_after<F>(delay: Duration, f: F) -> Result<FiberId>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let hub = get_current_hub()?;
    let id = hub.spawn(move || {
        sleep(delay)?;
        f()
    });
    Ok(id)
}

/// Throws a [`Error::FiberExit`] into `fiber` at its next switch-in,
/// terminating it. A no-op if the fiber has already exited.
pub fn kill(fiber: FiberId) -> Result<()> {
    let hub = get_current_hub()?;
    hub.kill(fiber);
    Ok(())
}

/// Suspends the current fiber for (at least) `duration`. Must not be
/// called from the hub fiber.
pub fn sleep(duration: Duration) -> Result<()> {
    let hub = get_current_hub()?;
    let me = require_fiber()?;
    hub.schedule_call(duration, move |hub| hub.switch_to(me, Resume::unit()));
    let resume = hub.suspend_self();
    resume.into_result().map(|_| ())
}

/// Voluntarily yields the CPU: switches back to the hub and is
/// rescheduled for the next tick, with no deadline. This is the
/// `schedule_call(0) + switch-to-hub` yield pattern used throughout the
/// higher-level primitives.
pub fn reschedule() -> Result<()> {
    sleep(Duration::from_secs(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn spawn_runs_on_next_tick_not_immediately() {
        let hub = Hub::new_for_test();
        crate::hub::use_hub(hub.clone());
        let order = Arc::new(AtomicU32::new(0));
        let o = order.clone();
        spawn(move || {
            o.store(2, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        // Spawning must not have run the fiber body yet.
        assert_eq!(order.load(Ordering::SeqCst), 0);
        hub.run();
        assert_eq!(order.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn sleep_from_hub_fiber_is_usage_error() {
        let hub = Hub::new_for_test();
        crate::hub::use_hub(hub);
        let err = sleep(Duration::from_millis(1)).unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[test]
    fn killed_fiber_never_runs_its_body() {
        let hub = Hub::new_for_test();
        crate::hub::use_hub(hub.clone());
        let ran = Arc::new(AtomicU32::new(0));
        let r = ran.clone();
        let id = spawn(move || {
            r.store(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        kill(id).unwrap();
        hub.run();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
