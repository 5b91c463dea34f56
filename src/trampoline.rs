//! Trampoline: the primitive that suspends a fiber on fd readiness, with
//! an optional timeout (§4.F).

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::fiber;
use crate::hub::{get_current_hub, Resume};
use crate::registry::Direction;

/// Suspends the caller until `fd` is ready in the requested direction, or
/// `timeout` expires (in which case `timeout_exc` is thrown into the
/// caller instead).
///
/// Exactly one of `read`/`write` must be true. The caller must not be
/// the hub fiber. Whichever way this returns — value or exception — the
/// installed listener is removed and any timer is cancelled before
/// control leaves this function.
pub fn trampoline(
    fd: RawFd,
    read: bool,
    write: bool,
    timeout: Option<Duration>,
    timeout_exc: Option<Error>,
) -> Result<()> {
    if read == write {
        return Err(Error::usage(
            "trampoline requires exactly one of read/write",
        ));
    }
    let hub = get_current_hub()?;
    let me = fiber::current().ok_or_else(|| {
        Error::usage("trampoline may not be called from the hub fiber")
    })?;

    let direction = if read { Direction::Read } else { Direction::Write };
    let listener = hub.add_listener(
        direction,
        fd,
        Box::new(move |hub| hub.switch_to(me, Resume::unit())),
    )?;

    let timer = timeout.map(|delay| {
        let exc = timeout_exc.unwrap_or_else(|| Error::usage("trampoline timed out"));
        hub.schedule_call_global(delay, move |hub| hub.throw_into(me, exc))
    });

    let resume = hub.suspend_self();

    hub.remove_listener(listener);
    if let Some(t) = &timer {
        t.cancel();
    }

    resume.into_result().map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use std::os::unix::io::RawFd;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        (fds[0], fds[1])
    }

    #[test]
    fn both_directions_is_usage_error() {
        let hub = Hub::new_for_test();
        crate::hub::use_hub(hub.clone());
        hub.spawn(|| {
            let err = trampoline(0, true, true, None, None).unwrap_err();
            assert!(matches!(err, Error::Usage(_)));
            Ok(())
        });
        hub.run();
    }

    #[test]
    fn resumes_when_fd_becomes_readable() {
        let hub = Hub::new_for_test();
        crate::hub::use_hub(hub.clone());
        let (r, w) = pipe();
        hub.spawn(move || {
            trampoline(r, true, false, None, None)?;
            unsafe { libc::close(r) };
            Ok(())
        });
        let hub2 = hub.clone();
        hub.spawn(move || {
            fiber::reschedule()?;
            unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) };
            unsafe { libc::close(w) };
            let _ = hub2;
            Ok(())
        });
        hub.run();
    }

    #[test]
    fn timeout_throws_configured_exception() {
        let hub = Hub::new_for_test();
        crate::hub::use_hub(hub.clone());
        let (r, _w) = pipe();
        hub.spawn(move || {
            let err = trampoline(
                r,
                true,
                false,
                Some(Duration::from_millis(10)),
                Some(Error::Timeout { id: 99 }),
            )
            .unwrap_err();
            assert!(matches!(err, Error::Timeout { id: 99 }));
            unsafe { libc::close(r) };
            Ok(())
        });
        hub.run();
    }
}
