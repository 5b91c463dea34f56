//! Context-switch counting, used mostly for testing.
//!
//! Where the teacher asks a Lua-side `fiber.self():csw()` for this
//! count, this crate already maintains a real atomic counter on
//! [`crate::hub::Hub`] (incremented once per baton handoff) since every
//! switch here is a baton handoff rather than a VM call — `csw()` below
//! just reads it.

use crate::error::Result;
use crate::hub::get_current_hub;

/// Number of context switches the current hub has performed so far.
pub fn csw() -> Result<u64> {
    Ok(get_current_hub()?.csw())
}

/// Calls `f` and reports whether any context switch happened while it
/// ran. Mirrors the teacher's own `check_yield` helper, used throughout
/// its test suite to assert a given call does or doesn't suspend.
pub fn check_yield<F, T>(f: F) -> Result<YieldResult<T>>
where
    F: FnOnce() -> T,
{
    let before = csw()?;
    let result = f();
    Ok(if csw()? == before {
        YieldResult::DidntYield(result)
    } else {
        YieldResult::Yielded(result)
    })
}

#[derive(Debug, PartialEq, Eq)]
pub enum YieldResult<T> {
    DidntYield(T),
    Yielded(T),
}
