//! Error handling utils.
//!
//! Every fallible operation in this crate returns [`Result`], whose error
//! type is the single [`Error`] enum below. Variants are grouped roughly
//! along the taxonomy a consumer needs to distinguish: control-flow
//! conditions injected into a fiber (`Cancelled`, `Timeout`, `FiberExit`),
//! failures reported by the readiness backend (`Backend`), and
//! programmatic misuse of the API (`Usage`).

use std::fmt;
use std::io;
use std::sync::Arc;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Identity tag of a single [`crate::timeout::Timeout`] instance, used to
/// match a fired timeout against the scope that owns it.
pub type TimeoutId = u64;

/// Identity tag of a single [`crate::fiber::Fiber`].
pub type FiberId = u64;

#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Injected into a waiter by [`crate::event::Event::cancel`].
    #[error("operation was cancelled")]
    Cancelled,

    /// Injected into the bound fiber when a [`crate::timeout::Timeout`]
    /// fires. `id` identifies which `Timeout` instance raised it, so a
    /// scope can tell its own deadline apart from an outer one.
    #[error("deadline exceeded (timeout id {id})")]
    Timeout { id: TimeoutId },

    /// Injected by [`crate::fiber::kill`]. Unwinds the target fiber's
    /// entry function; framework code should let this propagate rather
    /// than treat it as a normal error.
    #[error("fiber {id} was killed")]
    FiberExit { id: FiberId },

    /// Raised by the backend's `wait`. Only `SYSTEM`-class backend errors
    /// (`interrupted`, `process exiting`) should unwind the hub loop;
    /// all others are reported via the squelch sink and the loop
    /// continues.
    #[error("backend error: {0}")]
    Backend(#[source] Arc<io::Error>),

    /// Programmatic misuse: double `send` on a triggered [`crate::event::Event`],
    /// `reset` on a fresh `Event`, a `trampoline` call asserting both
    /// directions, a blocking call made from the hub fiber, or installing
    /// a second listener on an already-listened `(fd, direction)`.
    #[error("usage error: {0}")]
    Usage(&'static str),

    /// Failure from the native-thread offload bridge: the callable
    /// invoked via [`crate::tpool::Tpool::execute`] panicked.
    #[error("tpool job panicked: {0}")]
    TpoolPanic(String),

    /// A fiber's entry function panicked. Reported to the hub's log and
    /// stored as this fiber's exit result; it does not unwind the hub
    /// thread.
    #[error("fiber panicked: {0}")]
    FiberPanic(String),

    /// I/O failure unrelated to the backend's own readiness polling
    /// (e.g. constructing the wake pipe).
    #[error("io error: {0}")]
    Io(#[from] IoError),

    /// Hub backend name from configuration did not match any backend
    /// compiled into this crate.
    #[error("unknown hub backend {0:?}, only \"poll\" is built in")]
    UnknownBackend(String),

    /// A primitive requiring an active hub on the current thread was
    /// called without one.
    #[error("no hub is running on this thread")]
    NoCurrentHub,
}

impl Error {
    pub fn usage(message: &'static str) -> Self {
        Self::Usage(message)
    }

    pub fn backend(e: io::Error) -> Self {
        Self::Backend(Arc::new(e))
    }

    /// Returns the name of the variant as spelled in the source, useful
    /// in tests and logs.
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::Cancelled => "Cancelled",
            Self::Timeout { .. } => "Timeout",
            Self::FiberExit { .. } => "FiberExit",
            Self::Backend(_) => "Backend",
            Self::Usage(_) => "Usage",
            Self::TpoolPanic(_) => "TpoolPanic",
            Self::FiberPanic(_) => "FiberPanic",
            Self::Io(_) => "Io",
            Self::UnknownBackend(_) => "UnknownBackend",
            Self::NoCurrentHub => "NoCurrentHub",
        }
    }

    /// Whether this error belongs to the SYSTEM class that is allowed to
    /// unwind the hub run loop (see `DESIGN NOTES`/§4.E).
    pub fn is_system(&self) -> bool {
        matches!(self, Self::Backend(e) if e.kind() == io::ErrorKind::Interrupted)
    }
}

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Error>();
};

/// [`io::Error`] isn't `Clone`, but [`Error`] needs to be (timeout
/// factories and cancelled-event payloads are cloned into every waiter).
/// This wraps it in an `Arc` the same way the teacher crate wraps
/// non-`Sync` sources (`Error::ConnectionClosed(Arc<Error>)`).
#[derive(Debug, Clone)]
pub struct IoError(pub Arc<io::Error>);

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&**self.0)
    }
}

impl From<io::Error> for IoError {
    fn from(e: io::Error) -> Self {
        Self(Arc::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_identity() {
        let a = Error::Timeout { id: 1 };
        let b = Error::Timeout { id: 2 };
        match (a, b) {
            (Error::Timeout { id: a }, Error::Timeout { id: b }) => assert_ne!(a, b),
            _ => unreachable!(),
        }
    }

    #[test]
    fn variant_name_matches() {
        assert_eq!(Error::Cancelled.variant_name(), "Cancelled");
        assert_eq!(Error::NoCurrentHub.variant_name(), "NoCurrentHub");
    }
}
