//! A single-threaded cooperative concurrency runtime.
//!
//! Many logical tasks ("fibers") are interleaved over one OS thread by a
//! central event loop (the "hub"), which resumes a fiber only at an
//! explicit suspension point: waiting on file descriptor readiness, on
//! a timer, on a one-shot result from another fiber, or a bare yield.
//! Exactly one fiber (or the hub itself) ever runs at a time.
//!
//! - [Hub: the event loop kernel](hub)
//! - [Fibers: spawn, sleep, kill, yield](fiber)
//! - [Timers](timer)
//! - [Readiness registry](registry)
//! - [The pluggable readiness backend](backend) (`poll(2)` is the only one built in)
//! - [Suspend-on-readiness primitive](trampoline)
//! - [Event: one-shot, multi-waiter rendezvous](event)
//! - [Timeout: a scoped deadline](timeout)
//! - [FiberPool: a bounded worker pool](pool)
//! - [Mailbox: an ordered actor inbox](mailbox)
//! - [tpool: native-thread offload bridge](tpool)
//! - [Context-switch counting](csw)
//! - [Error handling](error)
//! - [Configuration](config)
//!
//! > **Caution!** This library is single-threaded by design: a `Hub`
//! > and the fibers it runs never migrate across OS threads except via
//! > the `tpool` bridge, which exists precisely to isolate blocking
//! > work from this constraint.

pub mod backend;
pub mod config;
pub mod csw;
pub mod error;
pub mod event;
pub mod fiber;
pub mod hub;
pub mod mailbox;
pub mod pool;
pub mod registry;
pub mod timeout;
pub mod timer;
pub mod tpool;
pub mod trampoline;

pub use error::Result;
