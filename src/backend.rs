//! Backend adapter: blocks until a registered fd is ready or the next
//! timer deadline elapses (§4.D).
//!
//! The core is backend-agnostic (see [`Backend`]); this crate ships a
//! single adapter built on raw `poll(2)` via `libc`, the same low-level
//! style the teacher crate uses for its own non-blocking I/O (`coio.rs`
//! calls `libc::fcntl`/`libc::read`/`libc::write` directly rather than
//! going through a higher-level polling crate).

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub read: bool,
    pub write: bool,
    pub error: bool,
}

/// The interface the Hub consumes from a readiness backend (§6). Only
/// [`PollBackend`] ships in this crate; an alternate adapter (epoll,
/// select, ...) would implement this same trait.
pub trait Backend: Send + Sync {
    fn add_descriptor(&self, fd: RawFd, read: bool, write: bool) -> Result<()>;
    fn remove_descriptor(&self, fd: RawFd) -> Result<()>;
    fn wait(&self, timeout: Option<Duration>) -> Result<Vec<(RawFd, Readiness)>>;
    /// Interrupts a blocked `wait`, used by `Hub::abort` to wake the loop
    /// promptly rather than waiting out the remaining timeout.
    fn abort(&self) -> Result<()>;
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

pub struct PollBackend {
    interest: Mutex<HashMap<RawFd, (bool, bool)>>,
    wake_read: RawFd,
    wake_write: RawFd,
}

impl PollBackend {
    pub fn new() -> Result<Self> {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(Error::backend(std::io::Error::last_os_error()));
        }
        let (wake_read, wake_write) = (fds[0], fds[1]);
        set_nonblocking(wake_read).map_err(Error::backend)?;
        set_nonblocking(wake_write).map_err(Error::backend)?;
        Ok(Self {
            interest: Mutex::new(HashMap::new()),
            wake_read,
            wake_write,
        })
    }
}

impl Drop for PollBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }
}

impl Backend for PollBackend {
    fn add_descriptor(&self, fd: RawFd, read: bool, write: bool) -> Result<()> {
        let mut interest = self.interest.lock().unwrap();
        let entry = interest.entry(fd).or_insert((false, false));
        entry.0 |= read;
        entry.1 |= write;
        Ok(())
    }

    fn remove_descriptor(&self, fd: RawFd) -> Result<()> {
        self.interest.lock().unwrap().remove(&fd);
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<Vec<(RawFd, Readiness)>> {
        let interest = self.interest.lock().unwrap().clone();
        let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(interest.len() + 1);
        for (&fd, &(read, write)) in interest.iter() {
            let mut events = 0;
            if read {
                events |= libc::POLLIN;
            }
            if write {
                events |= libc::POLLOUT;
            }
            pollfds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            });
        }
        pollfds.push(libc::pollfd {
            fd: self.wake_read,
            events: libc::POLLIN,
            revents: 0,
        });
        let wake_index = pollfds.len() - 1;

        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as libc::c_int,
        };

        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let e = std::io::Error::last_os_error();
            if e.kind() == std::io::ErrorKind::Interrupted {
                return Err(Error::backend(e));
            }
            return Err(Error::backend(e));
        }

        let mut ready = Vec::new();
        for (i, pfd) in pollfds.iter().enumerate() {
            if pfd.revents == 0 {
                continue;
            }
            if i == wake_index {
                // Drain the wake pipe; its only job is to interrupt poll().
                let mut buf = [0u8; 64];
                loop {
                    let n = unsafe {
                        libc::read(self.wake_read, buf.as_mut_ptr() as *mut _, buf.len())
                    };
                    if n <= 0 {
                        break;
                    }
                }
                continue;
            }
            let readiness = Readiness {
                read: pfd.revents & libc::POLLIN != 0,
                write: pfd.revents & libc::POLLOUT != 0,
                error: pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0,
            };
            ready.push((pfd.fd, readiness));
        }
        Ok(ready)
    }

    fn abort(&self) -> Result<()> {
        let byte = [1u8];
        unsafe {
            libc::write(self.wake_write, byte.as_ptr() as *const _, 1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_wakes_a_blocked_wait() {
        let backend = PollBackend::new().unwrap();
        backend.abort().unwrap();
        let ready = backend.wait(Some(Duration::from_secs(5))).unwrap();
        // Nothing but the wake pipe was registered, so the ready list is
        // empty but `wait` must return promptly rather than block 5s.
        assert!(ready.is_empty());
    }

    #[test]
    fn pipe_fd_becomes_readable() {
        let backend = PollBackend::new().unwrap();
        let mut fds = [0 as RawFd; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        let (r, w) = (fds[0], fds[1]);
        set_nonblocking(r).unwrap();
        backend.add_descriptor(r, true, false).unwrap();
        unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) };
        let ready = backend.wait(Some(Duration::from_secs(5))).unwrap();
        assert!(ready.iter().any(|(fd, rd)| *fd == r && rd.read));
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
