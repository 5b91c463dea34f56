//! Readiness registry: the map from `fd -> (read-cb, write-cb, exc-cb)`
//! that the backend adapter is queried against (§4.C).

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use crate::error::{Error, Result};
use crate::hub::Hub;

pub type ReadinessCallback = Box<dyn FnOnce(&Hub) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

/// Handle to an installed listener, returned by [`Registry::add`]. Used
/// to remove exactly the listener that was installed, even if another
/// one has since been installed for the same `(fd, direction)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerId {
    pub fd: RawFd,
    pub direction: Direction,
    generation: u64,
}

struct Slot {
    generation: u64,
    callback: Option<ReadinessCallback>,
}

#[derive(Default)]
pub struct Registry {
    read: HashMap<RawFd, Slot>,
    write: HashMap<RawFd, Slot>,
    next_generation: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty()
    }

    fn table_mut(&mut self, direction: Direction) -> &mut HashMap<RawFd, Slot> {
        match direction {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }

    fn table(&self, direction: Direction) -> &HashMap<RawFd, Slot> {
        match direction {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        }
    }

    /// At most one listener per `(fd, direction)` at a time (§3); a
    /// second `add` before the first is `remove`d is a [`Error::Usage`].
    pub fn add(
        &mut self,
        direction: Direction,
        fd: RawFd,
        callback: ReadinessCallback,
    ) -> Result<ListenerId> {
        if self.table(direction).contains_key(&fd) {
            return Err(Error::usage(
                "a listener is already installed for this (fd, direction)",
            ));
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        self.table_mut(direction).insert(
            fd,
            Slot {
                generation,
                callback: Some(callback),
            },
        );
        Ok(ListenerId {
            fd,
            direction,
            generation,
        })
    }

    pub fn remove(&mut self, listener: ListenerId) {
        if let Some(slot) = self.table(listener.direction).get(&listener.fd) {
            if slot.generation != listener.generation {
                // Already replaced by a newer listener; nothing to do.
                return;
            }
        } else {
            return;
        }
        self.table_mut(listener.direction).remove(&listener.fd);
    }

    pub fn remove_descriptor(&mut self, fd: RawFd) {
        self.read.remove(&fd);
        self.write.remove(&fd);
    }

    pub fn has_read(&self, fd: RawFd) -> bool {
        self.read.contains_key(&fd)
    }

    pub fn has_write(&self, fd: RawFd) -> bool {
        self.write.contains_key(&fd)
    }

    /// All fds with at least one listener installed, for building the
    /// backend's interest set each tick.
    pub fn interested_fds(&self) -> Vec<(RawFd, bool, bool)> {
        let mut fds: HashMap<RawFd, (bool, bool)> = HashMap::new();
        for fd in self.read.keys() {
            fds.entry(*fd).or_default().0 = true;
        }
        for fd in self.write.keys() {
            fds.entry(*fd).or_default().1 = true;
        }
        fds.into_iter().map(|(fd, (r, w))| (fd, r, w)).collect()
    }

    /// Takes (removes) the callback for a ready `(fd, direction)`, if any
    /// is still installed.
    pub fn take(&mut self, direction: Direction, fd: RawFd) -> Option<ReadinessCallback> {
        self.table_mut(direction)
            .get_mut(&fd)
            .and_then(|slot| slot.callback.take())
    }
}
