//! Actor Mailbox: an ordered inbox with exactly one owning fiber driving
//! a `received` callback over it, in delivery order (§4.J).
//!
//! Grounded on the teacher's `fiber::channel::Channel` — an MPSC queue a
//! fiber blocks on to receive — narrowed here to the mailbox's
//! single-consumer shape and built on [`crate::event::Event`] rather than
//! the FFI channel primitive.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::event::Event;

struct Shared<M> {
    queue: Mutex<VecDeque<M>>,
    parked: Mutex<Option<Event<()>>>,
}

/// A clonable handle to an actor's inbox. Any number of fibers may
/// `cast` into it; exactly one fiber may be running [`Mailbox::run`] at
/// a time (enforced by `Error::Usage`, since a second concurrent reader
/// would split delivery order across two consumers).
pub struct Mailbox<M> {
    shared: Arc<Shared<M>>,
    owned: Arc<Mutex<bool>>,
}

impl<M> Clone for Mailbox<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            owned: self.owned.clone(),
        }
    }
}

impl<M: Send + 'static> Mailbox<M> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                parked: Mutex::new(None),
            }),
            owned: Arc::new(Mutex::new(false)),
        }
    }

    /// Enqueues `msg`. Never blocks the caller.
    pub fn cast(&self, msg: M) {
        self.shared.queue.lock().unwrap().push_back(msg);
        if let Some(parked) = self.shared.parked.lock().unwrap().take() {
            let _ = parked.send(Ok(()));
        }
    }

    pub fn len(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drives `received` over every message as it arrives, in FIFO
    /// order, forever (until `received` returns `Err`, which stops the
    /// loop and propagates). Must not be called concurrently by more
    /// than one fiber.
    pub fn run<F>(&self, mut received: F) -> Result<()>
    where
        F: FnMut(M) -> Result<()>,
    {
        {
            let mut owned = self.owned.lock().unwrap();
            if *owned {
                return Err(Error::usage("Mailbox already has an owner running"));
            }
            *owned = true;
        }
        let result = self.drive(&mut received);
        *self.owned.lock().unwrap() = false;
        result
    }

    fn drive<F>(&self, received: &mut F) -> Result<()>
    where
        F: FnMut(M) -> Result<()>,
    {
        loop {
            let next = self.shared.queue.lock().unwrap().pop_front();
            let msg = match next {
                Some(msg) => msg,
                None => {
                    let event = Event::new();
                    *self.shared.parked.lock().unwrap() = Some(event.clone());
                    // Re-check after registering: a `cast` racing the
                    // registration above may have found no parked event
                    // to wake, in which case the message is already
                    // sitting in the queue for us.
                    match self.shared.queue.lock().unwrap().pop_front() {
                        Some(msg) => {
                            self.shared.parked.lock().unwrap().take();
                            msg
                        }
                        None => {
                            event.wait()?;
                            continue;
                        }
                    }
                }
            };
            received(msg)?;
        }
    }
}

impl<M: Send + 'static> Default for Mailbox<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber;
    use crate::hub::Hub;
    use std::sync::Arc as StdArc;

    #[test]
    fn messages_are_delivered_once_each_in_order() {
        let hub = Hub::new_for_test();
        crate::hub::use_hub(hub.clone());
        let mailbox: Mailbox<i32> = Mailbox::new();
        let seen = StdArc::new(Mutex::new(Vec::new()));

        let mb = mailbox.clone();
        let s = seen.clone();
        hub.spawn(move || {
            let mut count = 0;
            mb.run(|msg| {
                s.lock().unwrap().push(msg);
                count += 1;
                if count == 3 {
                    Err(Error::Cancelled)
                } else {
                    Ok(())
                }
            })
            .ok();
            Ok(())
        });

        let mb2 = mailbox.clone();
        hub.spawn(move || {
            fiber::reschedule()?;
            mb2.cast(1);
            mb2.cast(2);
            mb2.cast(3);
            Ok(())
        });

        hub.run();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn second_concurrent_owner_is_usage_error() {
        let hub = Hub::new_for_test();
        crate::hub::use_hub(hub.clone());
        let mailbox: Mailbox<()> = Mailbox::new();
        let errored = StdArc::new(Mutex::new(false));

        let mb1 = mailbox.clone();
        hub.spawn(move || {
            mb1.run(|_| {
                fiber::sleep(std::time::Duration::from_millis(50))?;
                Ok(())
            })
            .ok();
            Ok(())
        });

        let mb2 = mailbox.clone();
        let e = errored.clone();
        hub.spawn(move || {
            fiber::reschedule()?;
            mb2.cast(());
            if mb2.run(|_| Ok(())).is_err() {
                *e.lock().unwrap() = true;
            }
            Ok(())
        });

        hub.run();
        assert!(*errored.lock().unwrap());
    }
}
