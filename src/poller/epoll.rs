//! Default readiness backend: epoll, driven through mio.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::channel::{EVENT_ERROR, EVENT_HUP, EVENT_NONE, EVENT_PRI, EVENT_READ, EVENT_WRITE};

const INITIAL_EVENT_CAPACITY: usize = 16;

pub(super) struct EpollBackend {
    registry: mio::Registry,
    state: Mutex<PollState>,
}

struct PollState {
    poll: Poll,
    events: Events,
}

impl EpollBackend {
    /// # Panics
    /// Failure to create the epoll instance is fatal: without a
    /// demultiplexer the loop cannot exist.
    pub(super) fn new() -> Self {
        let poll = match Poll::new() {
            Ok(poll) => poll,
            Err(e) => {
                error!(error = %e, "epoll creation failed");
                panic!("epoll creation failed: {e}");
            }
        };
        let registry = match poll.registry().try_clone() {
            Ok(registry) => registry,
            Err(e) => {
                error!(error = %e, "epoll registry clone failed");
                panic!("epoll registry clone failed: {e}");
            }
        };
        Self {
            registry,
            state: Mutex::new(PollState {
                poll,
                events: Events::with_capacity(INITIAL_EVENT_CAPACITY),
            }),
        }
    }

    pub(super) fn add(&self, fd: RawFd, events: u8) -> io::Result<()> {
        match interest_of(events) {
            Some(interest) => self
                .registry
                .register(&mut SourceFd(&fd), Token(fd as usize), interest),
            None => {
                trace!(fd, "kernel registration deferred until interest is set");
                Ok(())
            }
        }
    }

    pub(super) fn modify(&self, fd: RawFd, events: u8) -> io::Result<()> {
        match interest_of(events) {
            Some(interest) => {
                self.registry
                    .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
            }
            None => Ok(()),
        }
    }

    pub(super) fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.registry.deregister(&mut SourceFd(&fd))
    }

    pub(super) fn poll(&self, timeout: Duration, ready: &mut Vec<(RawFd, u8)>) -> io::Result<()> {
        let mut state = self.state.lock();
        let state = &mut *state;
        state.poll.poll(&mut state.events, Some(timeout))?;

        let mut count = 0;
        for event in state.events.iter() {
            count += 1;
            ready.push((event.token().0 as RawFd, readiness_of(event)));
        }

        // A full event list means readiness may be pending; grow so the next
        // poll can drain more in one call.
        let capacity = state.events.capacity();
        if count == capacity {
            state.events = Events::with_capacity(capacity * 2);
            debug!(capacity = capacity * 2, "event list expanded");
        }
        Ok(())
    }
}

fn interest_of(events: u8) -> Option<Interest> {
    match (events & EVENT_READ != 0, events & EVENT_WRITE != 0) {
        (true, true) => Some(Interest::READABLE | Interest::PRIORITY | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE | Interest::PRIORITY),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

fn readiness_of(event: &mio::event::Event) -> u8 {
    let mut mask = EVENT_NONE;
    if event.is_readable() {
        mask |= EVENT_READ;
    }
    if event.is_writable() {
        mask |= EVENT_WRITE;
    }
    if event.is_priority() {
        mask |= EVENT_PRI;
    }
    if event.is_error() {
        mask |= EVENT_ERROR;
    }
    if event.is_read_closed() && event.is_write_closed() {
        mask |= EVENT_HUP;
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn reports_writable_socket() {
        let backend = EpollBackend::new();
        let (sock, _peer) = UnixStream::pair().unwrap();
        let fd = sock.as_raw_fd();

        backend.add(fd, EVENT_WRITE).unwrap();
        let mut ready = Vec::new();
        backend.poll(Duration::from_secs(1), &mut ready).unwrap();

        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, fd);
        assert_ne!(ready[0].1 & EVENT_WRITE, 0);

        backend.delete(fd).unwrap();
        ready.clear();
        backend.poll(Duration::from_millis(10), &mut ready).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn modify_switches_interest() {
        let backend = EpollBackend::new();
        let (sock, _peer) = UnixStream::pair().unwrap();
        let fd = sock.as_raw_fd();

        backend.add(fd, EVENT_WRITE).unwrap();
        backend.modify(fd, EVENT_READ).unwrap();

        // Nothing written yet, so a read-only interest stays quiet.
        let mut ready = Vec::new();
        backend.poll(Duration::from_millis(10), &mut ready).unwrap();
        assert!(ready.is_empty());
        backend.delete(fd).unwrap();
    }
}
