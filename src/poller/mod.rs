//! Readiness multiplexing.
//!
//! The poller owns the fd-to-channel map and reflects channel interest into
//! a kernel backend. Channels are held weakly; ownership stays with the
//! acceptor, connection, or loop that created them.
//!
//! Backend selection: epoll (through mio) unless `REVERB_USE_POLL=1` (or
//! `true`) opts into the portable `poll(2)` backend. Unrecognized values are
//! ignored.

mod epoll;
mod poll;

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::channel::{Channel, PollerState};

pub(crate) const ENV_USE_POLL: &str = "REVERB_USE_POLL";

pub(crate) struct Poller {
    backend: Backend,
    channels: Mutex<HashMap<RawFd, Weak<Channel>>>,
}

enum Backend {
    Epoll(epoll::EpollBackend),
    Poll(poll::PollBackend),
}

impl Backend {
    fn add(&self, fd: RawFd, events: u8) -> io::Result<()> {
        match self {
            Backend::Epoll(b) => b.add(fd, events),
            Backend::Poll(b) => b.add(fd, events),
        }
    }

    fn modify(&self, fd: RawFd, events: u8) -> io::Result<()> {
        match self {
            Backend::Epoll(b) => b.modify(fd, events),
            Backend::Poll(b) => b.modify(fd, events),
        }
    }

    fn delete(&self, fd: RawFd) -> io::Result<()> {
        match self {
            Backend::Epoll(b) => b.delete(fd),
            Backend::Poll(b) => b.delete(fd),
        }
    }

    fn poll(&self, timeout: Duration, ready: &mut Vec<(RawFd, u8)>) -> io::Result<()> {
        match self {
            Backend::Epoll(b) => b.poll(timeout, ready),
            Backend::Poll(b) => b.poll(timeout, ready),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Backend::Epoll(_) => "epoll",
            Backend::Poll(_) => "poll",
        }
    }
}

impl Poller {
    pub(crate) fn new() -> Poller {
        let use_poll = std::env::var(ENV_USE_POLL)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let backend = if use_poll {
            Backend::Poll(poll::PollBackend::new())
        } else {
            Backend::Epoll(epoll::EpollBackend::new())
        };
        debug!(backend = backend.name(), "poller created");
        Poller {
            backend,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Block on the backend, stamp the return time, and resolve the ready
    /// fds back into live channels.
    pub(crate) fn poll(&self, timeout: Duration, active: &mut Vec<Arc<Channel>>) -> Instant {
        let mut ready: Vec<(RawFd, u8)> = Vec::new();
        let result = self.backend.poll(timeout, &mut ready);
        let now = Instant::now();

        match result {
            Ok(()) => {
                if !ready.is_empty() {
                    trace!(count = ready.len(), "readiness events");
                }
                let channels = self.channels.lock();
                for (fd, revents) in ready {
                    match channels.get(&fd).and_then(Weak::upgrade) {
                        Some(channel) => {
                            channel.set_revents(revents);
                            active.push(channel);
                        }
                        None => trace!(fd, "readiness for vanished channel dropped"),
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => error!(error = %e, "poll failed"),
        }
        now
    }

    /// Drive the channel's poller-state tag:
    ///
    /// ```text
    /// New     --update--------------------> Added   (map insert, kernel ADD)
    /// Added   --update, no interest-------> Deleted (kernel DEL, stays in map)
    /// Deleted --update, interest----------> Added   (kernel ADD)
    /// Added   --remove--------------------> New     (kernel DEL, map erase)
    /// Deleted --remove--------------------> New     (map erase)
    /// ```
    pub(crate) fn update_channel(&self, channel: &Channel) {
        let state = channel.poller_state();
        let fd = channel.fd();
        let events = channel.events();
        trace!(fd, events, ?state, "updating channel");

        match state {
            PollerState::New | PollerState::Deleted => {
                if state == PollerState::New {
                    self.channels.lock().insert(fd, channel.weak_self());
                }
                channel.set_poller_state(PollerState::Added);
                if let Err(e) = self.backend.add(fd, events) {
                    error!(fd, error = %e, "readiness registration failed");
                    panic!("readiness registration failed for fd {fd}: {e}");
                }
            }
            PollerState::Added => {
                if channel.is_none_event() {
                    if let Err(e) = self.backend.delete(fd) {
                        debug!(fd, error = %e, "kernel deregistration failed");
                    }
                    channel.set_poller_state(PollerState::Deleted);
                } else if let Err(e) = self.backend.modify(fd, events) {
                    error!(fd, error = %e, "readiness modification failed");
                    panic!("readiness modification failed for fd {fd}: {e}");
                }
            }
        }
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) {
        let fd = channel.fd();
        trace!(fd, "removing channel");
        self.channels.lock().remove(&fd);
        if channel.poller_state() == PollerState::Added {
            if let Err(e) = self.backend.delete(fd) {
                debug!(fd, error = %e, "kernel deregistration failed");
            }
        }
        channel.set_poller_state(PollerState::New);
    }

    pub(crate) fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .lock()
            .get(&channel.fd())
            .is_some_and(|weak| Weak::ptr_eq(weak, &channel.weak_self()))
    }
}

#[cfg(test)]
mod tests {
    use crate::channel::{Channel, PollerState};
    use crate::event_loop::EventLoop;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn state_tags_track_map_membership() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let (sock, _peer) = UnixStream::pair().unwrap();

        let channel = Channel::new(handle.clone(), sock.as_raw_fd());
        assert_eq!(channel.poller_state(), PollerState::New);
        assert!(!handle.has_channel(&channel));

        channel.enable_reading();
        assert_eq!(channel.poller_state(), PollerState::Added);
        assert!(handle.has_channel(&channel));

        // Dropping all interest deregisters from the kernel but keeps the
        // channel in the map.
        channel.disable_all();
        assert_eq!(channel.poller_state(), PollerState::Deleted);
        assert!(handle.has_channel(&channel));

        // Interest coming back re-adds to the kernel.
        channel.enable_writing();
        assert_eq!(channel.poller_state(), PollerState::Added);
        assert!(handle.has_channel(&channel));

        channel.remove();
        assert_eq!(channel.poller_state(), PollerState::New);
        assert!(!handle.has_channel(&channel));

        // Double-remove is permitted.
        channel.remove();
        assert_eq!(channel.poller_state(), PollerState::New);
    }
}
