//! Portable `poll(2)` backend, selected via `REVERB_USE_POLL`.
//!
//! Interest lives in a map and the pollfd list is rebuilt per call; the
//! backend trades per-poll setup cost for zero registration syscalls, which
//! is acceptable for the fallback path.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use parking_lot::Mutex;

use crate::channel::{EVENT_ERROR, EVENT_HUP, EVENT_NONE, EVENT_PRI, EVENT_READ, EVENT_WRITE};

pub(super) struct PollBackend {
    interest: Mutex<HashMap<RawFd, u8>>,
}

impl PollBackend {
    pub(super) fn new() -> Self {
        Self {
            interest: Mutex::new(HashMap::new()),
        }
    }

    pub(super) fn add(&self, fd: RawFd, events: u8) -> io::Result<()> {
        self.interest.lock().insert(fd, events);
        Ok(())
    }

    pub(super) fn modify(&self, fd: RawFd, events: u8) -> io::Result<()> {
        self.interest.lock().insert(fd, events);
        Ok(())
    }

    pub(super) fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.interest.lock().remove(&fd);
        Ok(())
    }

    pub(super) fn poll(&self, timeout: Duration, ready: &mut Vec<(RawFd, u8)>) -> io::Result<()> {
        let mut fds: Vec<libc::pollfd> = self
            .interest
            .lock()
            .iter()
            .map(|(&fd, &events)| libc::pollfd {
                fd,
                events: poll_events_of(events),
                revents: 0,
            })
            .collect();

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        for pfd in fds.iter().filter(|p| p.revents != 0) {
            ready.push((pfd.fd, readiness_of(pfd.revents)));
        }
        Ok(())
    }
}

fn poll_events_of(events: u8) -> libc::c_short {
    let mut mask = 0;
    if events & EVENT_READ != 0 {
        mask |= libc::POLLIN | libc::POLLPRI;
    }
    if events & EVENT_WRITE != 0 {
        mask |= libc::POLLOUT;
    }
    mask
}

fn readiness_of(revents: libc::c_short) -> u8 {
    let mut mask = EVENT_NONE;
    if revents & libc::POLLIN != 0 {
        mask |= EVENT_READ;
    }
    if revents & libc::POLLPRI != 0 {
        mask |= EVENT_PRI;
    }
    if revents & libc::POLLOUT != 0 {
        mask |= EVENT_WRITE;
    }
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        mask |= EVENT_ERROR;
    }
    if revents & libc::POLLHUP != 0 {
        mask |= EVENT_HUP;
    }
    mask
}
