//! Channel: the binding of one file descriptor to its event interest and
//! callbacks within a single loop.
//!
//! A channel never owns its fd and is only ever mutated from its owner
//! loop's thread; the atomics below exist so the surrounding types can be
//! shared across threads, not to support concurrent mutation.

use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::event_loop::LoopHandle;

pub(crate) const EVENT_NONE: u8 = 0;
pub(crate) const EVENT_READ: u8 = 0b0000_0001;
pub(crate) const EVENT_WRITE: u8 = 0b0000_0010;
pub(crate) const EVENT_PRI: u8 = 0b0000_0100;
pub(crate) const EVENT_ERROR: u8 = 0b0000_1000;
pub(crate) const EVENT_HUP: u8 = 0b0001_0000;

/// Where the channel currently stands with its loop's poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollerState {
    /// Never registered, or fully removed.
    New,
    /// Registered with the kernel and present in the poller map.
    Added,
    /// Present in the poller map but deregistered from the kernel
    /// (no current interest).
    Deleted,
}

impl PollerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PollerState::Added,
            2 => PollerState::Deleted,
            _ => PollerState::New,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PollerState::New => 0,
            PollerState::Added => 1,
            PollerState::Deleted => 2,
        }
    }
}

type ReadEventCallback = Box<dyn FnMut(Instant) + Send>;
type EventCallback = Box<dyn FnMut() + Send>;

pub struct Channel {
    owner: LoopHandle,
    fd: RawFd,
    events: AtomicU8,
    revents: AtomicU8,
    poller_state: AtomicU8,

    read_callback: Mutex<Option<ReadEventCallback>>,
    write_callback: Mutex<Option<EventCallback>>,
    close_callback: Mutex<Option<EventCallback>>,
    error_callback: Mutex<Option<EventCallback>>,

    /// Weak back-reference to the logical owner; upgraded for the duration
    /// of a dispatch so the owner cannot disappear mid-callback.
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    tied: AtomicBool,

    weak_self: Weak<Channel>,
}

impl Channel {
    pub(crate) fn new(owner: LoopHandle, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|weak_self| Channel {
            owner,
            fd,
            events: AtomicU8::new(EVENT_NONE),
            revents: AtomicU8::new(EVENT_NONE),
            poller_state: AtomicU8::new(PollerState::New.as_u8()),
            read_callback: Mutex::new(None),
            write_callback: Mutex::new(None),
            close_callback: Mutex::new(None),
            error_callback: Mutex::new(None),
            tie: Mutex::new(None),
            tied: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn events(&self) -> u8 {
        self.events.load(Ordering::Relaxed)
    }

    pub(crate) fn set_revents(&self, revents: u8) {
        self.revents.store(revents, Ordering::Relaxed);
    }

    pub(crate) fn poller_state(&self) -> PollerState {
        PollerState::from_u8(self.poller_state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_poller_state(&self, state: PollerState) {
        self.poller_state.store(state.as_u8(), Ordering::Relaxed);
    }

    pub(crate) fn weak_self(&self) -> Weak<Channel> {
        self.weak_self.clone()
    }

    pub(crate) fn set_read_callback(&self, cb: ReadEventCallback) {
        *self.read_callback.lock() = Some(cb);
    }

    pub(crate) fn set_write_callback(&self, cb: EventCallback) {
        *self.write_callback.lock() = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: EventCallback) {
        *self.close_callback.lock() = Some(cb);
    }

    pub(crate) fn set_error_callback(&self, cb: EventCallback) {
        *self.error_callback.lock() = Some(cb);
    }

    /// Arm the lifetime guard: `owner` is held weakly and upgraded around
    /// every dispatch.
    pub(crate) fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        *self.tie.lock() = Some(Arc::downgrade(owner));
        self.tied.store(true, Ordering::Release);
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.events() & EVENT_WRITE != 0
    }

    #[allow(dead_code)]
    pub(crate) fn is_reading(&self) -> bool {
        self.events() & EVENT_READ != 0
    }

    pub(crate) fn is_none_event(&self) -> bool {
        self.events() == EVENT_NONE
    }

    pub(crate) fn enable_reading(&self) {
        self.events.fetch_or(EVENT_READ, Ordering::Relaxed);
        self.update();
    }

    #[allow(dead_code)]
    pub(crate) fn disable_reading(&self) {
        self.events.fetch_and(!EVENT_READ, Ordering::Relaxed);
        self.update();
    }

    pub(crate) fn enable_writing(&self) {
        self.events.fetch_or(EVENT_WRITE, Ordering::Relaxed);
        self.update();
    }

    pub(crate) fn disable_writing(&self) {
        self.events.fetch_and(!EVENT_WRITE, Ordering::Relaxed);
        self.update();
    }

    pub(crate) fn disable_all(&self) {
        self.events.store(EVENT_NONE, Ordering::Relaxed);
        self.update();
    }

    /// Unregister from the owner loop. Double-remove is permitted.
    pub(crate) fn remove(&self) {
        debug!(fd = self.fd, "channel removed");
        self.owner.remove_channel(self);
    }

    fn update(&self) {
        self.owner.update_channel(self);
    }

    /// Dispatch the readiness bits recorded by the poller.
    ///
    /// Order is fixed: hang-up without readable data is terminal, errors are
    /// surfaced before further reads, and reads run before writes.
    pub(crate) fn handle_event(&self, receive_time: Instant) {
        if self.tied.load(Ordering::Acquire) {
            let guard = {
                let tie = self.tie.lock();
                tie.as_ref().and_then(Weak::upgrade)
            };
            match guard {
                Some(_guard) => self.handle_event_with_guard(receive_time),
                None => {
                    warn!(fd = self.fd, "event dropped: tied owner is gone");
                }
            }
        } else {
            self.handle_event_with_guard(receive_time);
        }
    }

    fn handle_event_with_guard(&self, receive_time: Instant) {
        let revents = self.revents.load(Ordering::Relaxed);
        trace!(fd = self.fd, revents, "dispatching channel event");

        if revents & EVENT_HUP != 0 && revents & EVENT_READ == 0 {
            if let Some(cb) = self.close_callback.lock().as_mut() {
                cb();
            }
            return;
        }

        if revents & EVENT_ERROR != 0 {
            if let Some(cb) = self.error_callback.lock().as_mut() {
                cb();
            }
        }

        if revents & (EVENT_READ | EVENT_PRI) != 0 {
            if let Some(cb) = self.read_callback.lock().as_mut() {
                cb(receive_time);
            }
        }

        if revents & EVENT_WRITE != 0 {
            if let Some(cb) = self.write_callback.lock().as_mut() {
                cb();
            }
        }
    }
}
