//! The reactor: one loop per thread, driving poll → dispatch → pending
//! tasks.
//!
//! [`EventLoop`] itself is pinned to the thread that constructed it and is
//! deliberately `!Send`. Everything another thread may do to a loop — queue
//! work, wake it, ask it to quit — goes through the cloneable
//! [`LoopHandle`].

use std::cell::Cell;
use std::io;
use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::callbacks::Task;
use crate::channel::Channel;
use crate::poller::Poller;

const POLL_TIMEOUT: Duration = Duration::from_secs(10);

thread_local! {
    static LOOP_IN_THIS_THREAD: Cell<bool> = const { Cell::new(false) };
}

pub(crate) struct LoopShared {
    thread_id: ThreadId,
    poller: Poller,
    quit: AtomicBool,
    looping: AtomicBool,
    calling_pending_tasks: AtomicBool,
    pending_tasks: Mutex<Vec<Task>>,
    wakeup_fd: OwnedFd,
}

impl LoopShared {
    fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Interrupt the blocking poll by bumping the eventfd counter.
    fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            error!(bytes = n, "wakeup write came up short");
        }
    }

    /// Drain the accumulated counter; the value itself does not matter,
    /// coalesced wakeups collapse into a single read.
    fn drain_wakeup(&self) {
        let mut value: u64 = 0;
        let n = unsafe {
            libc::read(
                self.wakeup_fd.as_raw_fd(),
                &mut value as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n != 8 {
            error!(bytes = n, "wakeup drain came up short");
        }
    }
}

/// A single-threaded event loop.
pub struct EventLoop {
    shared: Arc<LoopShared>,
    wakeup_channel: Arc<Channel>,
    poll_return_time: Cell<Instant>,
    _not_send: PhantomData<*const ()>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    /// Construct the loop owned by the current thread.
    ///
    /// # Panics
    /// At most one loop may exist per OS thread; constructing a second is a
    /// programmer error and panics. Failure to create the eventfd or the
    /// readiness backend also panics.
    pub fn new() -> EventLoop {
        LOOP_IN_THIS_THREAD.with(|flag| {
            if flag.get() {
                error!(
                    thread = ?thread::current().id(),
                    "another event loop already owns this thread"
                );
                panic!("another event loop already owns this thread");
            }
            flag.set(true);
        });

        let shared = Arc::new(LoopShared {
            thread_id: thread::current().id(),
            poller: Poller::new(),
            quit: AtomicBool::new(false),
            looping: AtomicBool::new(false),
            calling_pending_tasks: AtomicBool::new(false),
            pending_tasks: Mutex::new(Vec::new()),
            wakeup_fd: create_eventfd(),
        });

        let handle = LoopHandle {
            shared: shared.clone(),
        };
        let wakeup_channel = Channel::new(handle, shared.wakeup_fd.as_raw_fd());
        let drain = shared.clone();
        wakeup_channel.set_read_callback(Box::new(move |_ts| drain.drain_wakeup()));
        wakeup_channel.enable_reading();

        debug!(thread = ?shared.thread_id, "event loop created");
        EventLoop {
            shared,
            wakeup_channel,
            poll_return_time: Cell::new(Instant::now()),
            _not_send: PhantomData,
        }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    /// Timestamp of the most recent poll return.
    pub fn poll_return_time(&self) -> Instant {
        self.poll_return_time.get()
    }

    /// Drive the loop until [`LoopHandle::quit`] is observed.
    ///
    /// Each iteration polls for readiness (10 s cap), dispatches every
    /// active channel, then runs the pending-task queue. Must be called from
    /// the owning thread.
    pub fn run(&mut self) {
        self.handle().assert_in_loop_thread();
        self.shared.looping.store(true, Ordering::Relaxed);
        self.shared.quit.store(false, Ordering::Relaxed);
        debug!("event loop started");

        let mut active: Vec<Arc<Channel>> = Vec::new();
        while !self.shared.quit.load(Ordering::Acquire) {
            active.clear();
            let ts = self.shared.poller.poll(POLL_TIMEOUT, &mut active);
            self.poll_return_time.set(ts);
            for channel in &active {
                channel.handle_event(ts);
            }
            self.do_pending_tasks();
        }

        // Teardown work queued just before quit (connection destruction,
        // most importantly) must still run before the loop goes away.
        self.do_pending_tasks();
        self.shared.looping.store(false, Ordering::Release);
        debug!("event loop stopped");
    }

    /// Run `task` now if on the loop thread, otherwise defer it.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle().run_in_loop(task);
    }

    pub fn quit(&self) {
        self.handle().quit();
    }

    fn do_pending_tasks(&self) {
        self.shared
            .calling_pending_tasks
            .store(true, Ordering::Release);

        // Swap the queue out under the lock, run without it: a task is free
        // to enqueue more work without deadlocking.
        let tasks = std::mem::take(&mut *self.shared.pending_tasks.lock());
        if !tasks.is_empty() {
            trace!(count = tasks.len(), "running pending tasks");
        }
        for task in tasks {
            task();
        }

        self.shared
            .calling_pending_tasks
            .store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        debug!("event loop destroyed");
        self.wakeup_channel.disable_all();
        self.wakeup_channel.remove();
        LOOP_IN_THIS_THREAD.with(|flag| flag.set(false));
    }
}

/// Cloneable, thread-safe handle to an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    /// Whether two handles refer to the same loop.
    pub fn same_loop(&self, other: &LoopHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            error!(
                owner = ?self.shared.thread_id,
                current = ?thread::current().id(),
                "loop operation outside owner thread"
            );
            panic!("loop operation outside owner thread");
        }
    }

    /// Run `task` synchronously when called on the loop's own thread,
    /// otherwise queue it and wake the loop.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Append `task` to the pending queue.
    ///
    /// The loop is woken when the caller is off-thread, and also while the
    /// pending phase is executing: a task queued from within a task must
    /// trigger a fresh iteration instead of waiting out the poll timeout.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.pending_tasks.lock().push(Box::new(task));
        if !self.is_in_loop_thread() || self.shared.calling_pending_tasks.load(Ordering::Acquire) {
            self.shared.wakeup();
        }
    }

    /// Ask the loop to stop after the current iteration. Idempotent.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.shared.wakeup();
        }
    }

    pub(crate) fn update_channel(&self, channel: &Channel) {
        self.shared.poller.update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) {
        self.shared.poller.remove_channel(channel);
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn has_channel(&self, channel: &Channel) -> bool {
        self.shared.poller.has_channel(channel)
    }
}

fn create_eventfd() -> OwnedFd {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        let e = io::Error::last_os_error();
        error!(error = %e, "eventfd creation failed");
        panic!("eventfd creation failed: {e}");
    }
    unsafe { OwnedFd::from_raw_fd(fd) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn spawn_loop() -> (LoopHandle, thread::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel();
        let join = thread::spawn(move || {
            let mut event_loop = EventLoop::new();
            tx.send(event_loop.handle()).unwrap();
            event_loop.run();
        });
        (rx.recv().unwrap(), join)
    }

    #[test]
    #[should_panic(expected = "another event loop already owns this thread")]
    fn second_loop_in_one_thread_is_fatal() {
        let _first = EventLoop::new();
        let _second = EventLoop::new();
    }

    #[test]
    fn cross_thread_tasks_run_in_fifo_order() {
        let (handle, join) = spawn_loop();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let seen = seen.clone();
            handle.queue_in_loop(move || seen.lock().push(i));
        }

        let (done_tx, done_rx) = mpsc::channel();
        handle.queue_in_loop(move || done_tx.send(()).unwrap());
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(*seen.lock(), (0..100).collect::<Vec<i32>>());
        handle.quit();
        join.join().unwrap();
    }

    #[test]
    fn run_in_loop_is_synchronous_on_owner_thread() {
        let (handle, join) = spawn_loop();

        let (done_tx, done_rx) = mpsc::channel();
        let inner_handle = handle.clone();
        handle.queue_in_loop(move || {
            let ran = Arc::new(AtomicBool::new(false));
            let flag = ran.clone();
            inner_handle.run_in_loop(move || flag.store(true, Ordering::SeqCst));
            done_tx.send(ran.load(Ordering::SeqCst)).unwrap();
        });

        assert!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        handle.quit();
        join.join().unwrap();
    }

    #[test]
    fn task_queued_from_task_does_not_starve() {
        let (handle, join) = spawn_loop();

        let start = Instant::now();
        let (done_tx, done_rx) = mpsc::channel();
        let inner_handle = handle.clone();
        handle.queue_in_loop(move || {
            let done_tx = done_tx.clone();
            inner_handle.queue_in_loop(move || done_tx.send(()).unwrap());
        });

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // Without the calling-pending wakeup this would sit out the full
        // 10 s poll timeout.
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.quit();
        join.join().unwrap();
    }

    #[test]
    fn quit_is_idempotent() {
        let (handle, join) = spawn_loop();
        handle.quit();
        handle.quit();
        join.join().unwrap();
    }

    #[test]
    fn tasks_queued_before_quit_still_run() {
        let (handle, join) = spawn_loop();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        handle.queue_in_loop(move || flag.store(true, Ordering::SeqCst));
        handle.quit();
        join.join().unwrap();

        assert!(ran.load(Ordering::SeqCst));
    }
}
