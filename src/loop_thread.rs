//! A dedicated OS thread running one event loop.

use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::error;

use crate::callbacks::ThreadInitCallback;
use crate::event_loop::{EventLoop, LoopHandle};

struct ThreadShared {
    handle: Mutex<Option<LoopHandle>>,
    ready: Condvar,
}

/// Owns a worker thread whose entire life is one [`EventLoop::run`] call.
///
/// Dropping the thread object asks the loop to quit and joins the thread.
pub struct LoopThread {
    thread: Option<thread::JoinHandle<()>>,
    shared: Arc<ThreadShared>,
    init_callback: Option<ThreadInitCallback>,
    name: String,
}

impl LoopThread {
    pub fn new(init_callback: Option<ThreadInitCallback>, name: impl Into<String>) -> Self {
        Self {
            thread: None,
            shared: Arc::new(ThreadShared {
                handle: Mutex::new(None),
                ready: Condvar::new(),
            }),
            init_callback,
            name: name.into(),
        }
    }

    /// Spawn the thread and block until its loop handle is published.
    ///
    /// The loop is constructed inside the spawned thread (so thread
    /// affinity is established at birth), the init callback runs, the
    /// handle is published under the mutex/condvar pair, and only then
    /// does the loop start.
    pub fn start_loop(&mut self) -> LoopHandle {
        let shared = self.shared.clone();
        let init_callback = self.init_callback.clone();

        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let mut event_loop = EventLoop::new();
                if let Some(cb) = &init_callback {
                    cb(&event_loop.handle());
                }
                {
                    let mut guard = shared.handle.lock();
                    *guard = Some(event_loop.handle());
                    shared.ready.notify_one();
                }
                event_loop.run();
                *shared.handle.lock() = None;
            });

        match thread {
            Ok(join) => self.thread = Some(join),
            Err(e) => {
                error!(name = %self.name, error = %e, "loop thread spawn failed");
                panic!("loop thread spawn failed: {e}");
            }
        }

        let mut guard = self.shared.handle.lock();
        loop {
            if let Some(handle) = guard.as_ref() {
                return handle.clone();
            }
            self.shared.ready.wait(&mut guard);
        }
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        let handle = self.shared.handle.lock().clone();
        if let Some(handle) = handle {
            handle.quit();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
