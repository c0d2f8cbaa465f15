//! Pool of worker loops, handed out round-robin.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::callbacks::ThreadInitCallback;
use crate::event_loop::LoopHandle;
use crate::loop_thread::LoopThread;

/// Worker-loop pool over a base loop.
///
/// With zero workers (the default) the base loop serves I/O itself;
/// otherwise connections are spread across the workers by a relaxed
/// round-robin counter, which approximates load balance at zero
/// coordination cost.
pub struct LoopPool {
    base_loop: LoopHandle,
    name: String,
    started: AtomicBool,
    num_threads: usize,
    next: AtomicUsize,
    threads: Vec<LoopThread>,
    loops: Vec<LoopHandle>,
}

impl LoopPool {
    pub fn new(base_loop: LoopHandle, name: impl Into<String>) -> Self {
        Self {
            base_loop,
            name: name.into(),
            started: AtomicBool::new(false),
            num_threads: 0,
            next: AtomicUsize::new(0),
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    /// Spawn the worker threads. With zero workers the init callback still
    /// runs, against the base loop.
    pub fn start(&mut self, init_callback: Option<ThreadInitCallback>) {
        self.started.store(true, Ordering::Release);

        self.threads.reserve(self.num_threads);
        self.loops.reserve(self.num_threads);
        for i in 0..self.num_threads {
            let name = format!("{}-{}", self.name, i);
            let mut thread = LoopThread::new(init_callback.clone(), name);
            let handle = thread.start_loop();
            self.threads.push(thread);
            self.loops.push(handle);
        }

        if self.num_threads == 0 {
            if let Some(cb) = &init_callback {
                cb(&self.base_loop);
            }
        }
    }

    /// Next loop in round-robin order; the base loop when the pool is empty.
    pub fn get_next_loop(&self) -> LoopHandle {
        if self.loops.is_empty() {
            return self.base_loop.clone();
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[i].clone()
    }

    pub fn all_loops(&self) -> Vec<LoopHandle> {
        if self.loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            self.loops.clone()
        }
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
