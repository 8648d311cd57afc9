//! Pool of event-loop threads with round-robin dispatch.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::callbacks::ThreadInitCallback;
use crate::event_loop::EventLoop;
use crate::loop_thread::EventLoopThread;

/// N worker loops fed from a base loop.
///
/// With zero threads the pool is a pass-through: every
/// [`EventLoopThreadPool::get_next_loop`] returns the base loop and the
/// server runs single-threaded on it.
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    started: bool,
    num_threads: usize,
    next: AtomicUsize,
    threads: Vec<EventLoopThread>,
    loops: Vec<Arc<EventLoop>>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>, name: impl Into<String>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name: name.into(),
            started: false,
            num_threads: 0,
            next: AtomicUsize::new(0),
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    /// Set the number of worker loops; effective before `start`.
    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    /// Spawn the worker loops (named `"<pool>0"`, `"<pool>1"`, ...),
    /// invoking `init` on each. With zero workers, `init` runs once with
    /// the base loop instead.
    pub fn start(&mut self, init: Option<ThreadInitCallback>) {
        self.started = true;

        if self.num_threads == 0 {
            if let Some(init) = init {
                init(&self.base_loop);
            }
            return;
        }

        for i in 0..self.num_threads {
            let name = format!("{}{}", self.name, i);
            debug!("starting pool loop {}", name);
            let mut thread = EventLoopThread::new(init.clone(), name.clone());
            // A pool missing workers is a configuration bug with nothing
            // to recover to.
            let event_loop = thread
                .start_loop()
                .unwrap_or_else(|e| panic!("pool loop {name} failed to start: {e}"));
            self.loops.push(event_loop);
            self.threads.push(thread);
        }
    }

    /// Round-robin pick of the next worker loop; the base loop when the
    /// pool is empty.
    pub fn get_next_loop(&self) -> Arc<EventLoop> {
        if self.loops.is_empty() {
            self.base_loop.clone()
        } else {
            let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
            self.loops[index].clone()
        }
    }

    /// All worker loops, or just the base loop when the pool is empty.
    pub fn get_all_loops(&self) -> Vec<Arc<EventLoop>> {
        if self.loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            self.loops.clone()
        }
    }

    #[inline]
    pub fn started(&self) -> bool {
        self.started
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}
