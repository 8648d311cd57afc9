//! A thread that owns exactly one event loop.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::callbacks::ThreadInitCallback;
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::thread::Thread;

enum LoopState {
    /// Thread not started, still constructing its loop, or exited.
    Pending,
    /// Loop constructed and running (or about to run).
    Ready(Arc<EventLoop>),
    /// Loop construction panicked; the thread is unwinding.
    Failed,
}

struct Shared {
    state: Mutex<LoopState>,
    cond: Condvar,
}

/// Spawns a thread whose body constructs an [`EventLoop`], publishes it
/// back to the caller, and runs it until quit.
///
/// The loop is created on the spawned thread so the one-loop-per-thread
/// pinning holds; [`EventLoopThread::start_loop`] blocks until the loop
/// has been published or its construction has failed.
pub struct EventLoopThread {
    thread: Thread,
    shared: Arc<Shared>,
}

impl EventLoopThread {
    pub fn new(init: Option<ThreadInitCallback>, name: impl Into<String>) -> EventLoopThread {
        let shared = Arc::new(Shared {
            state: Mutex::new(LoopState::Pending),
            cond: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let thread = Thread::new(move || Self::thread_main(thread_shared, init), name);

        EventLoopThread { thread, shared }
    }

    /// Start the thread and wait for its loop to come up.
    ///
    /// Returns an error if loop construction panicked on the spawned
    /// thread (fd exhaustion, a second loop on that thread); the caller
    /// must not be left blocking on a loop that will never exist.
    pub fn start_loop(&mut self) -> Result<Arc<EventLoop>, Error> {
        self.thread.start();

        let mut state = self.shared.state.lock();
        loop {
            match &*state {
                LoopState::Ready(event_loop) => return Ok(event_loop.clone()),
                LoopState::Failed => return Err(Error::LoopStartup),
                LoopState::Pending => self.shared.cond.wait(&mut state),
            }
        }
    }

    fn thread_main(shared: Arc<Shared>, init: Option<ThreadInitCallback>) {
        let startup = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let event_loop = EventLoop::new();
            if let Some(init) = &init {
                init(&event_loop);
            }
            event_loop
        }));

        let event_loop = match startup {
            Ok(event_loop) => event_loop,
            Err(payload) => {
                // The caller is blocked on the condvar; it must observe
                // the failure before this thread finishes unwinding.
                {
                    let mut state = shared.state.lock();
                    *state = LoopState::Failed;
                    shared.cond.notify_one();
                }
                std::panic::resume_unwind(payload);
            }
        };

        {
            let mut state = shared.state.lock();
            *state = LoopState::Ready(event_loop.clone());
            shared.cond.notify_one();
        }

        event_loop.run();

        // Loop exited; the slot no longer refers to a running loop.
        *shared.state.lock() = LoopState::Pending;
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        let event_loop = match &*self.shared.state.lock() {
            LoopState::Ready(event_loop) => Some(event_loop.clone()),
            _ => None,
        };
        if let Some(event_loop) = event_loop {
            event_loop.quit();
            self.thread.join();
        }
    }
}
