//! Per-thread reactor: readiness polling, cross-thread wakeup, and a
//! queue of deferred tasks.
//!
//! Each OS thread owns at most one `EventLoop`; all channels, buffers
//! and connection state reachable from a loop are mutated only on its
//! thread. The only cross-thread entry points are [`EventLoop::run_in_loop`],
//! [`EventLoop::queue_in_loop`], [`EventLoop::wakeup`] and
//! [`EventLoop::quit`].

use std::cell::Cell;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::ThreadId;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{error, info, trace};

use crate::channel::Channel;
use crate::poller::{self, Poller};

/// Upper bound on a single poller wait, absent readiness or wakeups.
const POLL_TIME_MS: i32 = 10_000;

thread_local! {
    /// Guards the one-loop-per-thread invariant.
    static LOOP_IN_THIS_THREAD: Cell<bool> = const { Cell::new(false) };
}

type Task = Box<dyn FnOnce() + Send>;

/// A one-per-thread reactor loop.
pub struct EventLoop {
    looping: AtomicBool,
    quit: AtomicBool,
    calling_pending_tasks: AtomicBool,
    thread_id: ThreadId,
    /// Kernel tid of the creator, for log correlation.
    tid: libc::pid_t,
    poller: Mutex<Box<dyn Poller>>,
    wakeup_fd: RawFd,
    wakeup_channel: Arc<Channel>,
    pending_tasks: Mutex<Vec<Task>>,
    poll_return_time: Mutex<Instant>,
}

fn create_eventfd() -> RawFd {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        panic!("eventfd failed: {}", io::Error::last_os_error());
    }
    fd
}

fn current_tid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

impl EventLoop {
    /// Create the loop pinned to the calling thread.
    ///
    /// Panics if this thread already owns a live `EventLoop`; two
    /// reactors on one thread is an unrecoverable configuration bug.
    pub fn new() -> Arc<EventLoop> {
        LOOP_IN_THIS_THREAD.with(|flag| {
            if flag.get() {
                panic!("another EventLoop already exists in thread {}", current_tid());
            }
            flag.set(true);
        });

        let wakeup_fd = create_eventfd();
        let event_loop = Arc::new_cyclic(|weak| EventLoop {
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            calling_pending_tasks: AtomicBool::new(false),
            thread_id: std::thread::current().id(),
            tid: current_tid(),
            poller: Mutex::new(poller::new_default_poller()),
            wakeup_fd,
            wakeup_channel: Channel::from_weak(weak.clone(), wakeup_fd),
            pending_tasks: Mutex::new(Vec::new()),
            poll_return_time: Mutex::new(Instant::now()),
        });

        let weak = Arc::downgrade(&event_loop);
        event_loop
            .wakeup_channel
            .set_read_callback(Arc::new(move |_| {
                if let Some(event_loop) = weak.upgrade() {
                    event_loop.handle_wakeup_read();
                }
            }));
        event_loop.wakeup_channel.enable_reading();

        trace!("event loop created in thread {}", event_loop.tid);
        event_loop
    }

    /// Run the reactor until [`EventLoop::quit`] is observed.
    ///
    /// Each wake cycle dispatches all ready channels, then drains the
    /// pending task queue, so tasks posted by handlers observe every
    /// handler's state changes from the same wake.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        self.looping.store(true, Ordering::Release);
        self.quit.store(false, Ordering::Release);

        info!("event loop in thread {} start looping", self.tid);

        let mut active: Vec<Arc<Channel>> = Vec::new();
        while !self.quit.load(Ordering::Acquire) {
            active.clear();
            let poll_return = self.poller.lock().poll(POLL_TIME_MS, &mut active);
            *self.poll_return_time.lock() = poll_return;

            for channel in &active {
                channel.handle_event(poll_return);
            }
            self.do_pending_tasks();
        }

        info!("event loop in thread {} stop looping", self.tid);
        self.looping.store(false, Ordering::Release);
    }

    /// Ask the loop to exit.
    ///
    /// Not synchronous: the loop may still run one more batch of
    /// handlers and pending tasks before leaving [`EventLoop::run`].
    /// Safe to call any number of times, from any thread.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Run `task` on the loop thread: inline when already there, queued
    /// (with a wakeup) otherwise.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queue `task` for the loop thread's next drain.
    ///
    /// The wakeup write is issued when the caller is off-thread, and
    /// also whenever the loop is currently draining tasks: a task
    /// enqueued from within another task must force one more wake, or
    /// the loop could sit in the poller for the full timeout first.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending_tasks.lock().push(Box::new(task));

        if !self.is_in_loop_thread() || self.calling_pending_tasks.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Write one event to the wakeup fd, unblocking the poller wait.
    pub fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd,
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            error!("wakeup write returned {} bytes instead of 8", n);
        }
    }

    fn handle_wakeup_read(&self) {
        let mut one: u64 = 0;
        let n = unsafe {
            libc::read(
                self.wakeup_fd,
                &mut one as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n != 8 {
            error!("wakeup read returned {} bytes instead of 8", n);
        }
    }

    fn do_pending_tasks(&self) {
        self.calling_pending_tasks.store(true, Ordering::Release);

        // Swap the queue out whole so producers never block on task
        // execution and a task enqueueing another task cannot deadlock.
        let tasks = std::mem::take(&mut *self.pending_tasks.lock());
        for task in tasks {
            task();
        }

        self.calling_pending_tasks.store(false, Ordering::Release);
    }

    /// Register or re-register `channel` with this loop's poller.
    pub fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.lock().update_channel(channel);
    }

    /// Erase `channel` from this loop's poller.
    pub fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.lock().remove_channel(channel);
    }

    /// Whether exactly `channel` is registered with this loop's poller.
    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.assert_in_loop_thread();
        self.poller.lock().has_channel(channel)
    }

    /// Whether the caller is on this loop's owning thread.
    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Precondition check for loop-thread-only operations.
    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "EventLoop for thread {} used from thread {}",
            self.tid,
            current_tid()
        );
    }

    /// Instant captured when the poller last woke.
    pub fn poll_return_time(&self) -> Instant {
        *self.poll_return_time.lock()
    }

    #[inline]
    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.wakeup_channel.disable_all();
        let wakeup_channel = self.wakeup_channel.clone();
        self.poller.get_mut().remove_channel(&wakeup_channel);
        unsafe {
            libc::close(self.wakeup_fd);
        }
        if std::thread::current().id() == self.thread_id {
            LOOP_IN_THIS_THREAD.with(|flag| flag.set(false));
        }
    }
}
