//! Named OS thread with handshake startup.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;

use tracing::{error, trace};

static NUM_CREATED: AtomicI32 = AtomicI32::new(0);

/// An OS thread with a stable name and a startup handshake: `start`
/// returns only after the spawned thread has published its kernel tid.
///
/// Threads left running at drop are detached.
pub struct Thread {
    func: Option<Box<dyn FnOnce() + Send + 'static>>,
    handle: Option<JoinHandle<()>>,
    name: String,
    tid: libc::pid_t,
    started: bool,
    joined: bool,
}

impl Thread {
    /// Create a thread that will run `func` once started. An empty name
    /// gets a monotonically assigned default (`Thread1`, `Thread2`, ...).
    pub fn new<F>(func: F, name: impl Into<String>) -> Thread
    where
        F: FnOnce() + Send + 'static,
    {
        let num = NUM_CREATED.fetch_add(1, Ordering::Relaxed) + 1;
        let mut name = name.into();
        if name.is_empty() {
            name = format!("Thread{num}");
        }
        Thread {
            func: Some(Box::new(func)),
            handle: None,
            name,
            tid: 0,
            started: false,
            joined: false,
        }
    }

    /// Spawn the thread. Returns once the thread has recorded its
    /// kernel tid, so [`Thread::tid`] is valid afterwards. Idempotent.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        let func = self.func.take().expect("thread function already consumed");
        let (tx, rx) = mpsc::channel();

        let handle = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let tid = unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t };
                let _ = tx.send(tid);
                func();
            })
            .expect("failed to spawn thread");

        self.handle = Some(handle);
        self.tid = rx.recv().unwrap_or(0);
    }

    /// Block until the thread function returns. A panicked thread is
    /// reported rather than silently absorbed.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("thread {} panicked", self.name);
            }
            self.joined = true;
        }
    }

    #[inline]
    pub fn started(&self) -> bool {
        self.started
    }

    /// Kernel tid of the spawned thread; 0 before `start`.
    #[inline]
    pub fn tid(&self) -> libc::pid_t {
        self.tid
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total threads constructed so far.
    pub fn num_created() -> i32 {
        NUM_CREATED.load(Ordering::Relaxed)
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if self.started && !self.joined {
            trace!("thread {} detached at drop", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_start_publishes_tid() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let mut thread = Thread::new(move || flag.store(true, Ordering::Release), "worker-test");

        assert!(!thread.started());
        assert_eq!(thread.tid(), 0);

        thread.start();
        assert!(thread.started());
        assert!(thread.tid() > 0);

        thread.join();
        assert!(ran.load(Ordering::Acquire));
    }

    #[test]
    fn test_default_name_assigned() {
        let thread = Thread::new(|| {}, "");
        assert!(thread.name().starts_with("Thread"));
        assert!(Thread::num_created() >= 1);
    }

    #[test]
    fn test_start_is_idempotent() {
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = counter.clone();
        let mut thread = Thread::new(move || { c.fetch_add(1, Ordering::Release); }, "once");
        thread.start();
        thread.start();
        thread.join();
        assert_eq!(counter.load(Ordering::Acquire), 1);
    }
}
