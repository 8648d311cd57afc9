//! Registration of interest in readiness events on a single fd.
//!
//! A `Channel` pairs a file descriptor (not owned) with the interest
//! mask registered in its loop's poller, the most recent readiness mask,
//! and the typed callbacks readiness dispatches to. Every channel has
//! exactly one structural owner (a connection, the acceptor, or the
//! event loop's own wakeup fd) and is mutated only on its owning loop's
//! thread.

use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::trace;

use crate::event_loop::EventLoop;

bitflags::bitflags! {
    /// Readiness/interest bits, stored in epoll's native encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u32 {
        const READABLE = libc::EPOLLIN as u32;
        const PRIORITY = libc::EPOLLPRI as u32;
        const WRITABLE = libc::EPOLLOUT as u32;
        const ERROR = libc::EPOLLERR as u32;
        const HANGUP = libc::EPOLLHUP as u32;
        const PEER_CLOSED = libc::EPOLLRDHUP as u32;
    }
}

impl EventMask {
    /// Interest bits toggled by enable/disable reading.
    pub const READ_INTEREST: EventMask = EventMask::READABLE.union(EventMask::PRIORITY);
    /// Interest bits toggled by enable/disable writing.
    pub const WRITE_INTEREST: EventMask = EventMask::WRITABLE;
}

/// Registration status of a channel within its poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PollerState {
    /// Never added, or fully removed from the poller's registry.
    New = 0,
    /// Present in the registry and registered with the multiplexer.
    Added = 1,
    /// Present in the registry but deregistered (empty interest).
    Deleted = 2,
}

impl PollerState {
    fn from_u8(value: u8) -> PollerState {
        match value {
            1 => PollerState::Added,
            2 => PollerState::Deleted,
            _ => PollerState::New,
        }
    }
}

/// Callback invoked for readable events, with the poll return time.
pub type ReadEventCallback = Arc<dyn Fn(Instant) + Send + Sync>;
/// Callback invoked for write/close/error events.
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Handlers {
    read: Option<ReadEventCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

/// A single fd's interest registration and readiness dispatcher.
pub struct Channel {
    event_loop: Weak<EventLoop>,
    self_weak: Weak<Channel>,
    fd: RawFd,
    interest: AtomicU32,
    revents: AtomicU32,
    state: AtomicU8,
    handlers: Mutex<Handlers>,
    /// Weak back-reference to the external owner; upgraded at the top of
    /// `handle_event` so the owner outlives callback dispatch.
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
}

impl Channel {
    /// Create a channel for `fd` owned by `event_loop`.
    pub fn new(event_loop: &Arc<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Channel::from_weak(Arc::downgrade(event_loop), fd)
    }

    pub(crate) fn from_weak(event_loop: Weak<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|self_weak| Channel {
            event_loop,
            self_weak: self_weak.clone(),
            fd,
            interest: AtomicU32::new(0),
            revents: AtomicU32::new(0),
            state: AtomicU8::new(PollerState::New as u8),
            handlers: Mutex::new(Handlers::default()),
            tie: Mutex::new(None),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn interest(&self) -> EventMask {
        EventMask::from_bits_truncate(self.interest.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn revents(&self) -> EventMask {
        EventMask::from_bits_truncate(self.revents.load(Ordering::Relaxed))
    }

    /// Stamp the most recent readiness, called by the poller on wake.
    pub(crate) fn set_revents(&self, revents: EventMask) {
        self.revents.store(revents.bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn is_none_interest(&self) -> bool {
        self.interest().is_empty()
    }

    #[inline]
    pub fn is_reading(&self) -> bool {
        self.interest().intersects(EventMask::READ_INTEREST)
    }

    #[inline]
    pub fn is_writing(&self) -> bool {
        self.interest().intersects(EventMask::WRITE_INTEREST)
    }

    pub(crate) fn poller_state(&self) -> PollerState {
        PollerState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_poller_state(&self, state: PollerState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn set_read_callback(&self, cb: ReadEventCallback) {
        self.handlers.lock().read = Some(cb);
    }

    pub fn set_write_callback(&self, cb: EventCallback) {
        self.handlers.lock().write = Some(cb);
    }

    pub fn set_close_callback(&self, cb: EventCallback) {
        self.handlers.lock().close = Some(cb);
    }

    pub fn set_error_callback(&self, cb: EventCallback) {
        self.handlers.lock().error = Some(cb);
    }

    /// Tie this channel's dispatch to an external owner. While an event
    /// is being handled the owner is kept alive by an upgraded strong
    /// reference; once the owner is gone events are silently dropped.
    pub fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        *self.tie.lock() = Some(Arc::downgrade(owner));
    }

    pub fn enable_reading(&self) {
        self.interest
            .fetch_or(EventMask::READ_INTEREST.bits(), Ordering::Relaxed);
        self.update();
    }

    pub fn disable_reading(&self) {
        self.interest
            .fetch_and(!EventMask::READ_INTEREST.bits(), Ordering::Relaxed);
        self.update();
    }

    pub fn enable_writing(&self) {
        self.interest
            .fetch_or(EventMask::WRITE_INTEREST.bits(), Ordering::Relaxed);
        self.update();
    }

    pub fn disable_writing(&self) {
        self.interest
            .fetch_and(!EventMask::WRITE_INTEREST.bits(), Ordering::Relaxed);
        self.update();
    }

    pub fn disable_all(&self) {
        self.interest.store(0, Ordering::Relaxed);
        self.update();
    }

    fn update(&self) {
        if let (Some(event_loop), Some(me)) = (self.event_loop.upgrade(), self.self_weak.upgrade())
        {
            event_loop.update_channel(&me);
        }
    }

    /// Remove this channel from its loop's poller.
    pub fn remove(&self) {
        if let (Some(event_loop), Some(me)) = (self.event_loop.upgrade(), self.self_weak.upgrade())
        {
            event_loop.remove_channel(&me);
        }
    }

    /// Dispatch the most recent readiness to the registered callbacks.
    ///
    /// Invocation order is close, error, read, write. Close fires only
    /// when the hangup bit is set with the read bit clear, so a
    /// half-closed peer's final bytes are still delivered through the
    /// read branch first.
    pub fn handle_event(&self, receive_time: Instant) {
        let tied = self.tie.lock().clone();
        let _guard: Option<Arc<dyn Any + Send + Sync>> = match tied {
            Some(weak) => match weak.upgrade() {
                Some(guard) => Some(guard),
                None => {
                    trace!("channel fd={} owner gone, dropping event", self.fd);
                    return;
                }
            },
            None => None,
        };

        let revents = self.revents();
        trace!("channel fd={} handling revents={:?}", self.fd, revents);

        if revents.contains(EventMask::HANGUP) && !revents.contains(EventMask::READABLE) {
            let cb = self.handlers.lock().close.clone();
            if let Some(cb) = cb {
                cb();
            }
        }

        if revents.contains(EventMask::ERROR) {
            let cb = self.handlers.lock().error.clone();
            if let Some(cb) = cb {
                cb();
            }
        }

        if revents.intersects(EventMask::READABLE | EventMask::PRIORITY) {
            let cb = self.handlers.lock().read.clone();
            if let Some(cb) = cb {
                cb(receive_time);
            }
        }

        if revents.contains(EventMask::WRITABLE) {
            let cb = self.handlers.lock().write.clone();
            if let Some(cb) = cb {
                cb();
            }
        }
    }
}
