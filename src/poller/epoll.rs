//! epoll(7) backend.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use tracing::{error, trace};

use crate::channel::{Channel, EventMask, PollerState};
use crate::poller::Poller;

/// Initial capacity of the event array handed to epoll_wait; doubled
/// whenever a wait fills it.
const INIT_EVENT_LIST_SIZE: usize = 16;

/// epoll-based readiness multiplexer.
pub struct EpollPoller {
    epoll_fd: RawFd,
    channels: AHashMap<RawFd, Arc<Channel>>,
    events: Vec<libc::epoll_event>,
}

impl EpollPoller {
    /// Create the epoll instance. Failure is a configuration bug
    /// unrecoverable at runtime.
    pub fn new() -> EpollPoller {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            panic!("epoll_create1 failed: {}", io::Error::last_os_error());
        }
        EpollPoller {
            epoll_fd,
            channels: AHashMap::new(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INIT_EVENT_LIST_SIZE],
        }
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) {
        let fd = channel.fd();
        let mut event = libc::epoll_event {
            events: channel.interest().bits(),
            u64: fd as u64,
        };

        if unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) } < 0 {
            let err = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                error!("epoll_ctl del fd={} failed: {}", fd, err);
            } else {
                panic!("epoll_ctl add/mod fd={fd} failed: {err}");
            }
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Instant {
        trace!("epoll wait, fd total count {}", self.channels.len());

        let num_events = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        // errno can be clobbered by the timestamp query below; capture first.
        let saved = io::Error::last_os_error();
        let now = Instant::now();

        if num_events > 0 {
            trace!("{} events happened", num_events);
            for i in 0..num_events as usize {
                let raw = self.events[i];
                let fd = raw.u64 as RawFd;
                if let Some(channel) = self.channels.get(&fd) {
                    channel.set_revents(EventMask::from_bits_truncate(raw.events));
                    active.push(channel.clone());
                }
            }
            if num_events as usize == self.events.len() {
                self.events.resize(
                    self.events.len() * 2,
                    libc::epoll_event { events: 0, u64: 0 },
                );
            }
        } else if num_events == 0 {
            trace!("epoll wait timed out");
        } else if saved.raw_os_error() != Some(libc::EINTR) {
            error!("epoll_wait failed: {}", saved);
        }

        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let state = channel.poller_state();
        trace!(
            "update channel fd={} interest={:?} state={:?}",
            channel.fd(),
            channel.interest(),
            state
        );

        match state {
            PollerState::New | PollerState::Deleted => {
                if state == PollerState::New {
                    self.channels.insert(channel.fd(), channel.clone());
                }
                channel.set_poller_state(PollerState::Added);
                self.ctl(libc::EPOLL_CTL_ADD, channel);
            }
            PollerState::Added => {
                if channel.is_none_interest() {
                    self.ctl(libc::EPOLL_CTL_DEL, channel);
                    channel.set_poller_state(PollerState::Deleted);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        self.channels.remove(&fd);
        trace!("remove channel fd={}", fd);

        if channel.poller_state() == PollerState::Added {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_poller_state(PollerState::New);
    }

    fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|registered| Arc::ptr_eq(registered, channel))
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    fn eventfd() -> RawFd {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        assert!(fd >= 0);
        fd
    }

    fn write_one(fd: RawFd) {
        let one: u64 = 1;
        let n = unsafe { libc::write(fd, &one as *const u64 as *const libc::c_void, 8) };
        assert_eq!(n, 8);
    }

    #[test]
    fn test_add_poll_remove() {
        let mut poller = EpollPoller::new();
        let fd = eventfd();
        let channel = Channel::from_weak(Weak::new(), fd);

        // The loop reference is dead, so enable_reading only flips the
        // mask; registration is driven by hand here.
        channel.enable_reading();
        poller.update_channel(&channel);
        assert_eq!(channel.poller_state(), PollerState::Added);
        assert!(poller.has_channel(&channel));

        write_one(fd);
        let mut active = Vec::new();
        poller.poll(100, &mut active);
        assert_eq!(active.len(), 1);
        assert!(active[0].revents().contains(EventMask::READABLE));

        poller.remove_channel(&channel);
        assert_eq!(channel.poller_state(), PollerState::New);
        assert!(!poller.has_channel(&channel));

        unsafe {
            libc::close(fd);
        }
    }

    #[test]
    fn test_empty_interest_deregisters() {
        let mut poller = EpollPoller::new();
        let fd = eventfd();
        let channel = Channel::from_weak(Weak::new(), fd);

        channel.enable_reading();
        poller.update_channel(&channel);
        assert_eq!(channel.poller_state(), PollerState::Added);

        channel.disable_all();
        poller.update_channel(&channel);
        assert_eq!(channel.poller_state(), PollerState::Deleted);
        // Still in the registry; a pending write must not surface it.
        assert!(poller.has_channel(&channel));

        write_one(fd);
        let mut active = Vec::new();
        poller.poll(10, &mut active);
        assert!(active.is_empty());

        // Re-adding from Deleted re-registers.
        channel.enable_reading();
        poller.update_channel(&channel);
        assert_eq!(channel.poller_state(), PollerState::Added);

        let mut active = Vec::new();
        poller.poll(100, &mut active);
        assert_eq!(active.len(), 1);

        unsafe {
            libc::close(fd);
        }
    }

    #[test]
    fn test_timeout_returns_empty() {
        let mut poller = EpollPoller::new();
        let mut active = Vec::new();
        poller.poll(10, &mut active);
        assert!(active.is_empty());
    }
}
