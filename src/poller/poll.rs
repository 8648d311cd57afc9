//! poll(2) backend.
//!
//! Kept behaviorally identical to the epoll backend; useful where epoll
//! is unavailable or for diagnosing epoll-specific suspicions. Selected
//! by setting `MUXIO_USE_POLL` in the environment.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use tracing::{error, trace};

use crate::channel::{Channel, EventMask, PollerState};
use crate::poller::Poller;

/// poll-based readiness multiplexer.
pub struct PollPoller {
    channels: AHashMap<RawFd, Arc<Channel>>,
    pollfds: Vec<libc::pollfd>,
    /// fd -> index into `pollfds` for channels in the Added state.
    positions: AHashMap<RawFd, usize>,
}

fn to_poll_events(mask: EventMask) -> libc::c_short {
    let mut events = 0;
    if mask.contains(EventMask::READABLE) {
        events |= libc::POLLIN;
    }
    if mask.contains(EventMask::PRIORITY) {
        events |= libc::POLLPRI;
    }
    if mask.contains(EventMask::WRITABLE) {
        events |= libc::POLLOUT;
    }
    events
}

fn from_poll_revents(revents: libc::c_short) -> EventMask {
    let mut mask = EventMask::empty();
    if revents & libc::POLLIN != 0 {
        mask |= EventMask::READABLE;
    }
    if revents & libc::POLLPRI != 0 {
        mask |= EventMask::PRIORITY;
    }
    if revents & libc::POLLOUT != 0 {
        mask |= EventMask::WRITABLE;
    }
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        mask |= EventMask::ERROR;
    }
    if revents & libc::POLLHUP != 0 {
        mask |= EventMask::HANGUP;
    }
    if revents & libc::POLLRDHUP != 0 {
        mask |= EventMask::PEER_CLOSED;
    }
    mask
}

impl PollPoller {
    pub fn new() -> PollPoller {
        PollPoller {
            channels: AHashMap::new(),
            pollfds: Vec::new(),
            positions: AHashMap::new(),
        }
    }

    fn push_pollfd(&mut self, channel: &Channel) {
        self.pollfds.push(libc::pollfd {
            fd: channel.fd(),
            events: to_poll_events(channel.interest()),
            revents: 0,
        });
        self.positions.insert(channel.fd(), self.pollfds.len() - 1);
    }

    fn drop_pollfd(&mut self, fd: RawFd) {
        if let Some(pos) = self.positions.remove(&fd) {
            self.pollfds.swap_remove(pos);
            if pos < self.pollfds.len() {
                let moved = self.pollfds[pos].fd;
                self.positions.insert(moved, pos);
            }
        }
    }
}

impl Default for PollPoller {
    fn default() -> PollPoller {
        PollPoller::new()
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Instant {
        let num_events = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let saved = io::Error::last_os_error();
        let now = Instant::now();

        if num_events > 0 {
            let mut remaining = num_events as usize;
            for pollfd in &self.pollfds {
                if remaining == 0 {
                    break;
                }
                if pollfd.revents == 0 {
                    continue;
                }
                remaining -= 1;
                if let Some(channel) = self.channels.get(&pollfd.fd) {
                    channel.set_revents(from_poll_revents(pollfd.revents));
                    active.push(channel.clone());
                }
            }
        } else if num_events == 0 {
            trace!("poll timed out");
        } else if saved.raw_os_error() != Some(libc::EINTR) {
            error!("poll failed: {}", saved);
        }

        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let state = channel.poller_state();
        match state {
            PollerState::New | PollerState::Deleted => {
                if state == PollerState::New {
                    self.channels.insert(channel.fd(), channel.clone());
                }
                channel.set_poller_state(PollerState::Added);
                self.push_pollfd(channel);
            }
            PollerState::Added => {
                if channel.is_none_interest() {
                    self.drop_pollfd(channel.fd());
                    channel.set_poller_state(PollerState::Deleted);
                } else if let Some(&pos) = self.positions.get(&channel.fd()) {
                    self.pollfds[pos].events = to_poll_events(channel.interest());
                }
            }
        }
    }

    fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        self.channels.remove(&fd);
        if channel.poller_state() == PollerState::Added {
            self.drop_pollfd(fd);
        }
        channel.set_poller_state(PollerState::New);
    }

    fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|registered| Arc::ptr_eq(registered, channel))
    }
}
