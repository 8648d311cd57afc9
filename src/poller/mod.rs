//! Readiness multiplexing behind a uniform interface.
//!
//! The event loop depends only on the [`Poller`] trait so alternative
//! multiplexers can plug in. Two backends are provided: epoll (the
//! default) and poll(2), preferred when the `MUXIO_USE_POLL`
//! environment variable is set at construction time.

mod epoll;
mod poll;

use std::sync::Arc;
use std::time::Instant;

pub use epoll::EpollPoller;
pub use poll::PollPoller;

use crate::channel::Channel;

/// Readiness multiplexer: an fd -> channel registry plus a blocking wait.
///
/// Invariant: every channel whose poller state is `Added` is present in
/// the registry and registered with the multiplexer under exactly its
/// current interest mask.
pub trait Poller: Send {
    /// Block for up to `timeout_ms` and append ready channels (with
    /// their `revents` stamped) to `active`. Returns the instant
    /// captured immediately after the wait woke.
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Instant;

    /// Register a new channel or apply its changed interest mask.
    fn update_channel(&mut self, channel: &Arc<Channel>);

    /// Erase a channel from the registry, deregistering if needed.
    fn remove_channel(&mut self, channel: &Arc<Channel>);

    /// Whether exactly this channel is registered under its fd.
    fn has_channel(&self, channel: &Arc<Channel>) -> bool;
}

/// Construct the default poller backend.
pub fn new_default_poller() -> Box<dyn Poller> {
    if std::env::var_os("MUXIO_USE_POLL").is_some() {
        Box::new(PollPoller::new())
    } else {
        Box::new(EpollPoller::new())
    }
}
