//! muxio - multi-threaded non-blocking TCP server library.
//!
//! This crate implements the one-loop-per-thread reactor pattern: each
//! OS thread owns exactly one [`EventLoop`] (a readiness multiplexer, a
//! cross-thread wakeup channel, and a queue of deferred tasks), the
//! base loop accepts connections, and each accepted connection is
//! pinned to one pool loop for its whole life. Server authors supply
//! callbacks; the library owns socket lifecycle, readiness polling,
//! thread dispatch, buffered I/O, and graceful teardown.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use muxio::{EventLoop, InetAddr, PortOption, TcpServer};
//!
//! let event_loop = EventLoop::new();
//! let addr = InetAddr::new("127.0.0.1", 9981)?;
//! let server = TcpServer::new(&event_loop, &addr, "echo", PortOption::NoReusePort);
//!
//! server.set_thread_num(2);
//! server.set_connection_callback(Arc::new(|conn| {
//!     if conn.is_connected() {
//!         println!("up: {}", conn.peer_addr());
//!     } else {
//!         println!("down: {}", conn.peer_addr());
//!     }
//! }));
//! server.set_message_callback(Arc::new(|conn, buffer, _receive_time| {
//!     let msg = buffer.retrieve_all_as_bytes();
//!     conn.send(&msg);
//! }));
//!
//! server.start();
//! event_loop.run();
//! ```
//!
//! # Threading model
//!
//! Every structure reachable from a loop (channels, pollers, buffers,
//! connection state) is mutated only on that loop's thread. The sole
//! cross-thread entry points are [`EventLoop::run_in_loop`],
//! [`EventLoop::queue_in_loop`], [`EventLoop::wakeup`] and
//! [`EventLoop::quit`]; everything else is precondition-checked against
//! the owning thread. User callbacks always run on the connection's
//! loop thread and must not block it.
//!
//! # Backend selection
//!
//! The readiness multiplexer defaults to epoll. Setting the
//! `MUXIO_USE_POLL` environment variable at loop construction selects
//! the poll(2) backend instead.

mod acceptor;
mod addr;
mod buffer;
mod callbacks;
mod channel;
mod connection;
mod error;
mod event_loop;
mod loop_thread;
mod pool;
mod server;
mod socket;
mod thread;

pub mod logging;
pub mod poller;

pub use acceptor::{Acceptor, NewConnectionCallback};
pub use addr::InetAddr;
pub use buffer::Buffer;
pub use callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnectionRef,
    ThreadInitCallback, WriteCompleteCallback,
};
pub use channel::{Channel, EventMask, PollerState};
pub use connection::{ConnState, TcpConnection};
pub use error::Error;
pub use event_loop::EventLoop;
pub use loop_thread::EventLoopThread;
pub use pool::EventLoopThreadPool;
pub use server::{PortOption, TcpServer};
pub use socket::Socket;
pub use thread::Thread;
