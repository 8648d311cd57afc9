//! Shared callback type aliases for the user-facing API.
//!
//! All callbacks receive the connection by shared handle and run on the
//! connection's owning loop thread; long work must be offloaded by the
//! user.

use std::sync::Arc;
use std::time::Instant;

use crate::buffer::Buffer;
use crate::connection::TcpConnection;
use crate::event_loop::EventLoop;

/// Shared handle to a connection, valid for the callback's duration and
/// clonable to extend its lifetime.
pub type TcpConnectionRef = Arc<TcpConnection>;

/// Invoked on both establishment and teardown; distinguish with
/// [`TcpConnection::is_connected`].
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

/// Invoked with the input buffer and the poll return time; the receiver
/// takes bytes off the buffer, residue is kept for the next invocation.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionRef, &mut Buffer, Instant) + Send + Sync>;

/// Invoked once the output buffer fully drains.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

/// Invoked at most once per upward crossing of the high-water mark,
/// with the outstanding byte count.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionRef, usize) + Send + Sync>;

/// Teardown hook consumed by the server to unlink a closed connection.
pub type CloseCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

/// Invoked once per pool loop at startup (and once with the base loop
/// when the pool is empty).
pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;
