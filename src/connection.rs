//! Per-connection state machine with buffered I/O.
//!
//! A connection is shared between the server's connection map and any
//! in-flight callbacks; its channel, buffers, and state are mutated
//! only on its owning subloop's thread. Teardown is protected by the
//! channel tie: dispatch upgrades a weak back-reference so a callback
//! in flight during a concurrent close still sees a live connection.

use std::any::Any;
use std::io;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{error, info, trace};

use crate::addr::InetAddr;
use crate::buffer::Buffer;
use crate::callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    TcpConnectionRef, WriteCompleteCallback,
};
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::socket::Socket;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Connection lifecycle states, traversed strictly in order
/// `Connecting -> Connected -> (Disconnecting) -> Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> ConnState {
        match value {
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            3 => ConnState::Disconnected,
            _ => ConnState::Connecting,
        }
    }
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

/// A single accepted TCP connection.
pub struct TcpConnection {
    event_loop: Arc<EventLoop>,
    self_weak: Weak<TcpConnection>,
    name: String,
    state: AtomicU8,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: InetAddr,
    peer_addr: InetAddr,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    callbacks: Mutex<Callbacks>,
}

impl TcpConnection {
    pub(crate) fn new(
        event_loop: Arc<EventLoop>,
        name: String,
        socket: Socket,
        local_addr: InetAddr,
        peer_addr: InetAddr,
    ) -> TcpConnectionRef {
        socket.set_keep_alive(true);
        let fd = socket.fd();

        let conn = Arc::new_cyclic(|self_weak: &Weak<TcpConnection>| {
            let channel = Channel::new(&event_loop, fd);

            let weak = self_weak.clone();
            channel.set_read_callback(Arc::new(move |receive_time| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read(receive_time);
                }
            }));
            let weak = self_weak.clone();
            channel.set_write_callback(Arc::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            }));
            let weak = self_weak.clone();
            channel.set_close_callback(Arc::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            }));
            let weak = self_weak.clone();
            channel.set_error_callback(Arc::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_error();
                }
            }));

            TcpConnection {
                event_loop,
                self_weak: self_weak.clone(),
                name,
                state: AtomicU8::new(ConnState::Connecting as u8),
                socket,
                channel,
                local_addr,
                peer_addr,
                input_buffer: Mutex::new(Buffer::new()),
                output_buffer: Mutex::new(Buffer::new()),
                high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
                callbacks: Mutex::new(Callbacks::default()),
            }
        });

        info!("connection {} created, fd={}", conn.name, fd);
        conn
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn local_addr(&self) -> &InetAddr {
        &self.local_addr
    }

    #[inline]
    pub fn peer_addr(&self) -> &InetAddr {
        &self.peer_addr
    }

    #[inline]
    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn as_arc(&self) -> TcpConnectionRef {
        self.self_weak.upgrade().expect("connection handle alive")
    }

    pub(crate) fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().connection = Some(cb);
    }

    pub(crate) fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().message = Some(cb);
    }

    pub(crate) fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().write_complete = Some(cb);
    }

    pub(crate) fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        self.callbacks.lock().high_water_mark = Some(cb);
        self.high_water_mark.store(mark, Ordering::Relaxed);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        self.callbacks.lock().close = Some(cb);
    }

    /// Send bytes to the peer.
    ///
    /// On the owning loop thread the data is written (or queued)
    /// directly. From any other thread the payload is copied into an
    /// owned buffer first; the caller's storage need not outlive the
    /// cross-thread hop. Not connected: the send is dropped.
    pub fn send(&self, data: &[u8]) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let owned = data.to_vec();
            let conn = self.as_arc();
            self.event_loop
                .run_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.event_loop.assert_in_loop_thread();

        if self.state() == ConnState::Disconnected {
            error!("connection {} disconnected, giving up writing", self.name);
            return;
        }

        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault_error = false;

        let mut output = self.output_buffer.lock();

        // Try a direct write when nothing is queued ahead of this data.
        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            let n = unsafe {
                libc::write(
                    self.channel.fd(),
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                )
            };
            if n >= 0 {
                nwrote = n as usize;
                remaining -= nwrote;
                if remaining == 0 {
                    let cb = self.callbacks.lock().write_complete.clone();
                    if let Some(cb) = cb {
                        let conn = self.as_arc();
                        self.event_loop.queue_in_loop(move || cb(&conn));
                    }
                }
            } else {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    error!("connection {} write failed: {}", self.name, err);
                    if matches!(err.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) {
                        fault_error = true;
                    }
                }
            }
        }

        if !fault_error && remaining > 0 {
            let old_len = output.readable_bytes();
            let high_water_mark = self.high_water_mark.load(Ordering::Relaxed);
            if old_len + remaining >= high_water_mark && old_len < high_water_mark {
                let cb = self.callbacks.lock().high_water_mark.clone();
                if let Some(cb) = cb {
                    let conn = self.as_arc();
                    let outstanding = old_len + remaining;
                    self.event_loop.queue_in_loop(move || cb(&conn, outstanding));
                }
            }
            output.append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Half-close towards the peer once the output buffer drains.
    pub fn shutdown(&self) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            let conn = self.as_arc();
            self.event_loop.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        // Still writing: handle_write's drain path finishes the shutdown.
        if !self.channel.is_writing() {
            self.socket.shutdown_write();
        }
    }

    /// First legal transition; runs on the owning subloop right after
    /// the server hands the connection over.
    pub(crate) fn connect_established(&self) {
        self.event_loop.assert_in_loop_thread();
        self.set_state(ConnState::Connected);

        let owner: Arc<dyn Any + Send + Sync> = self.as_arc();
        self.channel.tie(&owner);
        self.channel.enable_reading();

        let cb = self.callbacks.lock().connection.clone();
        if let Some(cb) = cb {
            cb(&self.as_arc());
        }
    }

    /// Final teardown, run exactly once per connection on its subloop
    /// after the server has dropped its map entry.
    pub(crate) fn connect_destroyed(&self) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnected);
            self.channel.disable_all();

            let cb = self.callbacks.lock().connection.clone();
            if let Some(cb) = cb {
                cb(&self.as_arc());
            }
        }
        self.channel.remove();
    }

    fn handle_read(&self, receive_time: Instant) {
        self.event_loop.assert_in_loop_thread();
        let mut input = self.input_buffer.lock();
        match input.read_fd(self.channel.fd()) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(_) => {
                let cb = self.callbacks.lock().message.clone();
                if let Some(cb) = cb {
                    cb(&self.as_arc(), &mut input, receive_time);
                }
            }
            Err(e) => {
                drop(input);
                error!("connection {} read failed: {}", self.name, e);
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!(
                "connection fd={} is down, no more writing",
                self.channel.fd()
            );
            return;
        }

        let mut output = self.output_buffer.lock();
        match output.write_fd(self.channel.fd()) {
            Ok(n) if n > 0 => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    self.channel.disable_writing();
                    drop(output);

                    let cb = self.callbacks.lock().write_complete.clone();
                    if let Some(cb) = cb {
                        let conn = self.as_arc();
                        self.event_loop.queue_in_loop(move || cb(&conn));
                    }
                    if self.state() == ConnState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("connection {} write failed: {}", self.name, e);
            }
        }
    }

    fn handle_close(&self) {
        self.event_loop.assert_in_loop_thread();
        info!(
            "connection {} closed, fd={} state={:?}",
            self.name,
            self.channel.fd(),
            self.state()
        );
        self.set_state(ConnState::Disconnected);
        self.channel.disable_all();

        // Hold a strong handle across both callbacks; the close callback
        // unlinks the map entry, which may be the last persistent reference.
        let conn = self.as_arc();
        let (connection_cb, close_cb) = {
            let callbacks = self.callbacks.lock();
            (callbacks.connection.clone(), callbacks.close.clone())
        };
        if let Some(cb) = connection_cb {
            cb(&conn);
        }
        if let Some(cb) = close_cb {
            cb(&conn);
        }
    }

    fn handle_error(&self) {
        let err = self.socket.take_error();
        error!("connection {} SO_ERROR = {}", self.name, err);
    }
}
