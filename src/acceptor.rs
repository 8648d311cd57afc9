//! Listening socket plus its channel on the main loop.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{error, info, trace};

use crate::addr::InetAddr;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::socket::Socket;

/// Invoked with each accepted socket and its peer address.
pub type NewConnectionCallback = Box<dyn Fn(Socket, InetAddr) + Send + Sync>;

/// Owns the non-blocking listening socket and accepts on main-loop
/// readiness. Accepted sockets are handed to the new-connection
/// callback; without one they are closed immediately.
pub struct Acceptor {
    event_loop: Arc<EventLoop>,
    accept_socket: Socket,
    accept_channel: Arc<Channel>,
    listening: AtomicBool,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// Create the listening socket, apply address options, and bind.
    ///
    /// Socket creation or bind failure is fatal; a server that cannot
    /// claim its address has nothing to recover to.
    pub fn new(event_loop: &Arc<EventLoop>, listen_addr: &InetAddr, reuse_port: bool) -> Arc<Acceptor> {
        let socket = Socket::new_nonblocking()
            .unwrap_or_else(|e| panic!("failed to create listening socket: {e}"));
        socket.set_reuse_addr(true);
        socket.set_reuse_port(reuse_port);
        socket
            .bind(listen_addr)
            .unwrap_or_else(|e| panic!("bind {} failed: {e}", listen_addr.ip_port()));

        let accept_channel = Channel::new(event_loop, socket.fd());
        let acceptor = Arc::new(Acceptor {
            event_loop: event_loop.clone(),
            accept_socket: socket,
            accept_channel,
            listening: AtomicBool::new(false),
            new_connection_cb: Mutex::new(None),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor
            .accept_channel
            .set_read_callback(Arc::new(move |_| {
                if let Some(acceptor) = weak.upgrade() {
                    acceptor.handle_read();
                }
            }));

        acceptor
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock() = Some(cb);
    }

    /// Start listening and enable read interest on the main loop.
    pub fn listen(&self) {
        self.event_loop.assert_in_loop_thread();
        self.listening.store(true, Ordering::Release);
        self.accept_socket
            .listen()
            .unwrap_or_else(|e| panic!("listen on fd {} failed: {e}", self.accept_socket.fd()));
        self.accept_channel.enable_reading();
        info!("listening on {}", self.accept_socket.local_addr().ip_port());
    }

    #[inline]
    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Local address of the listening socket.
    pub fn listen_addr(&self) -> InetAddr {
        self.accept_socket.local_addr()
    }

    fn handle_read(&self) {
        match self.accept_socket.accept() {
            Ok((socket, peer_addr)) => {
                let cb = self.new_connection_cb.lock();
                if let Some(cb) = cb.as_ref() {
                    cb(socket, peer_addr);
                }
                // No callback: `socket` drops here and the fd closes.
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!("accept would block, retrying on next readiness");
            }
            Err(e) => {
                error!("accept failed: {}", e);
                if e.raw_os_error() == Some(libc::EMFILE) {
                    // Likely real cause: fd exhaustion. Raise RLIMIT_NOFILE.
                    error!("file descriptor limit reached, rejecting connection");
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        // Channel teardown belongs to the loop thread. When the drop
        // happens elsewhere the task is queued; if the loop has already
        // exited the poller dies with it and nothing is left to unhook.
        if self.event_loop.is_in_loop_thread() {
            self.accept_channel.disable_all();
            self.accept_channel.remove();
        } else {
            let channel = self.accept_channel.clone();
            self.event_loop.queue_in_loop(move || {
                channel.disable_all();
                channel.remove();
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_accepts_a_connection() {
        let accepted = Arc::new(AtomicUsize::new(0));

        let (tx, rx) = std::sync::mpsc::channel();
        let counter = accepted.clone();
        let server = std::thread::spawn(move || {
            let event_loop = EventLoop::new();
            let addr = InetAddr::new("127.0.0.1", 0).unwrap();
            let acceptor = Acceptor::new(&event_loop, &addr, false);

            let inner_loop = event_loop.clone();
            acceptor.set_new_connection_callback(Box::new(move |socket, peer| {
                assert!(peer.port() != 0);
                assert!(socket.fd() >= 0);
                counter.fetch_add(1, Ordering::Release);
                inner_loop.quit();
            }));

            acceptor.listen();
            assert!(acceptor.listening());
            tx.send(acceptor.listen_addr().port()).unwrap();
            event_loop.run();
        });

        let port = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();

        server.join().unwrap();
        assert_eq!(accepted.load(Ordering::Acquire), 1);
    }
}
