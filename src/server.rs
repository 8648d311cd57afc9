//! User-facing TCP server: acceptor + loop pool + connection map.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use parking_lot::Mutex;
use tracing::info;

use crate::acceptor::Acceptor;
use crate::addr::InetAddr;
use crate::callbacks::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnectionRef,
    ThreadInitCallback, WriteCompleteCallback,
};
use crate::connection::TcpConnection;
use crate::event_loop::EventLoop;
use crate::pool::EventLoopThreadPool;
use crate::socket::Socket;

/// Whether the listening socket sets SO_REUSEPORT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortOption {
    NoReusePort,
    ReusePort,
}

#[derive(Default)]
struct ServerCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<(HighWaterMarkCallback, usize)>,
    thread_init: Option<ThreadInitCallback>,
}

/// A multi-threaded TCP server.
///
/// The base loop runs the acceptor; accepted connections are handed to
/// pool loops round-robin. Install callbacks before [`TcpServer::start`];
/// they are copied onto each new connection.
pub struct TcpServer {
    event_loop: Arc<EventLoop>,
    self_weak: Weak<TcpServer>,
    ip_port: String,
    name: String,
    acceptor: Arc<Acceptor>,
    pool: Mutex<EventLoopThreadPool>,
    connections: Mutex<AHashMap<String, TcpConnectionRef>>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    callbacks: Mutex<ServerCallbacks>,
}

impl TcpServer {
    /// Create a server listening on `listen_addr`, accepting on
    /// `event_loop` (the base loop).
    pub fn new(
        event_loop: &Arc<EventLoop>,
        listen_addr: &InetAddr,
        name: impl Into<String>,
        option: PortOption,
    ) -> Arc<TcpServer> {
        let name = name.into();
        let acceptor = Acceptor::new(event_loop, listen_addr, option == PortOption::ReusePort);

        let server = Arc::new_cyclic(|self_weak| TcpServer {
            event_loop: event_loop.clone(),
            self_weak: self_weak.clone(),
            ip_port: listen_addr.ip_port(),
            name: name.clone(),
            acceptor,
            pool: Mutex::new(EventLoopThreadPool::new(event_loop.clone(), name.clone())),
            connections: Mutex::new(AHashMap::new()),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            callbacks: Mutex::new(ServerCallbacks::default()),
        });

        let weak = server.self_weak.clone();
        server
            .acceptor
            .set_new_connection_callback(Box::new(move |socket, peer_addr| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(socket, peer_addr);
                }
            }));

        server
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    /// Local address of the listening socket (useful with port 0).
    pub fn listen_addr(&self) -> InetAddr {
        self.acceptor.listen_addr()
    }

    /// Live entries in the connection map.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Number of pool loops; 0 runs everything on the base loop.
    pub fn set_thread_num(&self, num_threads: usize) {
        self.pool.lock().set_thread_num(num_threads);
    }

    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        self.callbacks.lock().thread_init = Some(cb);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().connection = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().message = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().write_complete = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        self.callbacks.lock().high_water_mark = Some((cb, mark));
    }

    /// Start the pool and begin listening. Idempotent: later calls are
    /// no-ops.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let init = self.callbacks.lock().thread_init.clone();
        self.pool.lock().start(init);

        let acceptor = self.acceptor.clone();
        self.event_loop.run_in_loop(move || acceptor.listen());
    }

    /// Runs on the base loop for every accepted socket.
    fn new_connection(&self, socket: Socket, peer_addr: InetAddr) {
        self.event_loop.assert_in_loop_thread();

        let io_loop = self.pool.lock().get_next_loop();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, conn_id);

        info!(
            "server {} new connection [{}] from {}",
            self.name,
            conn_name,
            peer_addr.ip_port()
        );

        let local_addr = socket.local_addr();
        let conn = TcpConnection::new(io_loop.clone(), conn_name.clone(), socket, local_addr, peer_addr);

        self.connections.lock().insert(conn_name, conn.clone());

        {
            let callbacks = self.callbacks.lock();
            if let Some(cb) = callbacks.connection.clone() {
                conn.set_connection_callback(cb);
            }
            if let Some(cb) = callbacks.message.clone() {
                conn.set_message_callback(cb);
            }
            if let Some(cb) = callbacks.write_complete.clone() {
                conn.set_write_complete_callback(cb);
            }
            if let Some((cb, mark)) = callbacks.high_water_mark.clone() {
                conn.set_high_water_mark_callback(cb, mark);
            }
        }

        let weak = self.self_weak.clone();
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        let established = conn.clone();
        io_loop.run_in_loop(move || established.connect_established());
    }

    fn remove_connection(&self, conn: &TcpConnectionRef) {
        let weak = self.self_weak.clone();
        let conn = conn.clone();
        self.event_loop.run_in_loop(move || {
            if let Some(server) = weak.upgrade() {
                server.remove_connection_in_loop(&conn);
            }
        });
    }

    fn remove_connection_in_loop(&self, conn: &TcpConnectionRef) {
        self.event_loop.assert_in_loop_thread();
        info!("server {} removing connection {}", self.name, conn.name());

        self.connections.lock().remove(conn.name());

        // Queue rather than run inline: the subloop's current dispatch
        // frame must unwind (releasing the tie guard) before the final
        // teardown task drops the last reference.
        let io_loop = conn.event_loop().clone();
        let conn = conn.clone();
        io_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}
