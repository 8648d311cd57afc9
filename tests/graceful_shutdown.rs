//! Graceful shutdown while the output buffer is still draining.
//!
//! Shutting down immediately after a large send must keep writing until
//! the buffer empties, then half-close: the peer sees the whole payload
//! followed by EOF, and the connection leaves the map.

use std::io::Read;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use muxio::{ConnState, EventLoop, InetAddr, PortOption, TcpServer};

const PAYLOAD_LEN: usize = 8 * 1024 * 1024;

fn get_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_shutdown_drains_output_then_half_closes() {
    let port = get_available_port();

    let write_complete_count = Arc::new(AtomicUsize::new(0));
    let disconnecting_seen = Arc::new(AtomicUsize::new(0));
    let conn_down = Arc::new(AtomicUsize::new(0));

    let (tx, rx) = mpsc::channel();
    let write_complete = write_complete_count.clone();
    let disconnecting = disconnecting_seen.clone();
    let down = conn_down.clone();

    let server_thread = thread::spawn(move || {
        let event_loop = EventLoop::new();
        let addr = InetAddr::new("127.0.0.1", port).unwrap();
        let server = TcpServer::new(&event_loop, &addr, "drain", PortOption::NoReusePort);

        server.set_thread_num(1);
        let disconnecting = disconnecting.clone();
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.is_connected() {
                let payload = vec![b'd'; PAYLOAD_LEN];
                conn.send(&payload);
                conn.shutdown();
                if conn.state() == ConnState::Disconnecting {
                    disconnecting.fetch_add(1, Ordering::Release);
                }
            } else {
                down.fetch_add(1, Ordering::Release);
            }
        }));
        server.set_write_complete_callback(Arc::new(move |_conn| {
            write_complete.fetch_add(1, Ordering::Release);
        }));

        server.start();
        tx.send((event_loop.clone(), server.clone())).unwrap();
        event_loop.run();
    });

    let (event_loop, server) = rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    // The payload dwarfs the kernel buffers, so the shutdown is issued
    // while the output buffer still holds data.
    let mut total = 0usize;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = client.read(&mut buf).unwrap();
        if n == 0 {
            break; // EOF after the full payload
        }
        assert!(buf[..n].iter().all(|&b| b == b'd'));
        total += n;
    }
    assert_eq!(total, PAYLOAD_LEN);

    assert_eq!(disconnecting_seen.load(Ordering::Acquire), 1);
    wait_until("write completion", || {
        write_complete_count.load(Ordering::Acquire) >= 1
    });

    // Client closes its side; the connection fully tears down.
    drop(client);
    wait_until("connection teardown", || conn_down.load(Ordering::Acquire) == 1);
    wait_until("connection map drain", || server.connection_count() == 0);

    drop(server);
    event_loop.quit();
    server_thread.join().unwrap();
}
