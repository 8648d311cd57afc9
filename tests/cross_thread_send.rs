//! Sending on a connection from a thread that is not its subloop.
//!
//! The payload must be copied before the cross-thread hop and delivered
//! to the peer exactly once.

use std::io::Read;
use std::net::TcpStream;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use muxio::{EventLoop, InetAddr, PortOption, TcpConnectionRef, TcpServer};

fn get_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_cross_thread_send_delivers_once() {
    let port = get_available_port();
    let connection: Arc<Mutex<Option<TcpConnectionRef>>> = Arc::new(Mutex::new(None));

    let (tx, rx) = mpsc::channel();
    let slot = connection.clone();

    let server_thread = thread::spawn(move || {
        let event_loop = EventLoop::new();
        let addr = InetAddr::new("127.0.0.1", port).unwrap();
        let server = TcpServer::new(&event_loop, &addr, "xsend", PortOption::NoReusePort);

        server.set_thread_num(1);
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.is_connected() {
                *slot.lock().unwrap() = Some(conn.clone());
            } else {
                *slot.lock().unwrap() = None;
            }
        }));

        server.start();
        tx.send(event_loop.clone()).unwrap();
        event_loop.run();
    });

    let event_loop = rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();

    wait_until("connection established", || connection.lock().unwrap().is_some());
    let conn = connection.lock().unwrap().clone().unwrap();

    // This test thread is neither the base loop nor the subloop.
    assert!(!conn.event_loop().is_in_loop_thread());

    let mut payload = b"x".to_vec();
    conn.send(&payload);
    // The library copied the payload; clobbering the caller's buffer
    // after send returns must not affect what the peer receives.
    payload[0] = b'?';

    let mut buf = [0u8; 8];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"x");

    // Exactly once: no further bytes arrive.
    match client.read(&mut buf) {
        Ok(0) => panic!("peer closed unexpectedly"),
        Ok(n) => panic!("unexpected extra bytes: {:?}", &buf[..n]),
        Err(e) => {
            assert!(
                e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut
            );
        }
    }

    drop(conn);
    drop(client);
    wait_until("connection teardown", || connection.lock().unwrap().is_none());

    event_loop.quit();
    server_thread.join().unwrap();
}
