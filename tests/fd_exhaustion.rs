//! Accept behavior under file-descriptor exhaustion.
//!
//! With RLIMIT_NOFILE tightened so accept4 fails with EMFILE, the
//! accept loop must survive and pick the pending connection up once
//! descriptors free. This test owns its process, so the rlimit dance
//! does not leak into unrelated tests.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::io::FromRawFd;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use muxio::{EventLoop, InetAddr, PortOption, TcpServer};

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

fn nofile_limit() -> libc::rlimit {
    let mut rlim: libc::rlimit = unsafe { std::mem::zeroed() };
    assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) }, 0);
    rlim
}

fn set_nofile_soft(soft: libc::rlim_t, hard: libc::rlim_t) {
    let rlim = libc::rlimit {
        rlim_cur: soft,
        rlim_max: hard,
    };
    assert_eq!(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) }, 0);
}

/// Create a blocking client socket fd before the limit is tightened, so
/// connecting during the window needs no new descriptor in this process.
fn preallocated_client() -> TcpStream {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    assert!(fd >= 0);
    let stream = unsafe { TcpStream::from_raw_fd(fd) };
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
}

/// Deferred connect on an already-allocated socket.
fn connect_raw(stream: &TcpStream, port: u16) {
    use std::os::unix::io::AsRawFd;

    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = port.to_be();
    sa.sin_addr.s_addr = u32::from_ne_bytes([127, 0, 0, 1]);

    let ret = unsafe {
        libc::connect(
            stream.as_raw_fd(),
            &sa as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    assert_eq!(ret, 0, "connect failed: {}", std::io::Error::last_os_error());
}

#[test]
fn test_accept_survives_emfile() {
    let port = get_available_port();
    let (tx, rx) = mpsc::channel();

    let server_thread = thread::spawn(move || {
        let event_loop = EventLoop::new();
        let addr = InetAddr::new("127.0.0.1", port).unwrap();
        let server = TcpServer::new(&event_loop, &addr, "emfile", PortOption::NoReusePort);

        // Everything on the base loop: no pool threads competing for fds.
        server.set_message_callback(Arc::new(|conn, buffer, _| {
            let data = buffer.retrieve_all_as_bytes();
            conn.send(&data);
        }));

        server.start();
        tx.send((event_loop.clone(), server.clone())).unwrap();
        event_loop.run();
    });

    let (event_loop, server) = rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Sanity: a normal client echoes.
    let mut first = TcpStream::connect(("127.0.0.1", port)).unwrap();
    first
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    first.write_all(b"ping").unwrap();
    let mut buf = [0u8; 16];
    let n = first.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");
    wait_until("first connection", || server.connection_count() == 1);

    // Tighten the limit so every new descriptor allocation fails, then
    // complete a handshake: the kernel backlog accepts it, accept4 gets
    // EMFILE, and the loop must keep running.
    let second = preallocated_client();
    let original = nofile_limit();
    set_nofile_soft(0, original.rlim_max);

    connect_raw(&second, port);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(
        server.connection_count(),
        1,
        "accept must fail while descriptors are exhausted"
    );

    // The first connection still works through the exhaustion window.
    first.write_all(b"still-alive").unwrap();
    let n = first.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"still-alive");

    // Free descriptors: the pending connection is picked up because the
    // listening fd stays readable.
    set_nofile_soft(original.rlim_cur, original.rlim_max);
    wait_until("pending connection accepted", || {
        server.connection_count() == 2
    });

    let mut second = second;
    second.write_all(b"late").unwrap();
    let n = second.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"late");

    drop(first);
    drop(second);
    wait_until("connection map drain", || server.connection_count() == 0);

    drop(server);
    event_loop.quit();
    server_thread.join().unwrap();
}
