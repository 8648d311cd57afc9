//! Owning wrapper for a TCP socket file descriptor.

use std::io;
use std::os::unix::io::RawFd;

use tracing::error;

use crate::addr::InetAddr;
use crate::error::Error;

/// Listen backlog applied by [`Socket::listen`].
const LISTEN_BACKLOG: libc::c_int = 1024;

/// Exclusive owner of one socket fd.
///
/// Non-copyable; moving transfers ownership. The fd is closed exactly
/// once when the owner drops.
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
}

impl Socket {
    /// Create a non-blocking, close-on-exec IPv4 stream socket.
    pub fn new_nonblocking() -> Result<Socket, Error> {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(Socket { fd })
    }

    /// Take ownership of an already-open fd (e.g. one returned by accept4).
    pub(crate) fn from_raw(fd: RawFd) -> Socket {
        Socket { fd }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Bind to a local address.
    pub fn bind(&self, addr: &InetAddr) -> Result<(), Error> {
        let ret = unsafe {
            libc::bind(
                self.fd,
                addr.sockaddr() as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Start listening with a backlog of 1024.
    pub fn listen(&self) -> Result<(), Error> {
        let ret = unsafe { libc::listen(self.fd, LISTEN_BACKLOG) };
        if ret != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Accept one pending connection.
    ///
    /// The returned socket is non-blocking and close-on-exec
    /// (accept4 with `SOCK_NONBLOCK | SOCK_CLOEXEC`).
    pub fn accept(&self) -> io::Result<(Socket, InetAddr)> {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

        let connfd = unsafe {
            libc::accept4(
                self.fd,
                &mut addr as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if connfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((Socket::from_raw(connfd), InetAddr::from_sockaddr(addr)))
    }

    /// Half-close the write side. Errors are logged, not propagated;
    /// the subsequent readiness event carries the outcome.
    pub fn shutdown_write(&self) {
        if unsafe { libc::shutdown(self.fd, libc::SHUT_WR) } < 0 {
            error!(
                "shutdown(SHUT_WR) failed for fd {}: {}",
                self.fd,
                io::Error::last_os_error()
            );
        }
    }

    pub fn set_tcp_nodelay(&self, on: bool) {
        set_socket_option(self.fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on);
    }

    pub fn set_reuse_addr(&self, on: bool) {
        set_socket_option(self.fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on);
    }

    pub fn set_reuse_port(&self, on: bool) {
        set_socket_option(self.fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on);
    }

    pub fn set_keep_alive(&self, on: bool) {
        set_socket_option(self.fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on);
    }

    /// Query and clear the pending socket error (SO_ERROR).
    pub(crate) fn take_error(&self) -> i32 {
        let mut optval: libc::c_int = 0;
        let mut optlen = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut optval as *mut _ as *mut libc::c_void,
                &mut optlen,
            )
        };
        if ret < 0 {
            io::Error::last_os_error().raw_os_error().unwrap_or(0)
        } else {
            optval
        }
    }

    /// Local address via getsockname(2).
    pub fn local_addr(&self) -> InetAddr {
        InetAddr::local_of(self.fd)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn set_socket_option(fd: RawFd, level: libc::c_int, option: libc::c_int, on: bool) {
    let optval: libc::c_int = if on { 1 } else { 0 };
    unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_bind_listen() {
        let socket = Socket::new_nonblocking().unwrap();
        socket.set_reuse_addr(true);
        let addr = InetAddr::new("127.0.0.1", 0).unwrap();
        socket.bind(&addr).unwrap();
        socket.listen().unwrap();

        // The kernel assigned an ephemeral port.
        assert_ne!(socket.local_addr().port(), 0);
    }

    #[test]
    fn test_accept_would_block_when_no_peer() {
        let socket = Socket::new_nonblocking().unwrap();
        socket
            .bind(&InetAddr::new("127.0.0.1", 0).unwrap())
            .unwrap();
        socket.listen().unwrap();

        let err = socket.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_option_setters_do_not_panic() {
        let socket = Socket::new_nonblocking().unwrap();
        socket.set_tcp_nodelay(true);
        socket.set_keep_alive(true);
        socket.set_reuse_addr(true);
        socket.set_reuse_port(false);
        assert_eq!(socket.take_error(), 0);
    }

    #[test]
    fn test_bind_in_use_fails() {
        let first = Socket::new_nonblocking().unwrap();
        first
            .bind(&InetAddr::new("127.0.0.1", 0).unwrap())
            .unwrap();
        first.listen().unwrap();
        let port = first.local_addr().port();

        let second = Socket::new_nonblocking().unwrap();
        let result = second.bind(&InetAddr::new("127.0.0.1", port).unwrap());
        assert!(result.is_err());
    }
}
