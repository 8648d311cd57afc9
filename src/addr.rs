//! IPv4 endpoint wrapper over a raw `sockaddr_in`.

use std::fmt;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

use tracing::error;

use crate::error::Error;

/// Immutable IPv4 host/port pair.
///
/// Stored in wire form (`sockaddr_in`) so it can be handed to bind(2),
/// accept4(2) and friends without conversion.
#[derive(Clone, Copy)]
pub struct InetAddr {
    addr: libc::sockaddr_in,
}

impl InetAddr {
    /// Build an address from a dotted-quad IP string and a port.
    pub fn new(ip: &str, port: u16) -> Result<InetAddr, Error> {
        let parsed: Ipv4Addr = ip
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("{ip}:{port}")))?;

        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = u32::from_ne_bytes(parsed.octets());
        Ok(InetAddr { addr })
    }

    /// Build an address from a raw `sockaddr_in` (e.g. filled by accept4).
    pub(crate) fn from_sockaddr(addr: libc::sockaddr_in) -> InetAddr {
        InetAddr { addr }
    }

    /// Query the local address of a connected socket via getsockname(2).
    pub(crate) fn local_of(fd: RawFd) -> InetAddr {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if ret < 0 {
            error!(
                "getsockname failed for fd {}: {}",
                fd,
                std::io::Error::last_os_error()
            );
        }
        InetAddr { addr }
    }

    /// Dotted-quad IP string.
    pub fn ip(&self) -> String {
        Ipv4Addr::from(self.addr.sin_addr.s_addr.to_ne_bytes()).to_string()
    }

    /// Host-order port.
    #[inline]
    pub fn port(&self) -> u16 {
        u16::from_be(self.addr.sin_port)
    }

    /// `"ip:port"` form used in connection names and logs.
    pub fn ip_port(&self) -> String {
        format!("{}:{}", self.ip(), self.port())
    }

    /// Raw wire-form address for socket syscalls.
    #[inline]
    pub(crate) fn sockaddr(&self) -> &libc::sockaddr_in {
        &self.addr
    }
}

impl Default for InetAddr {
    fn default() -> InetAddr {
        InetAddr {
            addr: unsafe { std::mem::zeroed() },
        }
    }
}

impl fmt::Display for InetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ip_port())
    }
}

impl fmt::Debug for InetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InetAddr({})", self.ip_port())
    }
}
