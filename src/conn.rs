//! RAII wrapper around an accepted client descriptor.

use crate::syscalls;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

pub struct Connection {
    fd: RawFd,
    peer: Option<SocketAddr>,
}

impl Connection {
    /// Wrap an open descriptor. The connection owns it from here on and
    /// closes it on drop unless [`into_raw`](Self::into_raw) is called.
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            peer: peer_addr(fd),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Peer address as `ip:port`, or `unknown` when `getpeername` failed.
    pub fn remote_addr(&self) -> String {
        match self.peer {
            Some(addr) => addr.to_string(),
            None => "unknown".to_string(),
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        syscalls::read_fd(self.fd, buf)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        syscalls::write_fd(self.fd, buf)
    }

    pub fn set_nonblocking(&self) -> io::Result<()> {
        syscalls::set_nonblocking(self.fd)
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            syscalls::close_fd(self.fd);
            self.fd = -1;
        }
    }

    /// Release ownership of the descriptor without closing it. Used when a
    /// WebSocket upgrade hands the socket to its registered handler.
    pub fn into_raw(mut self) -> RawFd {
        let fd = self.fd;
        self.fd = -1;
        fd
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn peer_addr(fd: RawFd) -> Option<SocketAddr> {
    unsafe {
        let mut storage: libc::sockaddr_storage = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        if libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) != 0 {
            return None;
        }

        match storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let sin = &*(&storage as *const _ as *const libc::sockaddr_in);
                Some(SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                    u16::from_be(sin.sin_port),
                )))
            }
            libc::AF_INET6 => {
                let sin6 = &*(&storage as *const _ as *const libc::sockaddr_in6);
                Some(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::IntoRawFd;

    #[test]
    fn reports_peer_address_and_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        let conn = Connection::new(server_side.into_raw_fd());
        assert!(conn.remote_addr().starts_with("127.0.0.1:"));

        assert_eq!(conn.write(b"ping").unwrap(), 4);
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn into_raw_releases_ownership() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        let conn = Connection::new(server_side.into_raw_fd());
        let fd = conn.into_raw();
        // Still open: closing it here must succeed exactly once.
        assert!(fd >= 0);
        syscalls::close_fd(fd);
    }
}
