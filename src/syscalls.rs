//! Thin wrappers over the raw socket and readiness syscalls.
//!
//! Everything here returns plain `io::Result`; callers decide how failures
//! map onto [`crate::error::ServerError`].

use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

/// Create a non-blocking TCP listen socket bound to `host:port`.
///
/// `backlog` is the kernel listen queue depth (the server passes its
/// `max_connections` setting).
pub fn create_listen_socket(host: &str, port: u16, backlog: i32) -> io::Result<RawFd> {
    let addr_str = format!("{}:{}", host, port);
    let addr: std::net::SocketAddr = addr_str
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{}: {}", addr_str, e)))?;

    let domain = match addr {
        std::net::SocketAddr::V4(_) => libc::AF_INET,
        std::net::SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        #[cfg(target_os = "linux")]
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        #[cfg(not(target_os = "linux"))]
        let fd = libc::socket(domain, libc::SOCK_STREAM, 0);

        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        #[cfg(not(target_os = "linux"))]
        if let Err(e) = set_nonblocking(fd) {
            libc::close(fd);
            return Err(e);
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if let Err(e) = bind_addr(fd, &addr) {
            libc::close(fd);
            return Err(e);
        }

        if libc::listen(fd, backlog.max(1)) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(fd)
    }
}

fn bind_addr(fd: c_int, addr: &std::net::SocketAddr) -> io::Result<()> {
    unsafe {
        match addr {
            std::net::SocketAddr::V4(a) => {
                let mut sin: libc::sockaddr_in = mem::zeroed();
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = a.port().to_be();
                sin.sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                };
                if libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error());
                }
            }
            std::net::SocketAddr::V6(a) => {
                let mut sin6: libc::sockaddr_in6 = mem::zeroed();
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = a.port().to_be();
                sin6.sin6_flowinfo = a.flowinfo();
                sin6.sin6_addr = libc::in6_addr {
                    s6_addr: a.ip().octets(),
                };
                sin6.sin6_scope_id = a.scope_id();
                if libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error());
                }
            }
        }
        Ok(())
    }
}

/// Accept one pending connection. `Ok(None)` means the accept queue is
/// drained (`EAGAIN`/`EWOULDBLOCK`). The returned descriptor is non-blocking.
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<RawFd>> {
    #[cfg(target_os = "linux")]
    unsafe {
        let fd = libc::accept4(
            listen_fd,
            ptr::null_mut(),
            ptr::null_mut(),
            libc::SOCK_NONBLOCK,
        );
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            }
        } else {
            Ok(Some(fd))
        }
    }

    #[cfg(not(target_os = "linux"))]
    unsafe {
        let fd = libc::accept(listen_fd, ptr::null_mut(), ptr::null_mut());
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            }
        } else {
            if let Err(e) = set_nonblocking(fd) {
                libc::close(fd);
                return Err(e);
            }
            Ok(Some(fd))
        }
    }
}

/// Put a descriptor into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Port a bound socket actually listens on (resolves port 0 binds).
pub fn local_port(fd: RawFd) -> io::Result<u16> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) != 0 {
            return Err(io::Error::last_os_error());
        }
        match storage.ss_family as c_int {
            libc::AF_INET => {
                let sin = &*(&storage as *const _ as *const libc::sockaddr_in);
                Ok(u16::from_be(sin.sin_port))
            }
            libc::AF_INET6 => {
                let sin6 = &*(&storage as *const _ as *const libc::sockaddr_in6);
                Ok(u16::from_be(sin6.sin6_port))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected socket family",
            )),
        }
    }
}

/// Raw non-blocking read. `Ok(0)` is end-of-stream; `EAGAIN` surfaces as
/// `ErrorKind::WouldBlock` so callers can tell "no data yet" from EOF.
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

/// Raw non-blocking write. `EAGAIN` surfaces as `ErrorKind::WouldBlock`.
pub fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    unsafe {
        let res = libc::write(fd, buf.as_ptr() as *const c_void, buf.len());
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

// ---- Readiness polling (epoll on Linux, kqueue elsewhere) ----

pub const INTEREST_READ: u32 = 0x1;
pub const INTEREST_WRITE: u32 = 0x2;
/// Set on delivered events when the kernel reported EOF or a socket error.
pub const EVENT_EOF: u32 = 0x4;

/// One delivered readiness event: which descriptor, and what fired.
#[derive(Clone, Copy, Default)]
pub struct ReadyEvent {
    pub fd: RawFd,
    pub flags: u32,
}

impl ReadyEvent {
    pub fn readable(&self) -> bool {
        self.flags & INTEREST_READ != 0
    }
    pub fn writable(&self) -> bool {
        self.flags & INTEREST_WRITE != 0
    }
    pub fn eof(&self) -> bool {
        self.flags & EVENT_EOF != 0
    }
}

#[cfg(target_os = "linux")]
pub use linux_poll::Poller;

#[cfg(target_os = "linux")]
mod linux_poll {
    use super::*;

    pub struct Poller {
        fd: c_int,
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            unsafe {
                let fd = libc::epoll_create1(0);
                if fd < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(Self { fd })
            }
        }

        fn interests_to_epoll(interests: u32) -> u32 {
            let mut ev = 0u32;
            if interests & INTEREST_READ != 0 {
                ev |= libc::EPOLLIN as u32;
            }
            if interests & INTEREST_WRITE != 0 {
                ev |= libc::EPOLLOUT as u32;
            }
            // Edge triggered; registered callbacks deregister themselves
            // before the next readiness cycle.
            ev | libc::EPOLLET as u32 | libc::EPOLLRDHUP as u32
        }

        pub fn add(&self, fd: RawFd, interests: u32) -> io::Result<()> {
            let mut event = libc::epoll_event {
                events: Self::interests_to_epoll(interests),
                u64: fd as u64,
            };
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        }

        pub fn modify(&self, fd: RawFd, interests: u32) -> io::Result<()> {
            let mut event = libc::epoll_event {
                events: Self::interests_to_epoll(interests),
                u64: fd as u64,
            };
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        }

        pub fn delete(&self, fd: RawFd) -> io::Result<()> {
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                    let err = io::Error::last_os_error();
                    // Already gone is fine; unregister is idempotent.
                    if err.raw_os_error() != Some(libc::ENOENT) {
                        return Err(err);
                    }
                }
            }
            Ok(())
        }

        /// Wait up to `timeout_ms` for events. Signal interruption reports
        /// zero events rather than an error.
        pub fn wait(&self, events: &mut [ReadyEvent], timeout_ms: i32) -> io::Result<usize> {
            let mut raw = vec![libc::epoll_event { events: 0, u64: 0 }; events.len()];
            unsafe {
                let res = libc::epoll_wait(self.fd, raw.as_mut_ptr(), raw.len() as c_int, timeout_ms);
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(err);
                }
                let n = res as usize;
                for i in 0..n {
                    let bits = raw[i].events;
                    let mut flags = 0u32;
                    if bits & libc::EPOLLIN as u32 != 0 {
                        flags |= INTEREST_READ;
                    }
                    if bits & libc::EPOLLOUT as u32 != 0 {
                        flags |= INTEREST_WRITE;
                    }
                    if bits & (libc::EPOLLHUP as u32 | libc::EPOLLERR as u32 | libc::EPOLLRDHUP as u32)
                        != 0
                    {
                        flags |= EVENT_EOF;
                    }
                    events[i] = ReadyEvent {
                        fd: raw[i].u64 as RawFd,
                        flags,
                    };
                }
                Ok(n)
            }
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use kqueue_poll::Poller;

#[cfg(not(target_os = "linux"))]
mod kqueue_poll {
    use super::*;
    use libc::{kevent, kqueue, timespec, EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_CLEAR, EV_DELETE, EV_ENABLE, EV_EOF};

    pub struct Poller {
        fd: c_int,
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            unsafe {
                let fd = kqueue();
                if fd < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(Self { fd })
            }
        }

        pub fn add(&self, fd: RawFd, interests: u32) -> io::Result<()> {
            self.apply(fd, interests, EV_ADD | EV_ENABLE | EV_CLEAR)
        }

        pub fn modify(&self, fd: RawFd, interests: u32) -> io::Result<()> {
            self.apply(fd, interests, EV_ADD | EV_ENABLE | EV_CLEAR)
        }

        pub fn delete(&self, fd: RawFd) -> io::Result<()> {
            self.apply(fd, INTEREST_READ | INTEREST_WRITE, EV_DELETE)
        }

        fn apply(&self, fd: RawFd, interests: u32, action: u16) -> io::Result<()> {
            let mut changes = [unsafe { mem::zeroed::<kevent>() }; 2];
            let mut n = 0;

            if interests & INTEREST_READ != 0 {
                changes[n] = kevent {
                    ident: fd as usize,
                    filter: EVFILT_READ,
                    flags: action,
                    fflags: 0,
                    data: 0,
                    udata: ptr::null_mut(),
                };
                n += 1;
            }
            if interests & INTEREST_WRITE != 0 {
                changes[n] = kevent {
                    ident: fd as usize,
                    filter: EVFILT_WRITE,
                    flags: action,
                    fflags: 0,
                    data: 0,
                    udata: ptr::null_mut(),
                };
                n += 1;
            }

            unsafe {
                let res = libc::kevent(self.fd, changes.as_ptr(), n as c_int, ptr::null_mut(), 0, ptr::null());
                // Deleting a filter that was never added is not an error.
                if res < 0 && action != EV_DELETE {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut [ReadyEvent], timeout_ms: i32) -> io::Result<usize> {
            let mut kevents = vec![unsafe { mem::zeroed::<kevent>() }; events.len()];

            let ts = timespec {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
            };

            unsafe {
                let res = libc::kevent(
                    self.fd,
                    ptr::null(),
                    0,
                    kevents.as_mut_ptr(),
                    kevents.len() as c_int,
                    &ts,
                );
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(err);
                }
                let n = res as usize;
                for i in 0..n {
                    let mut flags = 0u32;
                    if kevents[i].filter == EVFILT_READ {
                        flags |= INTEREST_READ;
                    }
                    if kevents[i].filter == EVFILT_WRITE {
                        flags |= INTEREST_WRITE;
                    }
                    if kevents[i].flags & EV_EOF != 0 {
                        flags |= EVENT_EOF;
                    }
                    events[i] = ReadyEvent {
                        fd: kevents[i].ident as RawFd,
                        flags,
                    };
                }
                Ok(n)
            }
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}
