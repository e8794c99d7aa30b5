// src/syscalls.rs
use crate::error::{EtudeError, EtudeResult};
use libc::{c_int, c_void, socklen_t};
use std::fs::File;
use std::io;
use std::mem;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::ptr::{self, NonNull};

// ---- Socket Operations ----

/// Create a non-blocking TCP listening socket with SO_REUSEADDR.
pub fn create_listen_socket(host_port: &str, backlog: c_int) -> EtudeResult<TcpListener> {
    let addr: SocketAddr = host_port
        .parse()
        .map_err(|_| EtudeError::Address(host_port.to_string()))?;

    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        // 1. Atomic non-blocking socket
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        // 2. SO_REUSEADDR so a restart does not trip over TIME_WAIT
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
            return Err(err.into());
        }

        // 3. Bind
        bind_addr(fd, &addr)?;

        // 4. Listen
        if libc::listen(fd, backlog) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        // The std listener only owns the descriptor (close on drop, local_addr).
        Ok(TcpListener::from_raw_fd(fd))
    }
}

/// Bind a socket to an address. Closes `fd` on failure.
fn bind_addr(fd: c_int, addr: &SocketAddr) -> EtudeResult<()> {
    unsafe {
        let res = match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                )
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                )
            }
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }
        Ok(())
    }
}

/// Accept a non-blocking connection. `None` means the backlog is drained.
/// Accept one pending connection. `Ok(None)` means the backlog is empty.
///
/// Errors that belong to a single queued connection are skipped so the
/// caller keeps draining; anything returned is a listener-wide failure such
/// as descriptor exhaustion.
pub fn accept_connection(listen_fd: RawFd) -> EtudeResult<Option<RawFd>> {
    loop {
        let fd = unsafe {
            libc::accept4(
                listen_fd,
                ptr::null_mut(),
                ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd >= 0 {
            return Ok(Some(fd));
        }

        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        if is_per_connection_accept_error(&err) {
            continue;
        }
        return Err(err.into());
    }
}

/// accept(2) reports pending network errors of the new socket through the
/// listener; those say nothing about the listener itself.
fn is_per_connection_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
    ) || matches!(
        err.raw_os_error(),
        Some(
            libc::EPROTO
                | libc::ENOPROTOOPT
                | libc::ENETDOWN
                | libc::ENETUNREACH
                | libc::EHOSTDOWN
                | libc::EHOSTUNREACH
                | libc::ENONET
                | libc::EOPNOTSUPP
                | libc::EPERM
        )
    )
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Epoll Operations ----

pub use libc::epoll_event;

/// Readiness a one-shot registration is armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

impl Interest {
    #[inline(always)]
    fn bits(self) -> u32 {
        let base = match self {
            Interest::Read => libc::EPOLLIN,
            Interest::Write => libc::EPOLLOUT,
        };
        (base | libc::EPOLLET | libc::EPOLLONESHOT | libc::EPOLLRDHUP) as u32
    }
}

/// One readiness notification out of `Epoll::wait`.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub token: u64,
    bits: u32,
}

impl Readiness {
    #[inline(always)]
    pub fn from_raw(event: &epoll_event) -> Self {
        // epoll_event is packed on x86_64; copy the fields out by value.
        let token = event.u64;
        let bits = event.events;
        Self { token, bits }
    }

    /// Peer half-close, hangup or socket error.
    #[inline(always)]
    pub fn is_hangup(&self) -> bool {
        self.bits & (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0
    }

    #[inline(always)]
    pub fn is_readable(&self) -> bool {
        self.bits & libc::EPOLLIN as u32 != 0
    }

    #[inline(always)]
    pub fn is_writable(&self) -> bool {
        self.bits & libc::EPOLLOUT as u32 != 0
    }
}

/// Edge-triggered epoll instance. `epoll_ctl` is thread safe, so workers
/// re-arm descriptors through a shared reference.
pub struct Epoll {
    pub fd: c_int,
}

impl Epoll {
    pub fn new() -> EtudeResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    /// Register the listening socket: edge triggered, never one-shot.
    pub fn add_listener(&self, fd: RawFd, token: u64) -> EtudeResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, (libc::EPOLLIN | libc::EPOLLET) as u32)
    }

    /// Register a connection: edge triggered + one-shot + peer half-close.
    pub fn add(&self, fd: RawFd, token: u64, interest: Interest) -> EtudeResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest.bits())
    }

    /// Re-arm a one-shot registration that has fired.
    pub fn rearm(&self, fd: RawFd, token: u64, interest: Interest) -> EtudeResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest.bits())
    }

    fn ctl(&self, op: c_int, fd: RawFd, token: u64, events: u32) -> EtudeResult<()> {
        let mut event = epoll_event { events, u64: token };
        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> EtudeResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> EtudeResult<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );

            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }

            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Non-blocking I/O ----

/// Read into `buf`. `Some(0)` is EOF, `None` means nothing is available yet.
pub fn read_nonblocking(fd: RawFd, buf: &mut [u8]) -> EtudeResult<Option<usize>> {
    unsafe {
        let res = libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

/// Vectored write of up to two segments in a single syscall.
///
/// Goes through sendmsg(2) so a reset peer yields EPIPE instead of SIGPIPE.
/// `None` means the socket buffer is full.
pub fn writev_nonblocking(fd: RawFd, bufs: &[&[u8]]) -> EtudeResult<Option<usize>> {
    if bufs.is_empty() {
        return Ok(Some(0));
    }

    let mut iovecs: [libc::iovec; 2] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(iovecs.len());

    for (iov, buf) in iovecs.iter_mut().zip(bufs.iter()) {
        *iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
    }

    unsafe {
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = iovecs.as_mut_ptr();
        msg.msg_iovlen = iov_count as _;

        let res = libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

/// Best-effort single send used for the capacity rejection.
pub fn send_best_effort(fd: RawFd, buf: &[u8]) {
    unsafe {
        libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), libc::MSG_NOSIGNAL);
    }
}

// ---- Memory-mapped files ----

/// Read-only private mapping of a whole file. Unmapped on drop.
///
/// The mapping stays valid after the file handle that created it is closed.
pub struct FileMapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is PROT_READ and owned exclusively by this value.
unsafe impl Send for FileMapping {}

impl FileMapping {
    /// Map `len` bytes of `file`. `len` must be non-zero.
    pub fn map(file: &File, len: usize) -> EtudeResult<Self> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot map an empty file").into());
        }
        unsafe {
            let addr = libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            );
            if addr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error().into());
            }
            match NonNull::new(addr as *mut u8) {
                Some(ptr) => Ok(Self { ptr, len }),
                None => Err(io::Error::other("mmap returned a null mapping").into()),
            }
        }
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for FileMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut c_void, self.len);
        }
    }
}

#[cfg(test)]
pub(crate) fn socket_pair() -> (RawFd, RawFd) {
    let mut fds = [0 as c_int; 2];
    let res = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    assert_eq!(res, 0, "socketpair failed: {}", io::Error::last_os_error());
    (fds[0], fds[1])
}
