//! Seams to the readiness poller, the raw syscall layer, and the executor.
//!
//! The endpoint never owns an event loop. It consumes an edge-triggered
//! [`EventHandle`] provided by the poller, issues syscalls through a
//! [`PosixInterface`], and defers callbacks through an [`Executor`]. All
//! three are trait objects so tests can script them.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{OwnedFd, RawFd};

use libc::c_int;

use crate::error::EndpointError;

/// Result of a raw posix call routed through the interface.
pub type SysResult<T> = Result<T, SysError>;

/// Failure of a raw posix call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysError {
    /// A plain OS errno.
    Os(i32),
    /// The descriptor belongs to a pre-fork generation and must not be used.
    WrongGeneration,
}

impl SysError {
    /// True if this is the given errno.
    #[inline]
    pub fn is(self, errno: i32) -> bool {
        matches!(self, SysError::Os(e) if e == errno)
    }

    /// Human-readable error text.
    pub fn message(&self) -> String {
        match self {
            SysError::Os(errno) => io::Error::from_raw_os_error(*errno).to_string(),
            SysError::WrongGeneration => "wrong file descriptor generation".to_string(),
        }
    }

    /// Annotate as an endpoint error for the named syscall.
    pub fn annotate(&self, op: &'static str) -> EndpointError {
        match self {
            SysError::Os(errno) => EndpointError::os(op, *errno),
            SysError::WrongGeneration => EndpointError::Io {
                op,
                detail: self.message(),
            },
        }
    }
}

/// Raw syscall surface the endpoint drives.
///
/// `EINTR` is surfaced, not retried; the endpoint retries.
pub trait PosixInterface: Send + Sync {
    /// `sendmsg(2)`. Returns bytes the kernel accepted.
    fn sendmsg(&self, fd: RawFd, msg: &libc::msghdr, flags: c_int) -> SysResult<isize>;

    /// `recvmsg(2)`. Returns bytes received; `0` is end of stream.
    fn recvmsg(&self, fd: RawFd, msg: &mut libc::msghdr, flags: c_int) -> SysResult<isize>;

    /// Set an integer socket option. On success returns the value the kernel
    /// now reports for the option (which may differ from the request).
    fn setsockopt_int(
        &self,
        fd: RawFd,
        level: c_int,
        optname: c_int,
        value: c_int,
    ) -> SysResult<c_int>;

    /// Local address of the socket.
    fn local_addr(&self, fd: RawFd) -> SysResult<SocketAddr>;

    /// Peer address of the socket.
    fn peer_addr(&self, fd: RawFd) -> SysResult<SocketAddr>;
}

/// Callback invoked by the poller when a requested edge fires.
///
/// `Ok(())` means the edge fired; an error means the handle was shut down
/// before (or while) the edge was pending.
pub type PollerCallback = Box<dyn FnOnce(Result<(), EndpointError>) + Send>;

/// An edge-triggered readiness handle for one descriptor.
///
/// Contract: each `notify_on_*` registers at most one pending callback for
/// that edge; the poller invokes it exactly once, either when the edge fires
/// (with `Ok`) or when the handle is shut down (with the shutdown error).
/// `set_*` force-arm an edge as if the kernel had reported it.
pub trait EventHandle: Send + Sync {
    /// The wrapped descriptor.
    fn raw_fd(&self) -> RawFd;

    /// Request the next readable edge.
    fn notify_on_read(&self, cb: PollerCallback);

    /// Request the next writable edge.
    fn notify_on_write(&self, cb: PollerCallback);

    /// Request the next error-queue notification.
    fn notify_on_error(&self, cb: PollerCallback);

    /// Force the readable edge.
    fn set_readable(&self);

    /// Force the writable edge.
    fn set_writable(&self);

    /// Force the error edge.
    fn set_has_error(&self);

    /// True once `shutdown` has been called.
    fn is_shutdown(&self) -> bool;

    /// Mark the handle errored. Pending and future callbacks are invoked
    /// with `reason`.
    fn shutdown(&self, reason: EndpointError);

    /// Deregister from the poller. With `release_fd` the descriptor is
    /// returned to the caller instead of being closed.
    fn orphan(&self, release_fd: bool) -> Option<OwnedFd>;

    /// Whether the poller delivers error-queue notifications
    /// (zero-copy completions, timestamps).
    fn can_track_errors(&self) -> bool;
}

/// Runs deferred completion callbacks off the current call stack.
pub trait Executor: Send + Sync {
    fn run(&self, f: Box<dyn FnOnce() + Send>);
}

/// Production [`PosixInterface`] issuing real syscalls.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsInterface;

impl OsInterface {
    fn errno() -> SysError {
        SysError::Os(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }
}

impl PosixInterface for OsInterface {
    fn sendmsg(&self, fd: RawFd, msg: &libc::msghdr, flags: c_int) -> SysResult<isize> {
        let n = unsafe { libc::sendmsg(fd, msg, flags) };
        if n < 0 { Err(Self::errno()) } else { Ok(n as isize) }
    }

    fn recvmsg(&self, fd: RawFd, msg: &mut libc::msghdr, flags: c_int) -> SysResult<isize> {
        let n = unsafe { libc::recvmsg(fd, msg, flags) };
        if n < 0 { Err(Self::errno()) } else { Ok(n as isize) }
    }

    fn setsockopt_int(
        &self,
        fd: RawFd,
        level: c_int,
        optname: c_int,
        value: c_int,
    ) -> SysResult<c_int> {
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                optname,
                &value as *const c_int as *const libc::c_void,
                mem::size_of::<c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(Self::errno());
        }
        // Read back what the kernel actually applied.
        let mut applied: c_int = 0;
        let mut len = mem::size_of::<c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                level,
                optname,
                &mut applied as *mut c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 { Ok(value) } else { Ok(applied) }
    }

    fn local_addr(&self, fd: RawFd) -> SysResult<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if rc != 0 {
            return Err(Self::errno());
        }
        decode_sockaddr(&storage).ok_or(SysError::Os(libc::EAFNOSUPPORT))
    }

    fn peer_addr(&self, fd: RawFd) -> SysResult<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if rc != 0 {
            return Err(Self::errno());
        }
        decode_sockaddr(&storage).ok_or(SysError::Os(libc::EAFNOSUPPORT))
    }
}

fn decode_sockaddr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let v4: &libc::sockaddr_in = unsafe { &*(storage as *const _ as *const _) };
            let ip = Ipv4Addr::from(u32::from_be(v4.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(v4.sin_port)))
        }
        libc::AF_INET6 => {
            let v6: &libc::sockaddr_in6 = unsafe { &*(storage as *const _ as *const _) };
            let ip = Ipv6Addr::from(v6.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(v6.sin6_port)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sys_error_is() {
        assert!(SysError::Os(libc::EAGAIN).is(libc::EAGAIN));
        assert!(!SysError::Os(libc::EAGAIN).is(libc::ENOBUFS));
        assert!(!SysError::WrongGeneration.is(libc::EAGAIN));
    }

    #[test]
    fn test_wrong_generation_annotation() {
        let err = SysError::WrongGeneration.annotate("recvmsg");
        assert!(err.to_string().contains("generation"));
    }

    #[test]
    fn test_local_addr_of_real_socket() {
        use std::net::TcpListener;
        use std::os::fd::AsRawFd;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let posix = OsInterface;
        let addr = posix.local_addr(listener.as_raw_fd()).unwrap();
        assert_eq!(addr, listener.local_addr().unwrap());
    }
}
