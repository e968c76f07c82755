//! Non-blocking socket creation, options and binding.

use std::collections::BTreeSet;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{fmt, mem};

use crate::epoll::{Epoll, Interest, Pollable};
use crate::error::{OsError, Result, errno};
use crate::log::Logger;
use crate::net::endpoint::{Endpoint, Family, SocketType};
use crate::net::fd::Fd;
use crate::{debug, error};

/// Socket options applied at `SOL_SOCKET` level before binding, as
/// `(option name, value)` pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions(BTreeSet<(libc::c_int, libc::c_int)>);

impl Default for SocketOptions {
    /// Address reuse (`SO_REUSEADDR`) only.
    fn default() -> Self {
        Self::none().with(libc::SO_REUSEADDR, 1)
    }
}

impl SocketOptions {
    /// An empty option set.
    pub fn none() -> Self {
        Self(BTreeSet::new())
    }

    /// Adds an option, e.g. `with(libc::SO_REUSEPORT, 1)`.
    pub fn with(mut self, name: libc::c_int, value: libc::c_int) -> Self {
        self.0.insert((name, value));
        self
    }

    /// Iterates over the `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (libc::c_int, libc::c_int)> + '_ {
        self.0.iter().copied()
    }
}

/// Where a new socket should be bound.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BindTarget {
    /// Only pick the address family; the socket is left unbound.
    Family(Family),
    /// Bind to this endpoint.
    Endpoint(Endpoint),
}

impl BindTarget {
    /// Returns the address family of the target.
    pub fn family(&self) -> Family {
        match *self {
            BindTarget::Family(family) => family,
            BindTarget::Endpoint(ref ep) => ep.family(),
        }
    }
}

impl Default for BindTarget {
    /// The IPv6 wildcard address with an ephemeral port.
    fn default() -> Self {
        BindTarget::Endpoint(Endpoint::any(Family::Inet6))
    }
}

impl From<Endpoint> for BindTarget {
    fn from(ep: Endpoint) -> Self {
        BindTarget::Endpoint(ep)
    }
}

impl From<Family> for BindTarget {
    fn from(family: Family) -> Self {
        BindTarget::Family(family)
    }
}

/// An owned, non-blocking, close-on-exec socket.
///
/// This is the common part of connections and listeners. The bound address is
/// not stored: it is queried from the kernel by [Socket::source].
pub struct Socket {
    fd: Fd,
    family: Family,
    kind: SocketType,
    pub(crate) log: Logger,
}

impl Socket {
    /// Creates a socket of `kind`, applies `opts` and binds it when `bind`
    /// names an endpoint.
    ///
    /// # Errors
    ///
    /// Returns [crate::Error::Resource], [crate::Error::Option] or [crate::Error::Bind] depending
    /// on the failing step. The descriptor is closed before returning.
    pub fn new(
        kind: SocketType,
        opts: &SocketOptions,
        bind: BindTarget,
        log: &Logger,
    ) -> Result<Self> {
        let family = bind.family();

        let raw = unsafe {
            libc::socket(
                family.as_raw(),
                kind.as_raw() | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if raw == -1 {
            let err = errno!(Resource, "socket");
            error!(log, "failed to create {kind:?} socket: {err}");
            return Err(err);
        }

        let sock = Self {
            fd: unsafe { Fd::from_raw(raw) },
            family,
            kind,
            log: log.clone(),
        };
        debug!(sock.log, "created {kind:?} socket fd {raw}");

        for (name, value) in opts.iter() {
            sock.set_option(libc::SOL_SOCKET, name, value)?;
        }

        if let BindTarget::Endpoint(ref ep) = bind {
            if unsafe { libc::bind(raw, ep.as_ptr(), ep.len()) } == -1 {
                let err = errno!(Bind, "bind");
                error!(sock.log, "failed to bind fd {raw} to {ep}: {err}");
                return Err(err);
            }
            debug!(sock.log, "bound fd {raw} to {ep}");
        }

        Ok(sock)
    }

    /// Wraps an already open descriptor (e.g., one returned by `accept4`).
    pub(crate) fn from_fd(fd: Fd, family: Family, kind: SocketType, log: &Logger) -> Self {
        Self {
            fd,
            family,
            kind,
            log: log.clone(),
        }
    }

    /// Sets an integer socket option.
    ///
    /// # Errors
    ///
    /// Returns [crate::Error::Option] if the kernel rejects the option.
    pub fn set_option(&self, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> Result<()> {
        let res = unsafe {
            libc::setsockopt(
                self.fd.as_raw(),
                level,
                name,
                &value as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };

        if res == -1 {
            let err = errno!(Option, "setsockopt");
            error!(self.log, "failed to set option {name}={value} on fd {}: {err}", self.fd.as_raw());
            return Err(err);
        }

        Ok(())
    }

    /// Reads an integer socket option.
    ///
    /// # Errors
    ///
    /// Returns [crate::Error::Option] if the option could not be read.
    pub fn option(&self, level: libc::c_int, name: libc::c_int) -> Result<libc::c_int> {
        let mut value: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;

        let res = unsafe {
            libc::getsockopt(
                self.fd.as_raw(),
                level,
                name,
                &mut value as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };

        if res == -1 {
            return Err(errno!(Option, "getsockopt"));
        }

        Ok(value)
    }

    /// Returns the pending error (`SO_ERROR`), clearing it in the kernel. Zero
    /// means no error is pending.
    pub(crate) fn take_error(&self) -> Result<i32> {
        self.option(libc::SOL_SOCKET, libc::SO_ERROR)
    }

    /// Returns the endpoint the socket is currently bound to, or `None` if it
    /// could not be queried.
    pub fn source(&self) -> Option<Endpoint> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        let res = unsafe {
            libc::getsockname(
                self.fd.as_raw(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };

        if res == -1 {
            let err = OsError::last("getsockname");
            error!(self.log, "failed to get fd {} bound source: {err}", self.fd.as_raw());
            return None;
        }

        match unsafe { Endpoint::from_raw(&storage as *const _ as *const libc::sockaddr, len) } {
            Ok(ep) => Some(ep),
            Err(err) => {
                error!(self.log, "fd {} bound to unusable address: {err}", self.fd.as_raw());
                None
            }
        }
    }

    /// Returns the connected peer (`getpeername`).
    ///
    /// # Errors
    ///
    /// Returns [crate::Error::Connect] with `ENOTCONN` while no peer is established.
    pub fn peer(&self) -> Result<Endpoint> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        let res = unsafe {
            libc::getpeername(
                self.fd.as_raw(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };

        if res == -1 {
            return Err(errno!(Connect, "getpeername"));
        }

        Ok(unsafe { Endpoint::from_raw(&storage as *const _ as *const libc::sockaddr, len) }?)
    }

    /// Returns the address family.
    pub fn family(&self) -> Family {
        self.family
    }

    /// Returns the socket type.
    pub fn kind(&self) -> SocketType {
        self.kind
    }

    /// Returns the raw descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw()
    }

    /// Registers the socket with `epoll` for `interest`, using the descriptor
    /// number as tag.
    pub fn add_to(&self, epoll: &Epoll, interest: Interest) -> Result<()> {
        epoll.register(self.fd(), interest, self.fd() as u64)
    }

    /// Blocks up to `timeout` for any of `interest` (or an error condition)
    /// using a throwaway epoll instance. Persistent registrations of this
    /// socket are not touched.
    pub(crate) fn wait_for(&self, interest: Interest, timeout: Option<Duration>) -> Result<bool> {
        let epoll = Epoll::new(&Logger::disabled())?;
        epoll.register(self.fd(), interest, self.fd() as u64)?;

        Ok(epoll.wait(timeout, |_| Some(()))?.is_some())
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw()
    }
}

impl Pollable for Socket {
    fn interest(&self) -> Interest {
        Interest::READABLE
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.fd.as_raw())
            .field("family", &self.family)
            .field("kind", &self.kind)
            .finish()
    }
}

impl fmt::Display for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd: {}, bound: ", self.fd.as_raw())?;
        match self.source() {
            Some(ep) => write!(f, "{ep}"),
            None => write!(f, "(none)"),
        }
    }
}

/// Maps a non-blocking "nothing to do now" error code.
pub(crate) fn is_transient(code: i32) -> bool {
    code == libc::EAGAIN || code == libc::EWOULDBLOCK || code == libc::EINTR
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::net::SocketAddr;

    fn loopback() -> BindTarget {
        BindTarget::Endpoint(Endpoint::from("127.0.0.1:0".parse::<SocketAddr>().unwrap()))
    }

    #[test]
    fn default_options_enable_reuse() {
        let sock = Socket::new(
            SocketType::Stream,
            &SocketOptions::default(),
            loopback(),
            &Logger::default(),
        )
        .unwrap();

        assert_eq!(sock.option(libc::SOL_SOCKET, libc::SO_REUSEADDR).unwrap(), 1);
        assert_eq!(sock.kind(), SocketType::Stream);
        assert_eq!(sock.family(), Family::Inet);
    }

    #[test]
    fn created_non_blocking_and_cloexec() {
        let sock = Socket::new(
            SocketType::Datagram,
            &SocketOptions::none(),
            loopback(),
            &Logger::default(),
        )
        .unwrap();

        let fl = unsafe { libc::fcntl(sock.fd(), libc::F_GETFL) };
        let fd_fl = unsafe { libc::fcntl(sock.fd(), libc::F_GETFD) };

        assert_ne!(fl & libc::O_NONBLOCK, 0);
        assert_ne!(fd_fl & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn source_reports_bound_port() {
        let sock = Socket::new(
            SocketType::Datagram,
            &SocketOptions::default(),
            loopback(),
            &Logger::default(),
        )
        .unwrap();

        let src = sock.source().unwrap();
        assert_eq!(src.family(), Family::Inet);
        assert_ne!(src.port(), Some(0));
    }

    #[test]
    fn family_only_leaves_socket_unbound() {
        let sock = Socket::new(
            SocketType::Datagram,
            &SocketOptions::none(),
            BindTarget::Family(Family::Inet),
            &Logger::default(),
        )
        .unwrap();

        assert_eq!(sock.source().unwrap().port(), Some(0));
    }

    #[test]
    fn bind_conflict_is_bind_error() {
        let first = Socket::new(
            SocketType::Stream,
            &SocketOptions::none(),
            loopback(),
            &Logger::default(),
        )
        .unwrap();
        let taken = first.source().unwrap();

        // Listening makes the address unavailable even with SO_REUSEADDR.
        assert_eq!(unsafe { libc::listen(first.fd(), 1) }, 0);

        let res = Socket::new(
            SocketType::Stream,
            &SocketOptions::none(),
            BindTarget::Endpoint(taken),
            &Logger::default(),
        );

        match res {
            Err(Error::Bind(err)) => assert_eq!(err.code, libc::EADDRINUSE),
            other => panic!("expected bind error, got {other:?}"),
        }
    }

    #[test]
    fn invalid_option_is_option_error() {
        let res = Socket::new(
            SocketType::Stream,
            &SocketOptions::none().with(-1, 1),
            loopback(),
            &Logger::default(),
        );

        assert!(matches!(res, Err(Error::Option(_))));
    }

    #[test]
    fn peer_of_unconnected_socket_fails() {
        let sock = Socket::new(
            SocketType::Stream,
            &SocketOptions::none(),
            loopback(),
            &Logger::default(),
        )
        .unwrap();

        assert_eq!(sock.peer().unwrap_err().code(), Some(libc::ENOTCONN));
    }
}
