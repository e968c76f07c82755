//! Listeners: accepting peers with admission control.
//!
//! A stream listener hands out the connections queued by the kernel. A
//! datagram listener has no such queue, so it emulates one: every pending
//! datagram names a candidate peer, and an admitted peer gets its own socket
//! bound to the listener's address and connected to that peer. From then on
//! the kernel routes the peer's traffic to the dedicated socket.
//!
//! Between its bind and its connect, a per-peer socket competes with the
//! listener for every incoming datagram. Whatever it catches in that window
//! is drained right after the connect: datagrams from its own peer extend
//! the handshake, all others are handed back to the listener and come out of
//! its next pull as candidates.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::unix::io::{AsRawFd, RawFd};
use std::{fmt, mem};

use crate::epoll::{Interest, Pollable};
use crate::error::{EndpointError, OsError, Result, errno};
use crate::log::Logger;
use crate::net::connection::{Connection, READ_CHUNK};
use crate::net::endpoint::{Endpoint, SocketType};
use crate::net::fd::Fd;
use crate::net::socket::{BindTarget, Socket, SocketOptions, is_transient};
use crate::{debug, error, info, warn};

/// Backlog passed to `listen`.
pub const LISTEN_BACKLOG: libc::c_int = 16;

/// Verdict of an admission policy on a candidate peer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Create a connection for the peer.
    Admit,
    /// The peer is already served; discard the candidate.
    AlreadyKnown,
    /// Reject the peer; discard the candidate.
    Deny,
}

/// Listener for connection-oriented sockets (byte streams and sequenced
/// packets), over any family.
#[derive(Debug)]
pub struct StreamListener {
    socket: Socket,
}

impl StreamListener {
    /// Creates a byte-stream listener with default options.
    pub fn bind(bind: BindTarget, log: &Logger) -> Result<Self> {
        Self::with_options(SocketType::Stream, &SocketOptions::default(), bind, log)
    }

    /// Creates a listener of `kind` with explicit socket options.
    ///
    /// # Errors
    ///
    /// Returns [crate::Error::Listen] if `listen` fails, or any error of
    /// [Socket::new].
    pub fn with_options(
        kind: SocketType,
        opts: &SocketOptions,
        bind: BindTarget,
        log: &Logger,
    ) -> Result<Self> {
        let socket = Socket::new(kind, opts, bind, log)?;

        if unsafe { libc::listen(socket.fd(), LISTEN_BACKLOG) } == -1 {
            let err = errno!(Listen, "listen");
            error!(socket.log, "failed to listen on fd {}: {err}", socket.fd());
            return Err(err);
        }

        info!(socket.log, "listening on {socket}");
        Ok(Self { socket })
    }

    /// The underlying socket.
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    fn next_pending(&self) -> Result<Option<(Endpoint, Vec<u8>, Option<Fd>)>> {
        let fd = self.socket.fd();

        loop {
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

            let raw = unsafe {
                libc::accept4(
                    fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };

            if raw == -1 {
                let err = OsError::last("accept4");
                match err.code {
                    libc::EINTR | libc::ECONNABORTED => continue,
                    code if is_transient(code) => return Ok(None),
                    _ => {
                        error!(self.socket.log, "failed to accept on fd {fd}: {err}");
                        return Err(crate::Error::Accept(err));
                    }
                }
            }

            let conn_fd = unsafe { Fd::from_raw(raw) };
            let peer = unsafe {
                Endpoint::from_raw(&storage as *const _ as *const libc::sockaddr, len)
            }?;

            debug!(self.socket.log, "fd {fd} has pending peer {peer} on fd {raw}");
            return Ok(Some((peer, Vec::new(), Some(conn_fd))));
        }
    }
}

/// Listener for datagram sockets, emulating per-peer connections. IP
/// families only.
#[derive(Debug)]
pub struct DatagramListener {
    socket: Socket,
    strays: RefCell<VecDeque<(Endpoint, Vec<u8>)>>,
}

impl DatagramListener {
    /// Creates a datagram listener bound with `SO_REUSEADDR` and
    /// `SO_REUSEPORT`.
    ///
    /// # Errors
    ///
    /// Returns [crate::Error::Endpoint] for a local family, or any error of
    /// [Socket::new].
    pub fn bind(bind: BindTarget, log: &Logger) -> Result<Self> {
        let family = bind.family();
        if !family.is_inet() {
            return Err(EndpointError::UnsupportedFamily(family.as_raw()).into());
        }

        let opts = SocketOptions::default().with(libc::SO_REUSEPORT, 1);
        let socket = Socket::new(SocketType::Datagram, &opts, bind, log)?;

        info!(socket.log, "listening for datagrams on {socket}");
        Ok(Self {
            socket,
            strays: RefCell::new(VecDeque::new()),
        })
    }

    /// The underlying socket.
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    fn next_pending(&self) -> Result<Option<(Endpoint, Vec<u8>, Option<Fd>)>> {
        if let Some((peer, data)) = self.strays.borrow_mut().pop_front() {
            return Ok(Some((peer, data, None)));
        }

        let Some((peer, data)) = recv_from(&self.socket, crate::Error::Accept)? else {
            return Ok(None);
        };

        debug!(
            self.socket.log,
            "fd {} has pending peer {peer} with {} bytes of handshake",
            self.socket.fd(),
            data.len()
        );
        Ok(Some((peer, data, None)))
    }

    /// Creates the per-peer socket: same local address, connected to `peer`.
    /// Returns it with the datagrams `peer` sent before the connect.
    fn connect_peer(&self, peer: &Endpoint) -> Result<(Connection, Vec<u8>)> {
        let src = self.socket.source().ok_or_else(|| {
            crate::Error::Resource(OsError::new("getsockname", libc::EBADF))
        })?;

        let opts = SocketOptions::none().with(libc::SO_REUSEADDR, 1);
        let socket = Socket::new(
            SocketType::Datagram,
            &opts,
            BindTarget::Endpoint(src),
            &self.socket.log,
        )?;

        self.claim(socket, peer)
    }

    /// Connects a socket bound to the listener's address to `peer`, then
    /// sorts out what it received while still unconnected.
    fn claim(&self, socket: Socket, peer: &Endpoint) -> Result<(Connection, Vec<u8>)> {
        let conn = Connection::connect_socket(socket, peer)?;
        let mut early = Vec::new();

        loop {
            match recv_from(conn.socket(), crate::Error::Read) {
                Ok(Some((from, data))) if from == *peer => early.extend_from_slice(&data),
                Ok(Some((from, data))) => {
                    debug!(
                        self.socket.log,
                        "returning {} bytes from {from} caught by {conn} to the listener",
                        data.len()
                    );
                    self.strays.borrow_mut().push_back((from, data));
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(self.socket.log, "failed to drain {conn}: {err}");
                    break;
                }
            }
        }

        debug!(self.socket.log, "created {conn} for datagram peer");
        Ok((conn, early))
    }
}

/// Receives one datagram with its source from a non-blocking socket.
/// `Ok(None)` once nothing is queued.
fn recv_from(
    socket: &Socket,
    fail: fn(OsError) -> crate::Error,
) -> Result<Option<(Endpoint, Vec<u8>)>> {
    let fd = socket.fd();
    let mut data = vec![0u8; READ_CHUNK];

    loop {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: data.as_mut_ptr() as *mut libc::c_void,
            iov_len: data.len(),
        };

        let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
        hdr.msg_name = &mut storage as *mut _ as *mut libc::c_void;
        hdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        hdr.msg_iov = &raw mut iov;
        hdr.msg_iovlen = 1;

        let nbytes = unsafe { libc::recvmsg(fd, &mut hdr, 0) };
        if nbytes == -1 {
            let err = OsError::last("recvmsg");
            match err.code {
                libc::EINTR => continue,
                code if is_transient(code) => return Ok(None),
                _ => {
                    error!(socket.log, "failed to read from {socket}: {err}");
                    return Err(fail(err));
                }
            }
        }

        data.truncate(nbytes as usize);
        let from = unsafe {
            Endpoint::from_raw(
                &storage as *const _ as *const libc::sockaddr,
                hdr.msg_namelen,
            )
        }?;

        return Ok(Some((from, data)));
    }
}

/// A bound socket accepting peers.
pub enum Listener {
    /// Byte-stream or sequenced-packet listener.
    Stream(StreamListener),
    /// Datagram listener with per-peer emulation.
    Datagram(DatagramListener),
}

impl Listener {
    /// Creates a listener of `kind` with default options: a
    /// [DatagramListener] for datagrams, a [StreamListener] otherwise.
    pub fn bind(kind: SocketType, bind: BindTarget, log: &Logger) -> Result<Self> {
        match kind {
            SocketType::Datagram => DatagramListener::bind(bind, log).map(Listener::Datagram),
            _ => StreamListener::with_options(kind, &SocketOptions::default(), bind, log)
                .map(Listener::Stream),
        }
    }

    /// The underlying socket.
    pub fn socket(&self) -> &Socket {
        match self {
            Listener::Stream(l) => &l.socket,
            Listener::Datagram(l) => &l.socket,
        }
    }

    /// The local endpoint the listener is bound to.
    pub fn source(&self) -> Option<Endpoint> {
        self.socket().source()
    }

    /// Returns a lazy iterator over the peers pending right now.
    ///
    /// Each item is a [Pending] candidate to be admitted or dropped. The
    /// iterator ends when nothing more is pending, or after yielding an error.
    pub fn incoming(&self) -> Incoming<'_> {
        Incoming {
            listener: self,
            done: false,
        }
    }

    /// Admits every pending peer, passing each new connection and its
    /// handshake bytes to `on_accepted`. Returns the number of admitted
    /// peers.
    pub fn accept<F>(&self, on_accepted: F) -> Result<usize>
    where
        F: FnMut(Connection, &[u8]),
    {
        self.accept_with(on_accepted, |_, _| Admission::Admit)
    }

    /// Like [Listener::accept], but asks `admission` about every candidate
    /// before creating its connection. Candidates that are not admitted are
    /// discarded without calling `on_accepted`.
    ///
    /// # Errors
    ///
    /// Returns [crate::Error::Accept] if pulling a candidate fails, or the
    /// error that prevented creating an admitted peer's connection.
    pub fn accept_with<F, A>(&self, mut on_accepted: F, mut admission: A) -> Result<usize>
    where
        F: FnMut(Connection, &[u8]),
        A: FnMut(&Endpoint, &[u8]) -> Admission,
    {
        let log = &self.socket().log;
        let mut admitted = 0;

        for pending in self.incoming() {
            let pending = pending?;

            match admission(&pending.peer, &pending.handshake) {
                Admission::Admit => {
                    let (conn, handshake) = pending.admit_with_handshake()?;
                    admitted += 1;
                    on_accepted(conn, &handshake);
                }
                Admission::AlreadyKnown => {
                    debug!(log, "peer {} already known", pending.peer);
                }
                Admission::Deny => {
                    debug!(log, "peer {} denied", pending.peer);
                }
            }
        }

        Ok(admitted)
    }

    fn next_pending(&self) -> Result<Option<(Endpoint, Vec<u8>, Option<Fd>)>> {
        match self {
            Listener::Stream(l) => l.next_pending(),
            Listener::Datagram(l) => l.next_pending(),
        }
    }
}

impl From<StreamListener> for Listener {
    fn from(l: StreamListener) -> Self {
        Listener::Stream(l)
    }
}

impl From<DatagramListener> for Listener {
    fn from(l: DatagramListener) -> Self {
        Listener::Datagram(l)
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.socket().fd()
    }
}

impl Pollable for Listener {
    fn interest(&self) -> Interest {
        Interest::READABLE
    }

    fn can_accept(&self) -> bool {
        true
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Listener::Stream(_) => "Listener::Stream",
            Listener::Datagram(_) => "Listener::Datagram",
        };
        f.debug_tuple(name).field(self.socket()).finish()
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener {}", self.socket())
    }
}

/// Iterator returned by [Listener::incoming].
#[derive(Debug)]
pub struct Incoming<'a> {
    listener: &'a Listener,
    done: bool,
}

impl<'a> Iterator for Incoming<'a> {
    type Item = Result<Pending<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.listener.next_pending() {
            Ok(Some((peer, handshake, fd))) => Some(Ok(Pending {
                listener: self.listener,
                peer,
                handshake,
                fd,
            })),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// A candidate peer. Dropping it denies the peer and releases any
/// descriptor already allocated for it.
pub struct Pending<'a> {
    listener: &'a Listener,
    peer: Endpoint,
    handshake: Vec<u8>,
    fd: Option<Fd>,
}

impl Pending<'_> {
    /// The candidate's address.
    pub fn peer(&self) -> &Endpoint {
        &self.peer
    }

    /// Data that came with the candidate: the first datagram for datagram
    /// listeners, empty for stream listeners.
    pub fn handshake(&self) -> &[u8] {
        &self.handshake
    }

    /// Creates the connection for this peer.
    pub fn admit(self) -> Result<Connection> {
        self.admit_with_handshake().map(|(conn, _)| conn)
    }

    /// Like [Pending::admit], also returning the handshake. For a datagram
    /// peer it is extended by whatever the peer sent while its connection
    /// was being set up.
    pub fn admit_with_handshake(self) -> Result<(Connection, Vec<u8>)> {
        let Pending {
            listener,
            peer,
            mut handshake,
            fd,
        } = self;

        let conn = match (listener, fd) {
            (Listener::Stream(l), Some(fd)) => {
                let socket = &l.socket;
                // Unbound local clients have no name worth keeping.
                let conn = if peer.is_unnamed() {
                    Connection::established(
                        Socket::from_fd(fd, socket.family(), socket.kind(), &socket.log),
                        None,
                    )
                } else {
                    Connection::accepted(fd, socket.family(), socket.kind(), peer, &socket.log)
                };
                debug!(socket.log, "accepted {conn}");
                conn
            }
            (Listener::Datagram(l), _) => {
                let (conn, early) = l.connect_peer(&peer)?;
                handshake.extend_from_slice(&early);
                conn
            }
            (Listener::Stream(_), None) => {
                return Err(crate::Error::Accept(OsError::new("accept4", libc::EBADF)));
            }
        };

        Ok((conn, handshake))
    }
}

impl fmt::Debug for Pending<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("peer", &self.peer)
            .field("handshake", &self.handshake.len())
            .finish()
    }
}
