//! Connections: the non-blocking connect state machine and data transfer.
//!
//! A connection created by [Connection::connect] starts in
//! [State::Connecting] unless the kernel completes the connect immediately
//! (always the case for datagram sockets). While connecting it wants write
//! readiness; once writable, [Connection::finish_connect] reads the deferred
//! error status and settles the state for good:
//!
//! ```text
//!              connect() == 0
//!   new ─────────────────────────────────────► Connected
//!    │ EINPROGRESS                                 ▲
//!    ▼                          SO_ERROR == 0      │
//!   Connecting ───── writable ─────────────────────┤
//!                               SO_ERROR != 0      │
//!                             ─────────────────► Failed(code)
//! ```
//!
//! Connections handed out by listeners are already established and start in
//! [State::Connected].

use std::io::IoSlice;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{fmt, mem};

use crate::epoll::{Interest, Pollable};
use crate::error::{OsError, Result, errno};
use crate::log::Logger;
use crate::net::endpoint::{Endpoint, Family, SocketType};
use crate::net::fd::Fd;
use crate::net::socket::{BindTarget, Socket, SocketOptions, is_transient};
use crate::{debug, error};

/// Number of bytes requested from the kernel per `recv` call.
pub const READ_CHUNK: usize = 64 * 1024;

/// Lifecycle state of a [Connection].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    /// The handshake is in progress.
    Connecting,
    /// The connection is established.
    Connected,
    /// The handshake failed with the given OS error code.
    Failed(i32),
}

/// Transport variant of a [Connection].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionKind {
    /// IP byte stream or sequenced packets.
    Stream,
    /// IP datagrams.
    Datagram,
    /// Local (`AF_UNIX`) socket of any type.
    Local,
}

impl ConnectionKind {
    fn of(family: Family, kind: SocketType) -> Self {
        match (family, kind) {
            (Family::Local, _) => ConnectionKind::Local,
            (_, SocketType::Datagram) => ConnectionKind::Datagram,
            _ => ConnectionKind::Stream,
        }
    }
}

/// A message for [Connection::write_message]: optional destination, data
/// segments, ancillary data and `send` flags.
#[derive(Debug, Default)]
pub struct Message<'a> {
    /// Destination, for unconnected datagram use. `None` for connected
    /// sockets.
    pub dest: Option<&'a Endpoint>,
    /// Data segments, sent in order.
    pub bufs: &'a [IoSlice<'a>],
    /// Ancillary (control) data, already encoded as `cmsghdr` records.
    pub control: &'a [u8],
    /// Additional `MSG_*` flags.
    pub flags: libc::c_int,
}

/// A socket with (or acquiring) a remote peer.
pub struct Connection {
    socket: Socket,
    state: State,
    peer: Option<Endpoint>,
    kind: ConnectionKind,
    peer_closed: bool,
}

impl Connection {
    /// Connects a new socket of `kind` to `dst`, with default options and no
    /// explicit source address.
    ///
    /// The connect is issued once, without blocking: check [Connection::state]
    /// and, if still connecting, wait for write readiness and call
    /// [Connection::finish_connect].
    ///
    /// # Errors
    ///
    /// Returns [crate::Error::Connect] if the connect fails for any reason
    /// other than being in progress, or any error of [Socket::new].
    pub fn connect(kind: SocketType, dst: &Endpoint, log: &Logger) -> Result<Self> {
        Self::connect_with(
            kind,
            &SocketOptions::default(),
            BindTarget::Family(dst.family()),
            dst,
            log,
        )
    }

    /// Like [Connection::connect], with explicit socket options and source.
    pub fn connect_with(
        kind: SocketType,
        opts: &SocketOptions,
        bind: BindTarget,
        dst: &Endpoint,
        log: &Logger,
    ) -> Result<Self> {
        Self::connect_socket(Socket::new(kind, opts, bind, log)?, dst)
    }

    /// Issues the connect on a socket that is already created and bound.
    pub(crate) fn connect_socket(socket: Socket, dst: &Endpoint) -> Result<Self> {
        let fd = socket.fd();

        debug!(socket.log, "connecting fd {fd} to {dst}");

        let state = if unsafe { libc::connect(fd, dst.as_ptr(), dst.len()) } == 0 {
            debug!(socket.log, "connected fd {fd} to {dst}");
            State::Connected
        } else {
            let err = OsError::last("connect");
            if err.code != libc::EINPROGRESS {
                error!(socket.log, "failed to connect fd {fd} to {dst}: {err}");
                return Err(crate::Error::Connect(err));
            }

            debug!(socket.log, "connection of fd {fd} to {dst} in progress");
            State::Connecting
        };

        Ok(Self {
            kind: ConnectionKind::of(socket.family(), socket.kind()),
            socket,
            state,
            peer: Some(*dst),
            peer_closed: false,
        })
    }

    /// Wraps an established descriptor (accepted, or a connected per-peer
    /// datagram socket).
    pub(crate) fn established(socket: Socket, peer: Option<Endpoint>) -> Self {
        Self {
            kind: ConnectionKind::of(socket.family(), socket.kind()),
            socket,
            state: State::Connected,
            peer,
            peer_closed: false,
        }
    }

    /// Wraps an accepted descriptor.
    pub(crate) fn accepted(
        fd: Fd,
        family: Family,
        kind: SocketType,
        peer: Endpoint,
        log: &Logger,
    ) -> Self {
        Self::established(Socket::from_fd(fd, family, kind, log), Some(peer))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Returns `true` once the connection is established.
    pub fn is_connected(&self) -> bool {
        self.state == State::Connected
    }

    /// Transport variant.
    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// The endpoint this connection is connected (or connecting) to. Unnamed
    /// local peers have no endpoint.
    pub fn peer(&self) -> Option<&Endpoint> {
        self.peer.as_ref()
    }

    /// The local endpoint, queried from the kernel.
    pub fn source(&self) -> Option<Endpoint> {
        self.socket.source()
    }

    /// The underlying socket.
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Returns `true` once a read observed the orderly shutdown of a stream
    /// peer.
    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Settles a pending connect after write readiness.
    ///
    /// Reads the deferred error status (`SO_ERROR`): anything but zero is the
    /// failure code. With a zero status, a socket that is not yet writable has
    /// not finished its handshake and stays [State::Connecting]; a writable
    /// one is [State::Connected] if it has a peer. A writable socket without a
    /// peer failed after its status was already read elsewhere, and settles
    /// as `Failed(ENOTCONN)`. Terminal states are returned as is, without
    /// querying the socket again.
    ///
    /// # Errors
    ///
    /// Returns [crate::Error::Option] if the status could not be read.
    pub fn finish_connect(&mut self) -> Result<State> {
        if self.state != State::Connecting {
            return Ok(self.state);
        }

        let fd = self.socket.fd();
        let code = self.socket.take_error()?;

        if code != 0 {
            error!(
                self.socket.log,
                "failed to finalize connection of fd {fd}: {}",
                std::io::Error::from_raw_os_error(code)
            );
            self.state = State::Failed(code);
            return Ok(self.state);
        }

        if !self.socket.wait_for(Interest::WRITABLE, Some(Duration::ZERO))? {
            debug!(self.socket.log, "connection of fd {fd} still in progress");
            return Ok(self.state);
        }

        match self.socket.peer() {
            Ok(_) => {
                debug!(self.socket.log, "connection of fd {fd} finished");
                self.state = State::Connected;
            }
            Err(err) if err.code() == Some(libc::ENOTCONN) => {
                error!(
                    self.socket.log,
                    "connection of fd {fd} failed with its error status already consumed"
                );
                self.state = State::Failed(libc::ENOTCONN);
            }
            Err(err) => {
                let code = err.code().unwrap_or(libc::EIO);
                error!(self.socket.log, "failed to finalize connection of fd {fd}: {err}");
                self.state = State::Failed(code);
            }
        }

        Ok(self.state)
    }

    /// Blocks up to `timeout` for write readiness (or an error condition),
    /// e.g. to force a handshake to resolve. Uses a throwaway epoll instance;
    /// registrations made by the caller are left alone.
    ///
    /// Returns `true` if the socket became ready within the timeout.
    pub fn wait_ready(&self, timeout: Option<Duration>) -> Result<bool> {
        self.socket.wait_for(Interest::WRITABLE, timeout)
    }

    /// Drains all currently available data into a new buffer.
    ///
    /// See [Connection::read_into].
    pub fn read(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.read_into(&mut buf)?;
        Ok(buf)
    }

    /// Drains all currently available data, appending it to `buf`, and returns
    /// the number of bytes appended. Never blocks.
    ///
    /// Reading stops when the kernel has nothing more for now, or when a
    /// stream peer shut down (see [Connection::peer_closed]). On datagram
    /// sockets each `recv` yields one datagram, and empty datagrams are
    /// skipped over.
    ///
    /// # Errors
    ///
    /// Returns [crate::Error::Read] on any other failure. Data appended before
    /// the failure stays in `buf`.
    pub fn read_into(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        let fd = self.socket.fd();
        let stream_like = self.socket.kind().is_connection_oriented();
        let start = buf.len();

        loop {
            let offset = buf.len();
            buf.resize(offset + READ_CHUNK, 0);

            let nbytes = unsafe {
                libc::recv(
                    fd,
                    buf[offset..].as_mut_ptr() as *mut libc::c_void,
                    READ_CHUNK,
                    0,
                )
            };

            if nbytes > 0 {
                buf.truncate(offset + nbytes as usize);
                continue;
            }

            buf.truncate(offset);

            if nbytes == 0 {
                if stream_like {
                    debug!(self.socket.log, "fd {fd} closed by peer");
                    self.peer_closed = true;
                    break;
                }
                continue;
            }

            let err = OsError::last("recv");
            if err.code == libc::EINTR {
                continue;
            }
            if is_transient(err.code) {
                break;
            }

            error!(self.socket.log, "failed to read from fd {fd}: {err}");
            return Err(crate::Error::Read(err));
        }

        let total = buf.len() - start;
        if total > 0 {
            debug!(self.socket.log, "read {total} bytes from fd {fd}");
        }

        Ok(total)
    }

    /// Sends `data`, returning the number of bytes the kernel accepted (which
    /// may be less than `data.len()`, or 0 if the socket buffer is full).
    ///
    /// # Errors
    ///
    /// Returns [crate::Error::Write] on any failure other than a full buffer.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.write_vectored(&[IoSlice::new(data)])
    }

    /// Sends a list of segments as one message. See [Connection::write].
    pub fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        self.write_message(&Message {
            bufs,
            ..Default::default()
        })
    }

    /// Sends a full message descriptor. See [Connection::write].
    pub fn write_message(&self, msg: &Message<'_>) -> Result<usize> {
        let fd = self.socket.fd();

        let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
        if let Some(dest) = msg.dest {
            hdr.msg_name = dest.as_ptr() as *mut libc::c_void;
            hdr.msg_namelen = dest.len();
        }
        // `IoSlice` is ABI compatible with `iovec`.
        hdr.msg_iov = msg.bufs.as_ptr() as *mut libc::iovec;
        hdr.msg_iovlen = msg.bufs.len() as _;
        if !msg.control.is_empty() {
            hdr.msg_control = msg.control.as_ptr() as *mut libc::c_void;
            hdr.msg_controllen = msg.control.len() as _;
        }

        let flags = msg.flags | libc::MSG_NOSIGNAL;

        loop {
            let nbytes = unsafe { libc::sendmsg(fd, &hdr, flags) };
            if nbytes >= 0 {
                debug!(self.socket.log, "sent {nbytes} bytes to fd {fd}");
                return Ok(nbytes as usize);
            }

            let err = OsError::last("sendmsg");
            if err.code == libc::EINTR {
                continue;
            }
            if is_transient(err.code) {
                return Ok(0);
            }

            error!(self.socket.log, "failed to write to fd {fd}: {err}");
            return Err(crate::Error::Write(err));
        }
    }

    /// Shuts down both halves of the connection (`shutdown(SHUT_RDWR)`). The
    /// descriptor stays open until the connection is dropped.
    ///
    /// # Errors
    ///
    /// Returns [crate::Error::Write] if the shutdown fails.
    pub fn shutdown(&self) -> Result<()> {
        if unsafe { libc::shutdown(self.socket.fd(), libc::SHUT_RDWR) } == -1 {
            return Err(errno!(Write, "shutdown"));
        }

        Ok(())
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.fd()
    }
}

impl Pollable for Connection {
    /// Write readiness while connecting, read readiness afterwards.
    fn interest(&self) -> Interest {
        match self.state {
            State::Connecting => Interest::WRITABLE,
            State::Connected | State::Failed(_) => Interest::READABLE,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.socket.fd())
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("peer", &self.peer)
            .finish()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, peer: ", self.socket)?;
        match self.peer {
            Some(ref ep) => write!(f, "{ep}"),
            None => write!(f, "(unnamed)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::net::socket::SocketOptions;
    use std::net::SocketAddr;

    fn loopback(port: u16) -> Endpoint {
        Endpoint::from(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    /// A bound TCP port nobody listens on.
    fn closed_port() -> (Socket, Endpoint) {
        let sock = Socket::new(
            SocketType::Stream,
            &SocketOptions::none(),
            BindTarget::Endpoint(loopback(0)),
            &Logger::default(),
        )
        .unwrap();
        let ep = sock.source().unwrap();
        (sock, ep)
    }

    #[test]
    fn connect_without_listener_fails() {
        let (_guard, dst) = closed_port();

        match Connection::connect(SocketType::Stream, &dst, &Logger::default()) {
            Err(Error::Connect(err)) => assert_ne!(err.code, 0),
            Err(err) => panic!("unexpected error: {err}"),
            Ok(mut conn) => {
                assert_eq!(conn.state(), State::Connecting);
                assert_eq!(conn.interest(), Interest::WRITABLE);
                assert!(conn.wait_ready(Some(Duration::from_secs(5))).unwrap());

                let state = conn.finish_connect().unwrap();
                match state {
                    State::Failed(code) => assert_ne!(code, 0),
                    other => panic!("expected failure, got {other:?}"),
                }

                // The result is settled once and for all.
                assert_eq!(conn.finish_connect().unwrap(), state);
                assert_eq!(conn.state(), state);
            }
        }
    }

    #[test]
    fn consumed_error_status_still_fails() {
        let (_guard, dst) = closed_port();

        let Ok(mut conn) = Connection::connect(SocketType::Stream, &dst, &Logger::default()) else {
            return;
        };
        assert!(conn.wait_ready(Some(Duration::from_secs(5))).unwrap());

        // Read the status behind the connection's back.
        let code = conn.socket().option(libc::SOL_SOCKET, libc::SO_ERROR).unwrap();
        assert_ne!(code, 0);

        assert_eq!(conn.finish_connect().unwrap(), State::Failed(libc::ENOTCONN));
        assert_eq!(conn.interest(), Interest::READABLE);
    }

    #[test]
    fn datagram_connect_is_immediate() {
        let (_guard, dst) = closed_port();
        let conn = Connection::connect(SocketType::Datagram, &dst, &Logger::default()).unwrap();

        assert_eq!(conn.state(), State::Connected);
        assert_eq!(conn.kind(), ConnectionKind::Datagram);
        assert_eq!(conn.peer(), Some(&dst));
        assert_eq!(conn.interest(), Interest::READABLE);
    }

    #[test]
    fn read_on_idle_connection_is_empty() {
        let (_guard, dst) = closed_port();
        let mut conn = Connection::connect(SocketType::Datagram, &dst, &Logger::default()).unwrap();

        assert!(conn.read().unwrap().is_empty());
        assert!(!conn.peer_closed());
    }

    #[test]
    fn datagram_pair_exchanges_vectored_writes() {
        let log = Logger::default();
        let a = Socket::new(
            SocketType::Datagram,
            &SocketOptions::default(),
            BindTarget::Endpoint(loopback(0)),
            &log,
        )
        .unwrap();
        let a_ep = a.source().unwrap();

        let b = Connection::connect(SocketType::Datagram, &a_ep, &log).unwrap();
        let b_ep = b.source().unwrap();

        // Connect `a` back to `b` so both sides are connections.
        assert_eq!(unsafe { libc::connect(a.fd(), b_ep.as_ptr(), b_ep.len()) }, 0);
        let mut a = Connection::established(a, Some(b_ep));

        let sent = b
            .write_vectored(&[IoSlice::new(b"hello "), IoSlice::new(b"world")])
            .unwrap();
        assert_eq!(sent, 11);

        assert!(a.socket().wait_for(Interest::READABLE, Some(Duration::from_secs(1))).unwrap());
        assert_eq!(a.read().unwrap(), b"hello world");
    }

    #[test]
    fn message_with_destination() {
        let log = Logger::default();
        let rx = Socket::new(
            SocketType::Datagram,
            &SocketOptions::default(),
            BindTarget::Endpoint(loopback(0)),
            &log,
        )
        .unwrap();
        let rx_ep = rx.source().unwrap();
        let mut rx = Connection::established(rx, None);

        // An unconnected datagram socket needs an explicit destination.
        let tx = Connection::established(
            Socket::new(
                SocketType::Datagram,
                &SocketOptions::none(),
                BindTarget::Family(Family::Inet),
                &log,
            )
            .unwrap(),
            None,
        );

        let bufs = [IoSlice::new(b"ping")];
        let sent = tx
            .write_message(&Message {
                dest: Some(&rx_ep),
                bufs: &bufs,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(sent, 4);

        assert!(rx.socket().wait_for(Interest::READABLE, Some(Duration::from_secs(1))).unwrap());
        assert_eq!(rx.read().unwrap(), b"ping");
    }

    #[test]
    fn write_without_destination_fails() {
        let conn = Connection::established(
            Socket::new(
                SocketType::Datagram,
                &SocketOptions::none(),
                BindTarget::Family(Family::Inet),
                &Logger::default(),
            )
            .unwrap(),
            None,
        );

        match conn.write(b"lost") {
            Err(Error::Write(err)) => assert_eq!(err.code, libc::EDESTADDRREQ),
            other => panic!("expected write error, got {other:?}"),
        }
    }

    #[test]
    fn connect_to_listener_converges() {
        let log = Logger::default();
        let listener = crate::net::listener::StreamListener::bind(
            BindTarget::Endpoint(loopback(0)),
            &log,
        )
        .unwrap();
        let dst = listener.socket().source().unwrap();

        let mut conn = Connection::connect(SocketType::Stream, &dst, &log).unwrap();
        assert_eq!(conn.kind(), ConnectionKind::Stream);

        if conn.state() == State::Connecting {
            assert!(conn.wait_ready(Some(Duration::from_secs(5))).unwrap());
        }
        assert_eq!(conn.finish_connect().unwrap(), State::Connected);
        assert!(conn.is_connected());
        assert_eq!(conn.interest(), Interest::READABLE);

        // Later calls never revisit the outcome.
        for _ in 0..3 {
            assert_eq!(conn.finish_connect().unwrap(), State::Connected);
        }
        assert_eq!(conn.socket().peer().unwrap(), dst);
    }

    #[test]
    fn dropped_descriptor_delivers_no_event() {
        use crate::epoll::Epoll;

        let log = Logger::default();
        let (_guard, dst) = closed_port();
        let epoll = Epoll::new(&log).unwrap();

        for _ in 0..32 {
            let conn = Connection::connect(SocketType::Datagram, &dst, &log).unwrap();
            let fd = conn.as_raw_fd();

            // Datagram sockets are always writable.
            epoll.register(fd, Interest::WRITABLE, fd as u64).unwrap();
            assert_eq!(epoll.poll(Some(Duration::ZERO)).unwrap().len(), 1);

            drop(conn);
            assert!(epoll.poll(Some(Duration::ZERO)).unwrap().is_empty());
        }
    }
}
