//! A dispatcher grouping connections and listeners behind one descriptor.
//!
//! The hub owns three epoll instances. Connections still completing their
//! handshake wait for write readiness in the "connecting" instance; connected
//! peers and listeners wait for read readiness in the "ready" instance. Both
//! are nested into the main instance, whose descriptor is what the
//! application waits on (directly through [Hub::poll], or by nesting the hub
//! itself into an outer [Epoll]).
//!
//! Data given to [Hub::send_all] that the kernel does not take at once waits
//! in a per-connection backlog. The connection then also wants write
//! readiness, and the backlog is flushed by [Hub::poll].

use std::collections::{HashMap, HashSet, VecDeque};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{fmt, mem};

use crate::epoll::{Epoll, Interest, Pollable};
use crate::error::{OsError, Result};
use crate::log::Logger;
use crate::net::connection::{Connection, State};
use crate::net::endpoint::{Endpoint, SocketType};
use crate::net::listener::{Admission, Listener};
use crate::{debug, error, info, warn};

const CONNECTING: u64 = 0;
const READY: u64 = 1;

/// Identifies a connection or a listener owned by a [Hub].
///
/// Tokens are descriptor numbers: once the hub reports a connection as failed
/// or closed, its token may be handed out again.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Token(RawFd);

impl Token {
    /// The descriptor behind the token.
    pub fn fd(self) -> RawFd {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Something that happened during [Hub::poll].
#[derive(Debug)]
pub enum Notice<'a> {
    /// An outgoing connection completed its handshake.
    Connected(Token),
    /// A connection failed with the given OS error code and was dropped.
    Failed(Token, i32),
    /// A listener admitted a new peer.
    Accepted {
        /// The listener that admitted the peer.
        listener: Token,
        /// The new connection.
        token: Token,
        /// The peer's address, if it has one.
        peer: Option<Endpoint>,
        /// Data that came with the peer (first datagram).
        handshake: &'a [u8],
    },
    /// Data arrived on a connection.
    Data(Token, &'a [u8]),
    /// The peer shut the connection down and it was dropped.
    Closed(Token),
}

type Policy = Box<dyn FnMut(&Endpoint, &[u8]) -> Admission>;

/// Owner of a set of connections and listeners, dispatching their readiness.
pub struct Hub {
    main: Epoll,
    connecting: Epoll,
    ready: Epoll,
    connections: HashMap<RawFd, Connection>,
    listeners: HashMap<RawFd, Listener>,
    backlogs: HashMap<RawFd, VecDeque<Vec<u8>>>,
    queued: Vec<Token>,
    admission: Option<Policy>,
    log: Logger,
}

impl Hub {
    /// Creates an empty hub.
    ///
    /// # Errors
    ///
    /// Returns [crate::Error::Resource] or [crate::Error::Poll] if the epoll
    /// instances could not be set up.
    pub fn new(log: &Logger) -> Result<Self> {
        let main = Epoll::new(log)?;
        let connecting = Epoll::new(log)?;
        let ready = Epoll::new(log)?;

        main.register(connecting.as_raw_fd(), Interest::READABLE, CONNECTING)?;
        main.register(ready.as_raw_fd(), Interest::READABLE, READY)?;

        Ok(Self {
            main,
            connecting,
            ready,
            connections: HashMap::new(),
            listeners: HashMap::new(),
            backlogs: HashMap::new(),
            queued: Vec::new(),
            admission: None,
            log: log.clone(),
        })
    }

    /// Sets the policy consulted for every new peer of every listener.
    ///
    /// Datagram peers that already have a connection in the hub are never
    /// passed to the policy; they are treated as [Admission::AlreadyKnown].
    pub fn set_admission<A>(&mut self, policy: A)
    where
        A: FnMut(&Endpoint, &[u8]) -> Admission + 'static,
    {
        self.admission = Some(Box::new(policy));
    }

    /// Starts connecting to `dst`.
    ///
    /// Connections that complete immediately (e.g., datagram sockets) are
    /// reported as [Notice::Connected] by the next [Hub::poll]; the hub's own
    /// descriptor does not signal them.
    pub fn connect(&mut self, kind: SocketType, dst: &Endpoint) -> Result<Token> {
        let conn = Connection::connect(kind, dst, &self.log)?;
        let fd = conn.as_raw_fd();

        match conn.state() {
            State::Connecting => self.connecting.register(fd, Interest::WRITABLE, fd as u64)?,
            _ => {
                self.ready.register(fd, Interest::READABLE, fd as u64)?;
                self.queued.push(Token(fd));
            }
        }

        self.connections.insert(fd, conn);
        Ok(Token(fd))
    }

    /// Tries each endpoint in turn until a connect attempt does not fail
    /// immediately.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt, or [crate::Error::Connect] with
    /// `EDESTADDRREQ` if `endpoints` was empty.
    pub fn connect_first<I>(&mut self, kind: SocketType, endpoints: I) -> Result<Token>
    where
        I: IntoIterator<Item = Endpoint>,
    {
        let mut last = None;

        for dst in endpoints {
            match self.connect(kind, &dst) {
                Ok(token) => return Ok(token),
                Err(err) => {
                    warn!(self.log, "skipping {dst}: {err}");
                    last = Some(err);
                }
            }
        }

        Err(last.unwrap_or(crate::Error::Connect(OsError::new(
            "connect",
            libc::EDESTADDRREQ,
        ))))
    }

    /// Adds a listener; its peers are reported as [Notice::Accepted].
    pub fn listen(&mut self, listener: Listener) -> Result<Token> {
        let fd = listener.as_raw_fd();
        self.ready.register(fd, listener.interest(), fd as u64)?;

        info!(self.log, "hub serving {listener}");
        self.listeners.insert(fd, listener);
        Ok(Token(fd))
    }

    /// Returns the connection behind `token`.
    pub fn connection(&self, token: Token) -> Option<&Connection> {
        self.connections.get(&token.0)
    }

    /// Returns the listener behind `token`.
    pub fn listener(&self, token: Token) -> Option<&Listener> {
        self.listeners.get(&token.0)
    }

    /// Number of connections, in any state.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns `true` if the hub holds no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Drops the connection or listener behind `token`. Returns `false` if
    /// there was none.
    pub fn close(&mut self, token: Token) -> bool {
        self.queued.retain(|t| *t != token);
        self.forget(token.0).is_some() || self.listeners.remove(&token.0).is_some()
    }

    fn forget(&mut self, fd: RawFd) -> Option<Connection> {
        self.backlogs.remove(&fd);
        self.connections.remove(&fd)
    }

    /// Writes `data` to one connection. A connection whose write fails is
    /// dropped. Returns what the kernel took, which may be less than `data`;
    /// see [Hub::send_all] to keep the rest. Data waiting in the backlog is
    /// not looked at.
    ///
    /// # Errors
    ///
    /// Returns [crate::Error::Write] with `ENOTCONN` if `token` names no
    /// connected peer, or the write error.
    pub fn send(&mut self, token: Token, data: &[u8]) -> Result<usize> {
        let conn = match self.connections.get(&token.0) {
            Some(conn) if conn.is_connected() => conn,
            _ => return Err(crate::Error::Write(OsError::new("sendmsg", libc::ENOTCONN))),
        };

        let res = conn.write(data);
        if res.is_err() {
            self.forget(token.0);
        }
        res
    }

    /// Writes all of `data` to one connection, now or later. What the kernel
    /// does not take right away is appended to the connection's backlog and
    /// written, in order, as the connection becomes writable during
    /// [Hub::poll]. Datagrams are never split. Returns the number of bytes
    /// still waiting.
    ///
    /// # Errors
    ///
    /// Same as [Hub::send].
    pub fn send_all(&mut self, token: Token, data: &[u8]) -> Result<usize> {
        let fd = token.0;
        let sent = if self.backlogs.contains_key(&fd) {
            match self.connections.get(&fd) {
                Some(conn) if conn.is_connected() => 0,
                _ => return Err(crate::Error::Write(OsError::new("sendmsg", libc::ENOTCONN))),
            }
        } else {
            self.send(token, data)?
        };

        if sent < data.len() {
            if !self.backlogs.contains_key(&fd) {
                self.ready
                    .modify(fd, Interest::READABLE | Interest::WRITABLE, fd as u64)?;
            }
            self.backlogs
                .entry(fd)
                .or_default()
                .push_back(data[sent..].to_vec());
        }

        Ok(self.backlog(token))
    }

    /// Number of bytes given to [Hub::send_all] that are still waiting for
    /// the connection behind `token`.
    pub fn backlog(&self, token: Token) -> usize {
        self.backlogs
            .get(&token.0)
            .map_or(0, |chunks| chunks.iter().map(Vec::len).sum())
    }

    fn flush(&mut self, fd: RawFd) -> Result<()> {
        let (Some(conn), Some(chunks)) = (self.connections.get(&fd), self.backlogs.get_mut(&fd))
        else {
            return Ok(());
        };

        while let Some(chunk) = chunks.front_mut() {
            let n = conn.write(chunk.as_slice())?;
            if n == 0 {
                break;
            }
            if n < chunk.len() {
                chunk.drain(..n);
                break;
            }
            chunks.pop_front();
        }

        if chunks.is_empty() {
            self.backlogs.remove(&fd);
            self.ready.modify(fd, Interest::READABLE, fd as u64)?;
            debug!(self.log, "backlog of {} flushed", Token(fd));
        }

        Ok(())
    }

    /// Writes `data` to every connected peer, dropping the connections whose
    /// write fails. Returns the number of peers written to.
    pub fn broadcast(&mut self, data: &[u8]) -> usize {
        let mut failed = Vec::new();
        let mut sent = 0;

        for (fd, conn) in &self.connections {
            if !conn.is_connected() {
                continue;
            }

            match conn.write(data) {
                Ok(n) => {
                    if n < data.len() {
                        warn!(self.log, "short write to {conn}: {n} of {} bytes", data.len());
                    }
                    sent += 1;
                }
                Err(err) => {
                    error!(self.log, "dropping {conn}: {err}");
                    failed.push(*fd);
                }
            }
        }

        for fd in failed {
            self.forget(fd);
        }

        sent
    }

    /// Waits up to `timeout` for activity and reports it to `on_notice`.
    /// Returns the number of notices delivered.
    ///
    /// Failed and closed connections are dropped before any later event is
    /// looked at, so a recycled descriptor never receives a stale event.
    pub fn poll<F>(&mut self, timeout: Option<Duration>, mut on_notice: F) -> Result<usize>
    where
        F: FnMut(Notice<'_>),
    {
        let mut count = 0;

        for token in mem::take(&mut self.queued) {
            if self.connections.contains_key(&token.0) {
                on_notice(Notice::Connected(token));
                count += 1;
            }
        }

        let timeout = if count > 0 {
            Some(Duration::ZERO)
        } else {
            timeout
        };

        for group in self.main.poll(timeout)? {
            match group.tag() {
                CONNECTING => count += self.finish_handshakes(&mut on_notice)?,
                READY => count += self.dispatch_ready(&mut on_notice)?,
                _ => {}
            }
        }

        Ok(count)
    }

    fn finish_handshakes<F>(&mut self, on_notice: &mut F) -> Result<usize>
    where
        F: FnMut(Notice<'_>),
    {
        let mut count = 0;

        for ev in self.connecting.poll(Some(Duration::ZERO))? {
            let fd = ev.tag() as RawFd;
            let Some(conn) = self.connections.get_mut(&fd) else {
                continue;
            };

            let state = match conn.finish_connect() {
                Ok(state) => state,
                Err(err) => State::Failed(err.code().unwrap_or(libc::EIO)),
            };

            match state {
                State::Connecting => {}
                State::Connected => {
                    self.connecting.deregister(fd)?;
                    self.ready.register(fd, Interest::READABLE, fd as u64)?;
                    on_notice(Notice::Connected(Token(fd)));
                    count += 1;
                }
                State::Failed(code) => {
                    self.connections.remove(&fd);
                    on_notice(Notice::Failed(Token(fd), code));
                    count += 1;
                }
            }
        }

        Ok(count)
    }

    fn dispatch_ready<F>(&mut self, on_notice: &mut F) -> Result<usize>
    where
        F: FnMut(Notice<'_>),
    {
        let mut count = 0;
        let mut dropped = HashSet::new();

        for ev in self.ready.poll(Some(Duration::ZERO))? {
            let fd = ev.tag() as RawFd;
            if dropped.contains(&fd) {
                continue;
            }

            if self.listeners.contains_key(&fd) {
                count += self.accept_on(fd, on_notice)?;
                continue;
            }

            if ev.is_writable() && self.backlogs.contains_key(&fd) {
                if let Err(err) = self.flush(fd) {
                    error!(self.log, "dropping {}: {err}", Token(fd));
                    self.forget(fd);
                    dropped.insert(fd);
                    on_notice(Notice::Failed(Token(fd), err.code().unwrap_or(libc::EIO)));
                    count += 1;
                    continue;
                }
            }

            let Some(conn) = self.connections.get_mut(&fd) else {
                continue;
            };

            let mut data = Vec::new();
            let res = conn.read_into(&mut data);
            let closed = conn.peer_closed();

            if !data.is_empty() {
                on_notice(Notice::Data(Token(fd), &data));
                count += 1;
            }

            match res {
                Err(err) => {
                    self.forget(fd);
                    dropped.insert(fd);
                    on_notice(Notice::Failed(Token(fd), err.code().unwrap_or(libc::EIO)));
                    count += 1;
                }
                Ok(_) if closed => {
                    debug!(self.log, "connection {} closed by peer", Token(fd));
                    self.forget(fd);
                    dropped.insert(fd);
                    on_notice(Notice::Closed(Token(fd)));
                    count += 1;
                }
                Ok(_) => {}
            }
        }

        Ok(count)
    }

    fn accept_on<F>(&mut self, fd: RawFd, on_notice: &mut F) -> Result<usize>
    where
        F: FnMut(Notice<'_>),
    {
        let Some(listener) = self.listeners.get(&fd) else {
            return Ok(0);
        };
        let datagram = matches!(listener, Listener::Datagram(_));
        let mut count = 0;

        for pending in listener.incoming() {
            let pending = pending?;

            let known = datagram
                && self
                    .connections
                    .values()
                    .any(|conn| conn.peer() == Some(pending.peer()));

            let verdict = if known {
                Admission::AlreadyKnown
            } else if let Some(policy) = self.admission.as_mut() {
                policy(pending.peer(), pending.handshake())
            } else {
                Admission::Admit
            };

            if verdict != Admission::Admit {
                debug!(self.log, "peer {} not admitted: {verdict:?}", pending.peer());
                continue;
            }

            let (conn, handshake) = pending.admit_with_handshake()?;
            let conn_fd = conn.as_raw_fd();
            let peer = conn.peer().copied();

            self.ready.register(conn_fd, Interest::READABLE, conn_fd as u64)?;
            self.connections.insert(conn_fd, conn);

            on_notice(Notice::Accepted {
                listener: Token(fd),
                token: Token(conn_fd),
                peer,
                handshake: &handshake,
            });
            count += 1;
        }

        Ok(count)
    }
}

impl AsRawFd for Hub {
    fn as_raw_fd(&self) -> RawFd {
        self.main.as_raw_fd()
    }
}

impl Pollable for Hub {
    fn interest(&self) -> Interest {
        Interest::READABLE
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("fd", &self.main.as_raw_fd())
            .field("connections", &self.connections.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::listener::StreamListener;
    use crate::net::socket::BindTarget;
    use std::net::SocketAddr;
    use std::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Connected(Token),
        Failed(Token),
        Accepted(Token, Vec<u8>),
        Data(Token, Vec<u8>),
        Closed(Token),
    }

    fn loopback() -> BindTarget {
        BindTarget::Endpoint(SocketAddr::from(([127, 0, 0, 1], 0)).into())
    }

    /// Polls until `done` holds for everything seen so far, or 5 seconds.
    fn drive(hub: &mut Hub, done: impl Fn(&[Seen]) -> bool) -> Vec<Seen> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();

        while !done(&seen) && Instant::now() < deadline {
            hub.poll(Some(Duration::from_millis(50)), |notice| {
                seen.push(match notice {
                    Notice::Connected(t) => Seen::Connected(t),
                    Notice::Failed(t, _) => Seen::Failed(t),
                    Notice::Accepted {
                        token, handshake, ..
                    } => Seen::Accepted(token, handshake.to_vec()),
                    Notice::Data(t, data) => Seen::Data(t, data.to_vec()),
                    Notice::Closed(t) => Seen::Closed(t),
                })
            })
            .unwrap();
        }

        seen
    }

    fn accepted(seen: &[Seen]) -> Option<Token> {
        seen.iter().find_map(|s| match s {
            Seen::Accepted(t, _) => Some(*t),
            _ => None,
        })
    }

    /// Collects data for `token` until `len` bytes arrived.
    fn data_for(hub: &mut Hub, token: Token, len: usize) -> Vec<u8> {
        let seen = drive(hub, |seen| {
            seen.iter()
                .filter_map(|s| match s {
                    Seen::Data(t, d) if *t == token => Some(d.len()),
                    _ => None,
                })
                .sum::<usize>()
                >= len
        });

        seen.into_iter()
            .filter_map(|s| match s {
                Seen::Data(t, d) if t == token => Some(d),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn stream_connect_accept_and_exchange() {
        let log = Logger::default();
        let mut hub = Hub::new(&log).unwrap();

        let listener = StreamListener::bind(loopback(), &log).unwrap();
        let dst = listener.socket().source().unwrap();
        hub.listen(listener.into()).unwrap();

        let client = hub.connect(SocketType::Stream, &dst).unwrap();
        let seen = drive(&mut hub, |seen| {
            seen.contains(&Seen::Connected(client)) && accepted(seen).is_some()
        });
        let server = accepted(&seen).unwrap();
        assert!(hub.connection(client).unwrap().is_connected());
        assert_eq!(hub.len(), 2);

        assert_eq!(hub.send(client, b"ping").unwrap(), 4);
        assert_eq!(data_for(&mut hub, server, 4), b"ping");

        assert_eq!(hub.broadcast(b"all"), 2);
        let seen = drive(&mut hub, |seen| {
            seen.iter().filter(|s| matches!(s, Seen::Data(..))).count() >= 2
        });
        assert!(seen.contains(&Seen::Data(client, b"all".to_vec())));
        assert!(seen.contains(&Seen::Data(server, b"all".to_vec())));

        assert!(hub.close(client));
        let seen = drive(&mut hub, |seen| seen.contains(&Seen::Closed(server)));
        assert!(seen.contains(&Seen::Closed(server)));
        assert!(hub.connection(server).is_none());
        assert!(hub.is_empty());
    }

    #[test]
    fn backlog_is_flushed_to_a_slow_reader() {
        let log = Logger::default();
        let mut hub = Hub::new(&log).unwrap();

        let listener = Listener::from(StreamListener::bind(loopback(), &log).unwrap());
        let dst = listener.source().unwrap();

        let client = hub.connect(SocketType::Stream, &dst).unwrap();
        drive(&mut hub, |seen| seen.contains(&Seen::Connected(client)));

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut server = None;
        while server.is_none() {
            assert!(Instant::now() < deadline, "no peer accepted");
            listener
                .socket()
                .wait_for(Interest::READABLE, Some(Duration::from_millis(100)))
                .unwrap();
            listener.accept(|conn, _| server = Some(conn)).unwrap();
        }
        let mut server = server.unwrap();

        // Far more than the socket buffers hold while nobody reads.
        let data: Vec<u8> = (0..200 * 64 * 1024).map(|i| (i % 251) as u8).collect();
        for chunk in data.chunks(64 * 1024) {
            hub.send_all(client, chunk).unwrap();
        }
        assert!(hub.backlog(client) > 0);

        let deadline = Instant::now() + Duration::from_secs(20);
        let mut received = Vec::new();
        while received.len() < data.len() && Instant::now() < deadline {
            hub.poll(Some(Duration::ZERO), |_| {}).unwrap();
            server
                .socket()
                .wait_for(Interest::READABLE, Some(Duration::from_millis(10)))
                .unwrap();
            server.read_into(&mut received).unwrap();
        }

        assert_eq!(received.len(), data.len());
        assert!(received == data);
        assert_eq!(hub.backlog(client), 0);
        assert!(hub.connection(client).unwrap().is_connected());
    }

    #[test]
    fn refused_connect_is_reported_and_dropped() {
        let log = Logger::default();
        let mut hub = Hub::new(&log).unwrap();

        // Bound, never listening.
        let closed = crate::net::socket::Socket::new(
            SocketType::Stream,
            &crate::net::socket::SocketOptions::none(),
            loopback(),
            &log,
        )
        .unwrap();
        let dst = closed.source().unwrap();

        match hub.connect(SocketType::Stream, &dst) {
            Err(err) => assert!(err.code().unwrap_or(0) != 0),
            Ok(token) => {
                let seen = drive(&mut hub, |seen| seen.contains(&Seen::Failed(token)));
                assert_eq!(seen, vec![Seen::Failed(token)]);
                assert!(hub.connection(token).is_none());
                assert!(hub.send(token, b"x").is_err());
            }
        }
    }

    #[test]
    fn datagram_peer_gets_own_connection() {
        let log = Logger::default();
        let mut hub = Hub::new(&log).unwrap();

        let listener = Listener::bind(SocketType::Datagram, loopback(), &log).unwrap();
        let dst = listener.source().unwrap();
        let listener_token = hub.listen(listener).unwrap();
        assert!(hub.listener(listener_token).unwrap().can_accept());

        let client = hub.connect(SocketType::Datagram, &dst).unwrap();
        let seen = drive(&mut hub, |seen| seen.contains(&Seen::Connected(client)));
        assert_eq!(seen, vec![Seen::Connected(client)]);

        hub.send(client, b"hello").unwrap();
        let seen = drive(&mut hub, |seen| accepted(seen).is_some());
        let server = accepted(&seen).unwrap();
        assert!(seen.contains(&Seen::Accepted(server, b"hello".to_vec())));

        hub.send(client, b"again").unwrap();
        assert_eq!(data_for(&mut hub, server, 5), b"again");

        hub.send(server, b"reply").unwrap();
        assert_eq!(data_for(&mut hub, client, 5), b"reply");
        assert_eq!(hub.len(), 2);
    }

    #[test]
    fn admission_policy_denies_peers() {
        let log = Logger::default();
        let mut hub = Hub::new(&log).unwrap();
        hub.set_admission(|_, handshake| {
            if handshake == b"let me in" {
                Admission::Admit
            } else {
                Admission::Deny
            }
        });

        let listener = Listener::bind(SocketType::Datagram, loopback(), &log).unwrap();
        let dst = listener.source().unwrap();
        hub.listen(listener).unwrap();

        let outsider = Connection::connect(SocketType::Datagram, &dst, &log).unwrap();
        outsider.write(b"knock knock").unwrap();
        let insider = Connection::connect(SocketType::Datagram, &dst, &log).unwrap();
        insider.write(b"let me in").unwrap();

        let seen = drive(&mut hub, |seen| accepted(seen).is_some());
        let server = accepted(&seen).unwrap();
        assert_eq!(seen, vec![Seen::Accepted(server, b"let me in".to_vec())]);
        assert_eq!(hub.connection(server).unwrap().peer().copied(), insider.source());
        assert_eq!(hub.len(), 1);
    }

    #[test]
    fn hub_nests_into_outer_epoll() {
        let log = Logger::default();
        let mut hub = Hub::new(&log).unwrap();

        let listener = Listener::bind(SocketType::Datagram, loopback(), &log).unwrap();
        let dst = listener.source().unwrap();
        hub.listen(listener).unwrap();

        let outer = Epoll::new(&log).unwrap();
        outer.add(&hub, 7).unwrap();
        assert!(outer.poll(Some(Duration::ZERO)).unwrap().is_empty());

        let client = Connection::connect(SocketType::Datagram, &dst, &log).unwrap();
        client.write(b"wake").unwrap();

        let events = outer.poll(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tag(), 7);

        let seen = drive(&mut hub, |seen| accepted(seen).is_some());
        assert_eq!(seen.len(), 1);
    }
}
