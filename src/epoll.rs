//! Readiness notification through `epoll(7)`.
//!
//! An [Epoll] holds the interest list in the kernel; nothing is mirrored in
//! process. Its own descriptor is pollable, so one instance can be registered
//! inside another to keep separate groups of descriptors (e.g., connections
//! still completing their handshake versus connections ready for data) behind
//! a single outer wait.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::error::{Result, errno};
use crate::log::Logger;
use crate::net::fd::Fd;
use crate::{debug, error};

/// Maximum number of events delivered by a single [Epoll::wait] call.
pub const MAX_EVENTS: usize = 128;

/// Set of readiness conditions a descriptor is registered for.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Interest(u32);

impl Interest {
    /// Data may be read (`EPOLLIN`).
    pub const READABLE: Interest = Interest(libc::EPOLLIN as u32);
    /// Data may be written, or a pending connect resolved (`EPOLLOUT`).
    pub const WRITABLE: Interest = Interest(libc::EPOLLOUT as u32);
    /// Urgent data may be read (`EPOLLPRI`).
    pub const PRIORITY: Interest = Interest(libc::EPOLLPRI as u32);
    /// The peer shut down its writing half (`EPOLLRDHUP`).
    pub const READ_HANGUP: Interest = Interest(libc::EPOLLRDHUP as u32);
    /// Edge-triggered notification (`EPOLLET`).
    pub const EDGE: Interest = Interest(libc::EPOLLET as u32);
    /// Disable the registration after one event (`EPOLLONESHOT`).
    pub const ONESHOT: Interest = Interest(libc::EPOLLONESHOT as u32);

    /// Returns the raw `EPOLL*` mask.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if every flag of `other` is set.
    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Interest({})", flag_names(self.0))
    }
}

/// Something that can be registered with an [Epoll].
///
/// Connections, listeners, hubs and epoll instances themselves implement it.
pub trait Pollable: AsRawFd {
    /// The readiness this object currently needs to be woken up for.
    fn interest(&self) -> Interest;

    /// Whether readiness means "a peer is waiting to be accepted" rather than
    /// "data can be exchanged".
    fn can_accept(&self) -> bool {
        false
    }
}

/// A single readiness notification.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Event {
    flags: u32,
    tag: u64,
}

impl Event {
    /// Creates an event from raw flags and a tag.
    pub fn new(flags: u32, tag: u64) -> Self {
        Self { flags, tag }
    }

    /// The tag given when the descriptor was registered.
    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// The raw `EPOLL*` flags reported.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Returns `true` if the descriptor is readable.
    pub fn is_readable(&self) -> bool {
        self.flags & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0
    }

    /// Returns `true` if the descriptor is writable.
    pub fn is_writable(&self) -> bool {
        self.flags & libc::EPOLLOUT as u32 != 0
    }

    /// Returns `true` if an error condition is pending.
    pub fn is_error(&self) -> bool {
        self.flags & libc::EPOLLERR as u32 != 0
    }

    /// Returns `true` if the peer hung up (fully or its writing half).
    pub fn is_hangup(&self) -> bool {
        self.flags & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("flags", &format_args!("{}", flag_names(self.flags)))
            .field("tag", &self.tag)
            .finish()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event: tag: {} events: {}", self.tag, flag_names(self.flags))
    }
}

fn flag_names(flags: u32) -> String {
    const NAMES: [(libc::c_int, &str); 7] = [
        (libc::EPOLLIN, "EPOLLIN"),
        (libc::EPOLLOUT, "EPOLLOUT"),
        (libc::EPOLLRDHUP, "EPOLLRDHUP"),
        (libc::EPOLLPRI, "EPOLLPRI"),
        (libc::EPOLLERR, "EPOLLERR"),
        (libc::EPOLLHUP, "EPOLLHUP"),
        (libc::EPOLLET, "EPOLLET"),
    ];

    let names: Vec<&str> = NAMES
        .iter()
        .filter(|(flag, _)| flags & *flag as u32 != 0)
        .map(|(_, name)| *name)
        .collect();

    if names.is_empty() {
        "0".to_string()
    } else {
        names.join("|")
    }
}

/// Converts an optional timeout into `epoll_wait` milliseconds, rounding up so
/// that a non-zero duration never becomes a busy poll.
fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if d.subsec_nanos() % 1_000_000 != 0 {
                ms += 1;
            }
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

/// An `epoll` instance.
#[derive(Debug)]
pub struct Epoll {
    fd: Fd,
    log: Logger,
}

impl Epoll {
    /// Creates a new close-on-exec epoll instance.
    ///
    /// # Errors
    ///
    /// Returns [crate::Error::Resource] if the instance could not be created.
    pub fn new(log: &Logger) -> Result<Self> {
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw == -1 {
            return Err(errno!(Resource, "epoll_create1"));
        }

        debug!(log, "created epoll fd {raw}");

        Ok(Self {
            fd: unsafe { Fd::from_raw(raw) },
            log: log.clone(),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest, tag: u64) -> libc::c_int {
        let mut ev = libc::epoll_event {
            events: interest.bits(),
            u64: tag,
        };

        unsafe { libc::epoll_ctl(self.fd.as_raw(), op, fd, &raw mut ev) }
    }

    /// Registers `fd` for `interest`, reporting events with `tag`. If `fd` is
    /// already registered its interest and tag are replaced.
    ///
    /// # Errors
    ///
    /// Returns [crate::Error::Poll] if the interest list could not be updated.
    pub fn register(&self, fd: RawFd, interest: Interest, tag: u64) -> Result<()> {
        if self.ctl(libc::EPOLL_CTL_ADD, fd, interest, tag) == 0 {
            debug!(self.log, "added fd {fd} to {} ({interest:?})", self.fd.as_raw());
            return Ok(());
        }

        if std::io::Error::last_os_error().raw_os_error() == Some(libc::EEXIST) {
            return self.modify(fd, interest, tag);
        }

        let err = errno!(Poll, "epoll_ctl(ADD)");
        error!(self.log, "failed to add fd {fd} to {}: {err}", self.fd.as_raw());
        Err(err)
    }

    /// Registers a [Pollable] with its current interest.
    pub fn add<P: Pollable + ?Sized>(&self, source: &P, tag: u64) -> Result<()> {
        self.register(source.as_raw_fd(), source.interest(), tag)
    }

    /// Replaces the interest and tag of an already registered `fd`.
    ///
    /// # Errors
    ///
    /// Returns [crate::Error::Poll] if `fd` is not registered.
    pub fn modify(&self, fd: RawFd, interest: Interest, tag: u64) -> Result<()> {
        if self.ctl(libc::EPOLL_CTL_MOD, fd, interest, tag) == -1 {
            let err = errno!(Poll, "epoll_ctl(MOD)");
            error!(self.log, "failed to modify fd {fd} in {}: {err}", self.fd.as_raw());
            return Err(err);
        }

        debug!(self.log, "modified fd {fd} in {} ({interest:?})", self.fd.as_raw());
        Ok(())
    }

    /// Removes `fd` from the interest list.
    ///
    /// Closing a descriptor removes it implicitly; this is only needed to move
    /// a live descriptor between instances.
    ///
    /// # Errors
    ///
    /// Returns [crate::Error::Poll] if `fd` is not registered.
    pub fn deregister(&self, fd: RawFd) -> Result<()> {
        if self.ctl(libc::EPOLL_CTL_DEL, fd, Interest(0), 0) == -1 {
            let err = errno!(Poll, "epoll_ctl(DEL)");
            error!(self.log, "failed to remove fd {fd} from {}: {err}", self.fd.as_raw());
            return Err(err);
        }

        debug!(self.log, "removed fd {fd} from {}", self.fd.as_raw());
        Ok(())
    }

    /// Waits up to `timeout` (forever if `None`, not at all if zero) for ready
    /// descriptors and calls `on_ready` once per event, in the order the
    /// kernel reported them.
    ///
    /// If `on_ready` returns `Some`, the remaining events of the batch are
    /// skipped and the value is returned. An interrupted wait returns
    /// `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [crate::Error::Poll] if `epoll_wait` fails.
    pub fn wait<T, F>(&self, timeout: Option<Duration>, mut on_ready: F) -> Result<Option<T>>
    where
        F: FnMut(Event) -> Option<T>,
    {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        let rdfs = unsafe {
            libc::epoll_wait(
                self.fd.as_raw(),
                events.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                timeout_ms(timeout),
            )
        };

        if rdfs == -1 {
            if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                return Ok(None);
            }
            return Err(errno!(Poll, "epoll_wait"));
        }

        for ev in events.iter().take(rdfs as usize) {
            let event = Event::new(ev.events, ev.u64);
            debug!(self.log, "{} on epoll fd {}", event, self.fd.as_raw());

            if let Some(signal) = on_ready(event) {
                return Ok(Some(signal));
            }
        }

        Ok(None)
    }

    /// Collects the events of one [Epoll::wait] call.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<Vec<Event>> {
        let mut ready = Vec::new();
        self.wait(timeout, |ev| {
            ready.push(ev);
            None::<()>
        })?;

        Ok(ready)
    }
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw()
    }
}

impl Pollable for Epoll {
    fn interest(&self) -> Interest {
        Interest::READABLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (Fd, Fd) {
        let mut fds = [0; 2];
        let res = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        assert_eq!(res, 0);

        unsafe { (Fd::from_raw(fds[0]), Fd::from_raw(fds[1])) }
    }

    fn write_byte(fd: &Fd) {
        let res = unsafe { libc::write(fd.as_raw(), b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(res, 1);
    }

    #[test]
    fn timeout_conversion() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_micros(1))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(250))), 250);
    }

    #[test]
    fn zero_timeout_polls_without_events() {
        let epoll = Epoll::new(&Logger::default()).unwrap();
        let (rd, _wr) = pipe();

        epoll.register(rd.as_raw(), Interest::READABLE, 7).unwrap();

        let res = epoll.wait(Some(Duration::ZERO), |_| Some(())).unwrap();
        assert!(res.is_none());
    }

    #[test]
    fn delivers_tag_and_flags() {
        let epoll = Epoll::new(&Logger::default()).unwrap();
        let (rd, wr) = pipe();

        epoll.register(rd.as_raw(), Interest::READABLE, 42).unwrap();
        write_byte(&wr);

        let events = epoll.poll(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tag(), 42);
        assert!(events[0].is_readable());
        assert!(!events[0].is_writable());
        assert_eq!(events[0].to_string(), "event: tag: 42 events: EPOLLIN");
    }

    #[test]
    fn register_twice_modifies() {
        let epoll = Epoll::new(&Logger::default()).unwrap();
        let (rd, wr) = pipe();

        epoll.register(rd.as_raw(), Interest::READABLE, 1).unwrap();
        epoll.register(rd.as_raw(), Interest::READABLE, 2).unwrap();
        write_byte(&wr);

        let events = epoll.poll(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tag(), 2);
    }

    #[test]
    fn deregister_unknown_fails() {
        let epoll = Epoll::new(&Logger::default()).unwrap();
        let (rd, _wr) = pipe();

        let err = epoll.deregister(rd.as_raw()).unwrap_err();
        assert_eq!(err.code(), Some(libc::ENOENT));
    }

    #[test]
    fn callback_signal_short_circuits_batch() {
        let epoll = Epoll::new(&Logger::default()).unwrap();
        let (rd1, wr1) = pipe();
        let (rd2, wr2) = pipe();

        epoll.register(rd1.as_raw(), Interest::READABLE, 1).unwrap();
        epoll.register(rd2.as_raw(), Interest::READABLE, 2).unwrap();
        write_byte(&wr1);
        write_byte(&wr2);

        let mut seen = 0;
        let res = epoll
            .wait(Some(Duration::from_secs(1)), |ev| {
                seen += 1;
                Some(ev.tag())
            })
            .unwrap();

        assert_eq!(seen, 1);
        assert!(matches!(res, Some(1) | Some(2)));
    }

    #[test]
    fn nested_instance_propagates_readiness() {
        let log = Logger::default();
        let outer = Epoll::new(&log).unwrap();
        let inner = Epoll::new(&log).unwrap();
        let (rd, wr) = pipe();

        outer.add(&inner, 100).unwrap();
        inner.register(rd.as_raw(), Interest::READABLE, 5).unwrap();

        assert!(outer.poll(Some(Duration::ZERO)).unwrap().is_empty());

        write_byte(&wr);

        let tag = outer
            .wait(Some(Duration::from_secs(1)), |ev| {
                assert_eq!(ev.tag(), 100);
                inner.wait(Some(Duration::ZERO), |inner_ev| Some(inner_ev.tag())).unwrap()
            })
            .unwrap();

        assert_eq!(tag, Some(5));
    }
}
