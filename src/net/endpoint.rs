//! Address-family tagged socket addresses.

use std::ffi::OsStr;
use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::{fmt, mem, ptr, slice};

use crate::error::EndpointError;

/// Offset of `sun_path` within `sockaddr_un`.
const SUN_PATH_OFFSET: usize = mem::size_of::<libc::sa_family_t>();

/// Maximum number of bytes in a local socket path, excluding the terminating
/// null byte (or the leading null byte of an abstract name).
pub const MAX_LOCAL_PATH: usize = 107;

/// Address families supported by [Endpoint].
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub enum Family {
    /// IPv4 (`AF_INET`).
    Inet,
    /// IPv6 (`AF_INET6`).
    Inet6,
    /// Local sockets (`AF_UNIX`), both filesystem and abstract namespace.
    Local,
}

impl Family {
    /// Returns the raw `AF_*` value.
    pub fn as_raw(self) -> libc::c_int {
        match self {
            Family::Inet => libc::AF_INET,
            Family::Inet6 => libc::AF_INET6,
            Family::Local => libc::AF_UNIX,
        }
    }

    /// Converts a raw `AF_*` value.
    pub fn from_raw(family: libc::c_int) -> Option<Self> {
        match family {
            libc::AF_INET => Some(Family::Inet),
            libc::AF_INET6 => Some(Family::Inet6),
            libc::AF_UNIX => Some(Family::Local),
            _ => None,
        }
    }

    /// Returns `true` for the IP families.
    pub fn is_inet(self) -> bool {
        matches!(self, Family::Inet | Family::Inet6)
    }
}

/// Socket types supported by this crate.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub enum SocketType {
    /// Byte stream (`SOCK_STREAM`).
    Stream,
    /// Ordered, reliable messages (`SOCK_SEQPACKET`).
    SeqPacket,
    /// Datagrams (`SOCK_DGRAM`).
    Datagram,
}

impl SocketType {
    /// Returns the raw `SOCK_*` value.
    pub fn as_raw(self) -> libc::c_int {
        match self {
            SocketType::Stream => libc::SOCK_STREAM,
            SocketType::SeqPacket => libc::SOCK_SEQPACKET,
            SocketType::Datagram => libc::SOCK_DGRAM,
        }
    }

    /// Converts a raw `SOCK_*` value.
    pub fn from_raw(kind: libc::c_int) -> Option<Self> {
        match kind {
            libc::SOCK_STREAM => Some(SocketType::Stream),
            libc::SOCK_SEQPACKET => Some(SocketType::SeqPacket),
            libc::SOCK_DGRAM => Some(SocketType::Datagram),
            _ => None,
        }
    }

    /// Returns `true` if the type has a connection handshake and an orderly
    /// shutdown (everything but datagrams).
    pub fn is_connection_oriented(self) -> bool {
        !matches!(self, SocketType::Datagram)
    }
}

/// An immutable socket address: family, address bytes and length.
///
/// The length always matches the structure implied by the family: a
/// `sockaddr_in`, a `sockaddr_in6`, or a `sockaddr_un` prefix holding a
/// filesystem path or an abstract name.
#[derive(Copy, Clone)]
pub struct Endpoint {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl Endpoint {
    /// Returns the wildcard address of `family` with port 0 (or an unnamed
    /// local address).
    pub fn any(family: Family) -> Self {
        match family {
            Family::Inet => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into(),
            Family::Inet6 => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)).into(),
            Family::Local => {
                let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
                storage.ss_family = libc::AF_UNIX as libc::sa_family_t;
                Self {
                    storage,
                    len: SUN_PATH_OFFSET as libc::socklen_t,
                }
            }
        }
    }

    /// Creates a local endpoint backed by a filesystem path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is longer than [MAX_LOCAL_PATH] bytes or
    /// contains a null byte.
    pub fn local<P: AsRef<Path>>(path: P) -> Result<Self, EndpointError> {
        let bytes = path.as_ref().as_os_str().as_bytes();
        if bytes.contains(&0) {
            return Err(EndpointError::PathContainsNul);
        }

        // Account for the terminating null byte.
        Self::local_raw(bytes, 0, bytes.len() + 1)
    }

    /// Creates a local endpoint in the abstract namespace. The name has no
    /// filesystem entry and may contain arbitrary bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is longer than [MAX_LOCAL_PATH] bytes.
    pub fn abstract_local(name: &[u8]) -> Result<Self, EndpointError> {
        // Abstract names start with a null byte and are not terminated.
        Self::local_raw(name, 1, name.len() + 1)
    }

    fn local_raw(bytes: &[u8], start: usize, used: usize) -> Result<Self, EndpointError> {
        if bytes.len() > MAX_LOCAL_PATH {
            return Err(EndpointError::PathTooLong {
                provided: bytes.len(),
                maximum: MAX_LOCAL_PATH,
            });
        }

        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let sun = &mut storage as *mut _ as *mut libc::sockaddr_un;

        unsafe {
            (*sun).sun_family = libc::AF_UNIX as libc::sa_family_t;

            // SAFETY: `start + bytes.len()` is at most 108, the size of
            // `sun_path`.
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                ((*sun).sun_path.as_mut_ptr() as *mut u8).add(start),
                bytes.len(),
            );
        }

        Ok(Self {
            storage,
            len: (SUN_PATH_OFFSET + used) as libc::socklen_t,
        })
    }

    /// Creates an endpoint by copying a raw socket address.
    ///
    /// # Errors
    ///
    /// Returns an error if the family is unsupported or `len` does not match
    /// the size implied by the family.
    ///
    /// # Safety
    ///
    /// `addr` must point to at least `len` readable bytes.
    pub unsafe fn from_raw(
        addr: *const libc::sockaddr,
        len: libc::socklen_t,
    ) -> Result<Self, EndpointError> {
        let len_usize = len as usize;
        if len_usize < SUN_PATH_OFFSET || len_usize > mem::size_of::<libc::sockaddr_storage>() {
            return Err(EndpointError::InvalidLength {
                family: -1,
                provided: len_usize,
                expected: SUN_PATH_OFFSET,
            });
        }

        let family = unsafe { (*addr).sa_family } as libc::c_int;
        validate_len(family, len_usize)?;

        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        unsafe {
            ptr::copy_nonoverlapping(
                addr as *const u8,
                &mut storage as *mut _ as *mut u8,
                len_usize,
            );
        }

        Ok(Self { storage, len })
    }

    /// Returns the address family.
    pub fn family(&self) -> Family {
        // Validated on construction.
        Family::from_raw(self.storage.ss_family as libc::c_int).unwrap_or(Family::Local)
    }

    /// Returns the length of the address in bytes.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> libc::socklen_t {
        self.len
    }

    /// Returns a pointer suitable for `bind`, `connect` and friends.
    pub fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const _ as *const libc::sockaddr
    }

    /// Returns the meaningful address bytes.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `len` never exceeds the size of `storage`.
        unsafe { slice::from_raw_parts(self.as_ptr() as *const u8, self.len as usize) }
    }

    /// Converts an IP endpoint into a [SocketAddr].
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self.family() {
            Family::Inet => {
                let sin = unsafe { &*(self.as_ptr() as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());

                Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
            }
            Family::Inet6 => {
                let sin6 = unsafe { &*(self.as_ptr() as *const libc::sockaddr_in6) };
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);

                Some(SocketAddr::V6(SocketAddrV6::new(
                    ip,
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            Family::Local => None,
        }
    }

    /// Returns the port of an IP endpoint.
    pub fn port(&self) -> Option<u16> {
        self.to_socket_addr().map(|addr| addr.port())
    }

    fn sun_path(&self) -> &[u8] {
        let bytes = self.as_bytes();
        &bytes[SUN_PATH_OFFSET.min(bytes.len())..]
    }

    /// Returns the filesystem path of a local endpoint.
    pub fn path(&self) -> Option<&Path> {
        if self.family() != Family::Local || self.is_abstract() {
            return None;
        }

        let path = self.sun_path();
        let end = path.iter().position(|&b| b == 0).unwrap_or(path.len());
        if end == 0 {
            return None;
        }

        Some(Path::new(OsStr::from_bytes(&path[..end])))
    }

    /// Returns the name of an abstract-namespace local endpoint.
    pub fn abstract_name(&self) -> Option<&[u8]> {
        if self.is_abstract() {
            Some(&self.sun_path()[1..])
        } else {
            None
        }
    }

    /// Returns `true` for local endpoints in the abstract namespace.
    pub fn is_abstract(&self) -> bool {
        let path = self.sun_path();
        self.family() == Family::Local && !path.is_empty() && path[0] == 0
    }

    /// Returns `true` for local endpoints without a name (e.g., an unbound
    /// client seen by a listener).
    pub fn is_unnamed(&self) -> bool {
        self.family() == Family::Local && self.len as usize == SUN_PATH_OFFSET
    }
}

/// Checks that `len` is the structural size implied by `family`.
fn validate_len(family: libc::c_int, len: usize) -> Result<(), EndpointError> {
    let expected = match family {
        libc::AF_INET => mem::size_of::<libc::sockaddr_in>(),
        libc::AF_INET6 => mem::size_of::<libc::sockaddr_in6>(),
        libc::AF_UNIX => {
            let maximum = mem::size_of::<libc::sockaddr_un>();
            return if len <= maximum {
                Ok(())
            } else {
                Err(EndpointError::InvalidLength {
                    family,
                    provided: len,
                    expected: maximum,
                })
            };
        }
        _ => return Err(EndpointError::UnsupportedFamily(family)),
    };

    if len != expected {
        return Err(EndpointError::InvalidLength {
            family,
            provided: len,
            expected,
        });
    }

    Ok(())
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

        let len = match addr {
            SocketAddr::V4(v4) => {
                let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
                unsafe {
                    (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                    (*sin).sin_port = v4.port().to_be();
                    (*sin).sin_addr = libc::in_addr {
                        s_addr: u32::from_ne_bytes(v4.ip().octets()),
                    };
                }
                mem::size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(v6) => {
                let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
                unsafe {
                    (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                    (*sin6).sin6_port = v6.port().to_be();
                    (*sin6).sin6_flowinfo = v6.flowinfo();
                    (*sin6).sin6_addr = libc::in6_addr {
                        s6_addr: v6.ip().octets(),
                    };
                    (*sin6).sin6_scope_id = v6.scope_id();
                }
                mem::size_of::<libc::sockaddr_in6>()
            }
        };

        Self {
            storage,
            len: len as libc::socklen_t,
        }
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("family", &self.family())
            .field("len", &self.len)
            .field("addr", &format_args!("{self}"))
            .finish()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(addr) = self.to_socket_addr() {
            return write!(f, "{addr}");
        }

        if let Some(name) = self.abstract_name() {
            return write!(f, "@{}", String::from_utf8_lossy(name));
        }

        match self.path() {
            Some(path) => write!(f, "{}", path.display()),
            None => write!(f, "(unnamed)"),
        }
    }
}
