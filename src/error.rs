//! Error types for socket creation, connection handling, and readiness
//! polling.

use std::{error, fmt, io, result};

/// Creates a [`crate::Error`] of the given variant from the current `errno`
/// value, tagged with the name of the failing operation.
macro_rules! errno {
    ($variant:ident, $op:expr) => {{ $crate::Error::$variant($crate::error::OsError::last($op)) }};
}
pub(crate) use errno;

/// A convenience wrapper around `Result` for [crate::Error].
pub type Result<T> = result::Result<T, Error>;

/// Represents errors that can occur while creating or driving sockets.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A descriptor could not be created (e.g., descriptor exhaustion or an
    /// unsupported family).
    Resource(OsError),
    /// A socket option could not be applied.
    Option(OsError),
    /// The socket could not be bound to the requested endpoint.
    Bind(OsError),
    /// The socket could not be marked as listening.
    Listen(OsError),
    /// A connection attempt failed immediately.
    Connect(OsError),
    /// A pending peer could not be pulled from a listener.
    Accept(OsError),
    /// Receiving data failed.
    Read(OsError),
    /// Sending data failed.
    Write(OsError),
    /// Registering with, or waiting on, an epoll instance failed.
    Poll(OsError),
    /// Name resolution failed.
    Resolution(ResolveError),
    /// An endpoint could not be constructed or used.
    Endpoint(EndpointError),
    /// Any other I/O error.
    Io(io::Error),
}

impl Error {
    /// Returns the raw OS error code carried by this error, if any.
    pub fn code(&self) -> Option<i32> {
        match *self {
            Error::Resource(ref e)
            | Error::Option(ref e)
            | Error::Bind(ref e)
            | Error::Listen(ref e)
            | Error::Connect(ref e)
            | Error::Accept(ref e)
            | Error::Read(ref e)
            | Error::Write(ref e)
            | Error::Poll(ref e) => Some(e.code),
            Error::Resolution(ref e) => e.os_code,
            Error::Io(ref e) => e.raw_os_error(),
            Error::Endpoint(_) => None,
        }
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<ResolveError> for Error {
    fn from(err: ResolveError) -> Error {
        Error::Resolution(err)
    }
}

impl From<EndpointError> for Error {
    fn from(err: EndpointError) -> Error {
        Error::Endpoint(err)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::Io(e) => e,
            Error::Endpoint(e) => io::Error::new(io::ErrorKind::InvalidInput, e.to_string()),
            Error::Resolution(e) => io::Error::other(e.to_string()),
            other => match other.code() {
                Some(code) => {
                    let kind = io::Error::from_raw_os_error(code).kind();
                    io::Error::new(kind, other.to_string())
                }
                None => io::Error::other(other.to_string()),
            },
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::Resource(ref e) => write!(f, "failed to create descriptor: {e}"),
            Error::Option(ref e) => write!(f, "failed to set socket option: {e}"),
            Error::Bind(ref e) => write!(f, "failed to bind socket: {e}"),
            Error::Listen(ref e) => write!(f, "failed to listen on socket: {e}"),
            Error::Connect(ref e) => write!(f, "failed to connect: {e}"),
            Error::Accept(ref e) => write!(f, "failed to accept peer: {e}"),
            Error::Read(ref e) => write!(f, "failed to read: {e}"),
            Error::Write(ref e) => write!(f, "failed to write: {e}"),
            Error::Poll(ref e) => write!(f, "failed to poll: {e}"),
            Error::Resolution(ref e) => fmt::Display::fmt(e, f),
            Error::Endpoint(ref e) => fmt::Display::fmt(e, f),
            Error::Io(ref e) => fmt::Display::fmt(e, f),
        }
    }
}

/// A failed system call: the name of the operation and the `errno` it left.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OsError {
    /// Name of the failing operation (e.g., `"bind"`).
    pub op: &'static str,
    /// Raw OS error code.
    pub code: i32,
}

impl OsError {
    /// Captures the current `errno` value for the given operation.
    pub fn last(op: &'static str) -> Self {
        let code = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Self { op, code }
    }

    /// Creates an error for the given operation from an explicit code.
    pub fn new(op: &'static str, code: i32) -> Self {
        Self { op, code }
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.op, io::Error::from_raw_os_error(self.code))
    }
}

/// Represents errors that can occur while building or interpreting an
/// endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    /// The local socket path does not fit into `sun_path`.
    PathTooLong {
        /// The length of the path provided.
        provided: usize,
        /// The maximum allowed length.
        maximum: usize,
    },
    /// The local socket path contains an interior null byte.
    PathContainsNul,
    /// The address length does not match the size required by its family.
    InvalidLength {
        /// The raw address family.
        family: i32,
        /// The length provided.
        provided: usize,
        /// The length required by the family.
        expected: usize,
    },
    /// The address family is not supported for this operation.
    UnsupportedFamily(i32),
}

impl error::Error for EndpointError {}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            EndpointError::PathTooLong { provided, maximum } => {
                write!(
                    f,
                    "invalid local socket path: {provided} bytes (exceeds maximum allowed {maximum} bytes)"
                )
            }
            EndpointError::PathContainsNul => {
                write!(f, "invalid local socket path: contains a null byte")
            }
            EndpointError::InvalidLength {
                family,
                provided,
                expected,
            } => {
                write!(
                    f,
                    "invalid address length for family {family}: {provided} bytes (expected {expected} bytes)"
                )
            }
            EndpointError::UnsupportedFamily(family) => {
                write!(f, "unsupported address family: {family}")
            }
        }
    }
}

/// Represents a `getaddrinfo` failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveError {
    /// The node that was being resolved.
    pub node: String,
    /// The `EAI_*` code returned by `getaddrinfo`.
    pub code: i32,
    /// The `errno` value, when `code` is `EAI_SYSTEM`.
    pub os_code: Option<i32>,
    /// Human readable description of `code`.
    pub message: String,
}

impl error::Error for ResolveError {}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.os_code {
            Some(code) => write!(
                f,
                "failed to resolve {}: {}",
                self.node,
                io::Error::from_raw_os_error(code)
            ),
            None => write!(f, "failed to resolve {}: {}", self.node, self.message),
        }
    }
}
