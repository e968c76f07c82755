//! Non-blocking socket abstractions over the Linux epoll interface.
//!
//! The crate wraps stream, sequenced-packet and datagram sockets over IPv4,
//! IPv6 and local (`AF_UNIX`) families. Every descriptor is created
//! non-blocking and close-on-exec, is owned by exactly one object and is
//! closed when that object is dropped. Readiness is multiplexed with
//! [epoll::Epoll], whose instances may be nested into each other.
//!
//! Datagram listeners emulate per-peer connections, so the same accept and
//! read/write code serves both connection-oriented and datagram transports.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

#[cfg(not(target_os = "linux"))]
compile_error!("This crate is only compatible with Linux systems that support the epoll interface.");

pub mod epoll;
pub mod error;
pub mod log;
pub mod net;

pub use error::{Error, Result};
