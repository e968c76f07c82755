//! Non-blocking socket primitives.
//!
//! This module provides endpoints, owned descriptors, connections with a
//! non-blocking connect state machine, listeners with admission control, name
//! resolution, and a [Hub] grouping them behind a single pollable descriptor.

pub(crate) mod connection;
pub(crate) mod endpoint;
pub(crate) mod fd;
pub(crate) mod hub;
pub(crate) mod listener;
pub(crate) mod resolve;
pub(crate) mod socket;

pub use connection::{Connection, ConnectionKind, Message, READ_CHUNK, State};
pub use endpoint::{Endpoint, Family, MAX_LOCAL_PATH, SocketType};
pub use fd::Fd;
pub use hub::{Hub, Notice, Token};
pub use listener::{
    Admission, DatagramListener, Incoming, LISTEN_BACKLOG, Listener, Pending, StreamListener,
};
pub use resolve::{AddrInfo, resolve};
pub use socket::{BindTarget, Socket, SocketOptions};
