use std::{fmt, io, net::SocketAddr, sync::Arc, time::Instant};

use serde::Serialize;

use crate::key::ChannelSslOptions;

/// Identifies one socket created through a [`SocketMap`](crate::SocketMap).
///
/// Ids are never reused, so a socket that is evicted and created again for
/// the same key gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SocketId(u64);

impl SocketId {
    #[inline]
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub trait Authenticator: Send + Sync {
    /// Credential sent along with the first request on a new socket.
    fn generate_credential(&self) -> io::Result<String>;
}

/// An established outgoing connection.
///
/// Once handed to the map, only the map closes it.
pub trait Connection: Send + Sync + 'static {
    /// Last time any data was read from or written to the connection.
    fn last_active(&self) -> Instant;

    /// Called once, when the map drops the connection. May run on the reaper
    /// thread; a panic here is caught and logged like an error.
    fn close(&self) -> io::Result<()>;
}

/// Parameters a [`SocketCreator`] gets for one new socket.
#[derive(Clone)]
pub struct SocketOptions {
    pub remote_side: SocketAddr,
    pub ssl_options: Option<ChannelSslOptions>,
    pub auth: Option<Arc<dyn Authenticator>>,
}

impl fmt::Debug for SocketOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketOptions")
            .field("remote_side", &self.remote_side)
            .field("ssl_options", &self.ssl_options)
            .field("auth", &self.auth.is_some())
            .finish()
    }
}

/// Creates sockets on demand for a [`SocketMap`](crate::SocketMap).
///
/// Called at most once per key at a time, but concurrently for different
/// keys, and never with the map locked, so it may block on I/O.
pub trait SocketCreator: Send + Sync + 'static {
    type Socket: Connection;
    type Error: std::error::Error + Send + Sync + 'static;

    fn create_socket(&self, options: &SocketOptions) -> Result<Self::Socket, Self::Error>;
}

impl<F, S, E> SocketCreator for F
where
    F: Fn(&SocketOptions) -> Result<S, E> + Send + Sync + 'static,
    S: Connection,
    E: std::error::Error + Send + Sync + 'static,
{
    type Socket = S;
    type Error = E;

    #[inline]
    fn create_socket(&self, options: &SocketOptions) -> Result<S, E> {
        (self)(options)
    }
}
