mod error;
pub use error::{Error, Result, SocketMapError};

pub mod creator;
pub mod key;
pub mod map;

pub use creator::{Authenticator, Connection, SocketCreator, SocketId, SocketOptions};
pub use key::{ChannelSslOptions, KeyChecksum, SocketMapKey};
pub use map::{SocketHandle, SocketMap, SocketMapOptions, SweepStats};
