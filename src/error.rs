use std::net::SocketAddr;

use thiserror::Error as ThisError;

use crate::creator::SocketId;

#[derive(ThisError, Debug)]
pub enum SocketMapError {
    #[error("create socket to {peer} failed: {source}")]
    CreationFailed {
        peer: SocketAddr,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("no socket to {peer} in the map")]
    NotFound { peer: SocketAddr },
    #[error("stale socket {expected} for {peer}, map holds {current}")]
    StaleHandle {
        peer: SocketAddr,
        expected: SocketId,
        current: SocketId,
    },
    #[error("socket {id} to {peer} is not referenced by anyone")]
    NotReferenced { peer: SocketAddr, id: SocketId },
    #[error("invalid socket map config {0}")]
    Config(#[from] serde_json::Error),
    #[error("spawn reaper thread failed {0}")]
    SpawnReaper(#[source] std::io::Error),
}

impl SocketMapError {
    #[inline]
    pub(crate) fn creation_failed<E>(peer: SocketAddr, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::CreationFailed {
            peer,
            source: Box::new(source),
        }
    }

    /// `NotFound`, `StaleHandle` and `NotReferenced` come from releasing a
    /// socket the map no longer tracks for the caller. They are safe to ignore.
    #[inline]
    pub fn is_benign_release(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::StaleHandle { .. } | Self::NotReferenced { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SocketMapError>;

pub type Error = SocketMapError;
