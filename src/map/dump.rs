use std::{fmt, net::SocketAddr};

use serde::Serialize;

use crate::{creator::SocketId, error::Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SocketMapEntry {
    pub peer: SocketAddr,
    pub id: SocketId,
    pub ref_count: usize,
}

/// Snapshot of a [`SocketMap`](crate::SocketMap) for exposition, sorted by
/// peer. Renders one `peer ref_count=N` line per socket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SocketMapDump {
    entries: Vec<SocketMapEntry>,
}

impl SocketMapDump {
    pub(crate) fn new(mut entries: Vec<SocketMapEntry>) -> Self {
        entries.sort_by_key(|e| (e.peer, e.id));
        Self { entries }
    }

    #[inline]
    pub fn entries(&self) -> &[SocketMapEntry] {
        &self.entries
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl fmt::Display for SocketMapDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{} ref_count={}", entry.peer, entry.ref_count)?;
        }
        Ok(())
    }
}
