use std::{
    fmt,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub(crate) const DEFAULT_MAP_SIZE: usize = 1024;
pub(crate) const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
pub(crate) const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// A number of seconds, either fixed at construction or read from a shared
/// cell every time it is used so it can be changed at runtime.
#[derive(Debug, Clone)]
pub enum DynamicSeconds {
    Fixed(i64),
    Dynamic(Arc<AtomicI64>),
}

impl DynamicSeconds {
    #[inline]
    pub fn get(&self) -> i64 {
        match self {
            Self::Fixed(secs) => *secs,
            Self::Dynamic(secs) => secs.load(Ordering::Relaxed),
        }
    }

    /// The current value as a duration, `None` for non-positive values.
    #[inline]
    pub fn positive(&self) -> Option<Duration> {
        match self.get() {
            secs if secs > 0 => Some(Duration::from_secs(secs as u64)),
            _ => None,
        }
    }
}

impl Default for DynamicSeconds {
    #[inline]
    fn default() -> Self {
        Self::Fixed(0)
    }
}

impl From<i64> for DynamicSeconds {
    #[inline]
    fn from(secs: i64) -> Self {
        Self::Fixed(secs)
    }
}

impl From<Arc<AtomicI64>> for DynamicSeconds {
    #[inline]
    fn from(secs: Arc<AtomicI64>) -> Self {
        Self::Dynamic(secs)
    }
}

/// The plain-data part of [`SocketMapOptions`], loadable from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketMapConfig {
    pub suggested_map_size: usize,
    pub idle_timeout_second: i64,
    pub defer_close_second: i64,
    /// 0 disables the background reaper.
    pub sweep_interval_ms: u64,
}

impl Default for SocketMapConfig {
    fn default() -> Self {
        Self {
            suggested_map_size: DEFAULT_MAP_SIZE,
            idle_timeout_second: 0,
            defer_close_second: 0,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL.as_millis() as u64,
        }
    }
}

impl SocketMapConfig {
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

pub struct SocketMapOptions<C> {
    /// Creates sockets by need. Owned by the map.
    pub socket_creator: C,
    /// Initial capacity of the map.
    pub suggested_map_size: usize,
    /// Sockets without data transmission for so many seconds are closed,
    /// referenced or not. Non-positive disables it.
    pub idle_timeout_second: DynamicSeconds,
    /// Sockets nobody references are kept for so many seconds before being
    /// closed, so a channel created soon after can pick them up again.
    /// Non-positive closes them at the next sweep.
    pub defer_close_second: DynamicSeconds,
    /// How often the reaper sweeps. `None` runs no reaper thread, sweeps then
    /// only happen through [`SocketMap::sweep`](crate::SocketMap::sweep).
    pub sweep_interval: Option<Duration>,
}

impl<C> SocketMapOptions<C> {
    pub fn new(socket_creator: C) -> Self {
        Self {
            socket_creator,
            suggested_map_size: DEFAULT_MAP_SIZE,
            idle_timeout_second: DynamicSeconds::default(),
            defer_close_second: DynamicSeconds::default(),
            sweep_interval: Some(DEFAULT_SWEEP_INTERVAL),
        }
    }

    pub fn with_config(socket_creator: C, config: &SocketMapConfig) -> Self {
        let sweep_interval = match config.sweep_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms).max(MIN_SWEEP_INTERVAL)),
        };
        Self {
            socket_creator,
            suggested_map_size: config.suggested_map_size,
            idle_timeout_second: config.idle_timeout_second.into(),
            defer_close_second: config.defer_close_second.into(),
            sweep_interval,
        }
    }

    pub fn suggested_map_size(mut self, size: usize) -> Self {
        self.suggested_map_size = size;
        self
    }

    pub fn idle_timeout_second(mut self, secs: impl Into<DynamicSeconds>) -> Self {
        self.idle_timeout_second = secs.into();
        self
    }

    pub fn defer_close_second(mut self, secs: impl Into<DynamicSeconds>) -> Self {
        self.defer_close_second = secs.into();
        self
    }

    pub fn sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval.map(|i| i.max(MIN_SWEEP_INTERVAL));
        self
    }
}

impl<C> fmt::Debug for SocketMapOptions<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketMapOptions")
            .field("suggested_map_size", &self.suggested_map_size)
            .field("idle_timeout_second", &self.idle_timeout_second)
            .field("defer_close_second", &self.defer_close_second)
            .field("sweep_interval", &self.sweep_interval)
            .finish_non_exhaustive()
    }
}
