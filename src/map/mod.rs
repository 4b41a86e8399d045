//! Sharing of outgoing sockets between channels.
//!
//! Channels talking to the same peer with the same TLS options and
//! authenticator share one socket through a [`SocketMap`]. Every successful
//! [`SocketMap::insert`] must be paired with one [`SocketMap::remove`]. A
//! socket nobody references is kept for a grace period so a new channel can
//! pick it up again, then a background reaper closes it.
mod dump;
mod entry;
mod options;
mod reaper;

use std::{
    collections::{hash_map::Entry, HashMap},
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

pub use dump::{SocketMapDump, SocketMapEntry};
use entry::{PendingConnect, Release, SingleConnection, Slot};
pub use entry::SocketHandle;
pub use options::{DynamicSeconds, SocketMapConfig, SocketMapOptions};
use parking_lot::Mutex;
use reaper::Reaper;

use crate::{
    creator::{Connection, SocketCreator, SocketId, SocketOptions},
    error::{Result, SocketMapError},
    key::{KeyChecksum, SocketMapKey},
};

type Handle<C> = SocketHandle<<C as SocketCreator>::Socket>;

/// What one reaper pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub idle_closed: usize,
    pub orphans_evicted: usize,
}

/// Share sockets to the same peer.
///
/// There is no process-wide default map. Callers wanting one keep it in a
/// static, e.g. `static SOCKET_MAP: OnceLock<SocketMap<MyCreator>>`, and
/// initialize it on first use with [`SocketMap::new`].
pub struct SocketMap<C: SocketCreator> {
    shared: Arc<Shared<C>>,
    reaper: Option<Reaper>,
}

pub(crate) struct Shared<C: SocketCreator> {
    options: SocketMapOptions<C>,
    map: Mutex<HashMap<KeyChecksum, Slot<C::Socket>>>,
    next_id: AtomicU64,
}

enum Lookup<S> {
    Shared(SocketHandle<S>),
    Wait(Arc<PendingConnect>),
    Create(Arc<PendingConnect>),
}

impl<C: SocketCreator> SocketMap<C> {
    /// Creates the map and, unless `options.sweep_interval` is `None`, starts
    /// its reaper thread.
    pub fn new(options: SocketMapOptions<C>) -> Result<Self> {
        let interval = options.sweep_interval;
        let shared = Arc::new(Shared {
            map: Mutex::new(HashMap::with_capacity(options.suggested_map_size)),
            options,
            next_id: AtomicU64::new(1),
        });
        let reaper = match interval {
            Some(interval) => Some(
                Reaper::spawn(Arc::downgrade(&shared), interval)
                    .map_err(SocketMapError::SpawnReaper)?,
            ),
            None => None,
        };
        Ok(Self { shared, reaper })
    }

    #[inline]
    pub fn options(&self) -> &SocketMapOptions<C> {
        &self.shared.options
    }

    /// Shares the socket of `key`, creating it if there is none.
    ///
    /// Concurrent inserts of a new key create exactly one socket: the first
    /// caller runs the creator, the others wait for it and share its result.
    /// On success the caller owns one reference and must give it back with
    /// [`remove`](Self::remove).
    pub fn insert(&self, key: &SocketMapKey) -> Result<Handle<C>> {
        let checksum = KeyChecksum::new(key);
        loop {
            let lookup = {
                let mut map = self.shared.map.lock();
                match map.entry(checksum) {
                    Entry::Occupied(mut occupied) => match occupied.get_mut() {
                        Slot::Ready(sc) => {
                            let _reclaimed = sc.acquire();
                            #[cfg(feature = "logging")]
                            tracing::debug!(
                                peer = %key.peer(),
                                id = %sc.id,
                                ref_count = sc.ref_count(),
                                reclaimed = _reclaimed,
                                "socket shared"
                            );
                            Lookup::Shared(sc.handle())
                        }
                        Slot::Connecting(pending) => Lookup::Wait(pending.clone()),
                    },
                    Entry::Vacant(vacant) => {
                        let pending = PendingConnect::new();
                        vacant.insert(Slot::Connecting(pending.clone()));
                        Lookup::Create(pending)
                    }
                }
            };

            match lookup {
                Lookup::Shared(handle) => return Ok(handle),
                Lookup::Create(pending) => return self.connect(key, checksum, pending),
                // Look again once the creator is done: the socket is there, or
                // creation failed and this caller may become the next creator.
                Lookup::Wait(pending) => pending.wait(),
            }
        }
    }

    fn connect(
        &self,
        key: &SocketMapKey,
        checksum: KeyChecksum,
        pending: Arc<PendingConnect>,
    ) -> Result<Handle<C>> {
        let mut guard = ConnectGuard {
            shared: self.shared.as_ref(),
            checksum,
            pending,
            installed: false,
        };
        let options = SocketOptions {
            remote_side: key.peer(),
            ssl_options: key.ssl_options().cloned(),
            auth: key.auth(),
        };
        let socket = self
            .shared
            .options
            .socket_creator
            .create_socket(&options)
            .map_err(|e| {
                #[cfg(feature = "logging")]
                tracing::debug!(peer = %key.peer(), error = %e, "create socket failed");
                SocketMapError::creation_failed(key.peer(), e)
            })?;

        let sc = SingleConnection::new(self.shared.next_id(), socket);
        let handle = sc.handle();
        self.shared.map.lock().insert(checksum, Slot::Ready(sc));
        guard.installed = true;

        #[cfg(feature = "logging")]
        tracing::debug!(peer = %key.peer(), id = %handle.id(), "socket created");
        Ok(handle)
    }

    /// The socket of `key`, without taking a reference. Orphaned sockets in
    /// their grace period are found too.
    pub fn find(&self, key: &SocketMapKey) -> Option<Handle<C>> {
        let checksum = KeyChecksum::new(key);
        let map = self.shared.map.lock();
        map.get(&checksum)?.ready().map(SingleConnection::handle)
    }

    /// Current reference count of the socket of `key`.
    pub fn ref_count(&self, key: &SocketMapKey) -> Option<usize> {
        let checksum = KeyChecksum::new(key);
        let map = self.shared.map.lock();
        map.get(&checksum)?.ready().map(SingleConnection::ref_count)
    }

    /// Gives back the reference taken by [`insert`](Self::insert).
    ///
    /// Nothing happens unless the map still holds socket `id` for `key`: a
    /// caller racing with eviction may hold an id the map already replaced.
    /// The last release leaves the socket in the map; the reaper closes it
    /// once `defer_close_second` has passed.
    pub fn remove(&self, key: &SocketMapKey, id: SocketId) -> Result<()> {
        let checksum = KeyChecksum::new(key);
        let peer = key.peer();
        let now = Instant::now();
        let mut map = self.shared.map.lock();

        let Some(sc) = map.get_mut(&checksum).and_then(Slot::ready_mut) else {
            #[cfg(feature = "logging")]
            tracing::debug!(%peer, %id, "remove socket not in the map");
            return Err(SocketMapError::NotFound { peer });
        };
        if sc.id != id {
            #[cfg(feature = "logging")]
            tracing::debug!(%peer, %id, current = %sc.id, "remove stale socket");
            return Err(SocketMapError::StaleHandle {
                peer,
                expected: id,
                current: sc.id,
            });
        }

        match sc.release(now) {
            Release::StillReferenced => {
                #[cfg(feature = "logging")]
                tracing::debug!(%peer, %id, ref_count = sc.ref_count(), "socket released");
                Ok(())
            }
            Release::Orphaned => {
                #[cfg(feature = "logging")]
                tracing::debug!(%peer, %id, "socket orphaned");
                Ok(())
            }
            Release::Underflow => {
                #[cfg(feature = "logging")]
                tracing::warn!(%peer, %id, "socket released more times than shared");
                Err(SocketMapError::NotReferenced { peer, id })
            }
        }
    }

    /// Point-in-time copy of all sockets in the map.
    pub fn list(&self) -> Vec<Handle<C>> {
        let map = self.shared.map.lock();
        map.values()
            .filter_map(Slot::ready)
            .map(SingleConnection::handle)
            .collect()
    }

    /// Point-in-time copy of the peers of all sockets in the map.
    pub fn list_peers(&self) -> Vec<SocketAddr> {
        let map = self.shared.map.lock();
        map.iter()
            .filter(|(_, slot)| slot.ready().is_some())
            .map(|(checksum, _)| checksum.peer())
            .collect()
    }

    /// Number of sockets in the map, orphans included.
    pub fn len(&self) -> usize {
        let map = self.shared.map.lock();
        map.values().filter(|slot| slot.ready().is_some()).count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Peers and reference counts, for diagnostics.
    pub fn dump(&self) -> SocketMapDump {
        let map = self.shared.map.lock();
        SocketMapDump::new(
            map.iter()
                .filter_map(|(checksum, slot)| slot.ready().map(|sc| (checksum, sc)))
                .map(|(checksum, sc)| SocketMapEntry {
                    peer: checksum.peer(),
                    id: sc.id,
                    ref_count: sc.ref_count(),
                })
                .collect(),
        )
    }

    /// Runs one reaper pass now.
    #[inline]
    pub fn sweep(&self) -> SweepStats {
        self.shared.sweep_at(Instant::now())
    }

    /// Runs one reaper pass as if the current time were `now`.
    #[inline]
    pub fn sweep_at(&self, now: Instant) -> SweepStats {
        self.shared.sweep_at(now)
    }
}

impl<C: SocketCreator> std::fmt::Debug for SocketMap<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketMap")
            .field("options", &self.shared.options)
            .field("len", &self.len())
            .field("reaper", &self.reaper.is_some())
            .finish()
    }
}

impl<C: SocketCreator> Drop for SocketMap<C> {
    fn drop(&mut self) {
        // The reaper must be gone before the final close, it may be closing
        // sockets itself.
        drop(self.reaper.take());

        let sockets: Vec<_> = self
            .shared
            .map
            .lock()
            .drain()
            .filter_map(|(checksum, slot)| match slot {
                Slot::Ready(sc) => Some((checksum.peer(), sc.id, sc.socket)),
                Slot::Connecting(_) => None,
            })
            .collect();

        #[cfg(feature = "logging")]
        if !sockets.is_empty() {
            tracing::info!(count = sockets.len(), "socket map dropped, closing sockets");
        }
        close_sockets(sockets, "map dropped");
    }
}

impl<C: SocketCreator> Shared<C> {
    #[inline]
    fn next_id(&self) -> SocketId {
        SocketId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn sweep_at(&self, now: Instant) -> SweepStats {
        // Both settings may be reloaded at any time, read them once per pass.
        let idle_timeout = self.options.idle_timeout_second.positive();
        let defer_close = self.options.defer_close_second.positive();

        let stats = SweepStats {
            idle_closed: idle_timeout.map_or(0, |idle| self.close_idle(now, idle)),
            orphans_evicted: self.evict_orphans(now, defer_close),
        };
        #[cfg(feature = "logging")]
        if stats != SweepStats::default() {
            tracing::debug!(
                idle_closed = stats.idle_closed,
                orphans_evicted = stats.orphans_evicted,
                "socket map swept"
            );
        }
        stats
    }

    /// Removes sockets without traffic for `idle`, referenced or not.
    fn close_idle(&self, now: Instant, idle: Duration) -> usize {
        let snapshot: Vec<_> = {
            let map = self.map.lock();
            map.iter()
                .filter_map(|(checksum, slot)| {
                    slot.ready()
                        .map(|sc| (*checksum, sc.id, sc.socket.clone()))
                })
                .collect()
        };
        // `last_active` belongs to the connection, don't call it under the lock.
        let idle_ids: Vec<_> = snapshot
            .into_iter()
            .filter(|(_, _, socket)| now.saturating_duration_since(socket.last_active()) >= idle)
            .map(|(checksum, id, _)| (checksum, id))
            .collect();
        if idle_ids.is_empty() {
            return 0;
        }

        let victims: Vec<_> = {
            let mut map = self.map.lock();
            idle_ids
                .into_iter()
                .filter_map(|(checksum, id)| {
                    // The socket may have been replaced since the snapshot.
                    let unchanged = map
                        .get(&checksum)
                        .and_then(Slot::ready)
                        .is_some_and(|sc| sc.id == id);
                    if !unchanged {
                        return None;
                    }
                    match map.remove(&checksum) {
                        Some(Slot::Ready(sc)) => Some((checksum.peer(), sc.id, sc.socket)),
                        _ => None,
                    }
                })
                .collect()
        };
        let closed = victims.len();
        close_sockets(victims, "idle");
        closed
    }

    /// Removes sockets nobody referenced for longer than `grace`.
    fn evict_orphans(&self, now: Instant, grace: Option<Duration>) -> usize {
        let victims: Vec<_> = {
            let mut map = self.map.lock();
            let expired: Vec<KeyChecksum> = map
                .iter()
                .filter(|(_, slot)| slot.ready().is_some_and(|sc| sc.orphan_expired(now, grace)))
                .map(|(checksum, _)| *checksum)
                .collect();
            expired
                .into_iter()
                .filter_map(|checksum| match map.remove(&checksum) {
                    Some(Slot::Ready(sc)) => Some((checksum.peer(), sc.id, sc.socket)),
                    _ => None,
                })
                .collect()
        };
        let evicted = victims.len();
        close_sockets(victims, "orphan");
        evicted
    }
}

/// Closes sockets already taken out of the map. A failed or panicking close
/// is only logged, the entries are gone either way and the rest of the batch
/// still gets closed.
fn close_sockets<S: Connection>(sockets: Vec<(SocketAddr, SocketId, Arc<S>)>, reason: &'static str) {
    for (peer, id, socket) in sockets {
        let result = panic::catch_unwind(AssertUnwindSafe(|| socket.close()));
        #[cfg(feature = "logging")]
        match result {
            Ok(Ok(())) => tracing::info!(%peer, %id, reason, "socket closed"),
            Ok(Err(e)) => tracing::warn!(%peer, %id, reason, error = %e, "close socket failed"),
            Err(_) => tracing::error!(%peer, %id, reason, "close socket panicked"),
        }
        #[cfg(not(feature = "logging"))]
        let _ = (peer, id, reason, result);
    }
}

/// Takes the placeholder out again if the creator failed or panicked, and
/// wakes the inserts waiting on it either way.
struct ConnectGuard<'a, C: SocketCreator> {
    shared: &'a Shared<C>,
    checksum: KeyChecksum,
    pending: Arc<PendingConnect>,
    installed: bool,
}

impl<C: SocketCreator> Drop for ConnectGuard<'_, C> {
    fn drop(&mut self) {
        if !self.installed {
            let mut map = self.shared.map.lock();
            if let Some(Slot::Connecting(pending)) = map.get(&self.checksum) {
                if Arc::ptr_eq(pending, &self.pending) {
                    map.remove(&self.checksum);
                }
            }
        }
        self.pending.finish();
    }
}
