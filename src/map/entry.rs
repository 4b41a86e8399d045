use std::{
    fmt,
    num::NonZeroUsize,
    ops::Deref,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::creator::SocketId;

/// A socket shared through the map.
///
/// Holding a handle keeps the connection object alive but grants no right to
/// close it. It stays usable until released with
/// [`SocketMap::remove`](crate::SocketMap::remove), unless the idle timeout
/// closes it first.
pub struct SocketHandle<S> {
    id: SocketId,
    socket: Arc<S>,
}

impl<S> SocketHandle<S> {
    #[inline]
    pub fn id(&self) -> SocketId {
        self.id
    }

    #[inline]
    pub fn socket(&self) -> &Arc<S> {
        &self.socket
    }
}

impl<S> Clone for SocketHandle<S> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            socket: self.socket.clone(),
        }
    }
}

impl<S> Deref for SocketHandle<S> {
    type Target = S;

    #[inline]
    fn deref(&self) -> &S {
        &self.socket
    }
}

impl<S> PartialEq for SocketHandle<S> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<S> Eq for SocketHandle<S> {}

impl<S> fmt::Debug for SocketHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Reference state of a live entry. An entry leaves the map entirely when it
/// is evicted, there is no third state stored here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefState {
    Active(NonZeroUsize),
    Orphaned { since: Instant },
}

pub(crate) enum Release {
    StillReferenced,
    Orphaned,
    /// More releases than acquires.
    Underflow,
}

pub(crate) struct SingleConnection<S> {
    pub(crate) id: SocketId,
    pub(crate) socket: Arc<S>,
    pub(crate) refs: RefState,
}

impl<S> SingleConnection<S> {
    #[inline]
    pub(crate) fn new(id: SocketId, socket: S) -> Self {
        Self {
            id,
            socket: Arc::new(socket),
            refs: RefState::Active(NonZeroUsize::MIN),
        }
    }

    #[inline]
    pub(crate) fn handle(&self) -> SocketHandle<S> {
        SocketHandle {
            id: self.id,
            socket: self.socket.clone(),
        }
    }

    #[inline]
    pub(crate) fn ref_count(&self) -> usize {
        match self.refs {
            RefState::Active(n) => n.get(),
            RefState::Orphaned { .. } => 0,
        }
    }

    /// Takes one reference. Returns true if the entry was orphaned, which
    /// cancels its pending eviction.
    #[inline]
    pub(crate) fn acquire(&mut self) -> bool {
        match self.refs {
            RefState::Active(n) => {
                self.refs = RefState::Active(n.saturating_add(1));
                false
            }
            RefState::Orphaned { .. } => {
                self.refs = RefState::Active(NonZeroUsize::MIN);
                true
            }
        }
    }

    #[inline]
    pub(crate) fn release(&mut self, now: Instant) -> Release {
        match self.refs {
            RefState::Active(n) => match NonZeroUsize::new(n.get() - 1) {
                Some(left) => {
                    self.refs = RefState::Active(left);
                    Release::StillReferenced
                }
                None => {
                    self.refs = RefState::Orphaned { since: now };
                    Release::Orphaned
                }
            },
            RefState::Orphaned { .. } => Release::Underflow,
        }
    }

    /// Whether nobody has referenced the entry for longer than `grace`.
    /// `None` means no grace at all.
    #[inline]
    pub(crate) fn orphan_expired(&self, now: Instant, grace: Option<Duration>) -> bool {
        match (self.refs, grace) {
            (RefState::Active(_), _) => false,
            (RefState::Orphaned { .. }, None) => true,
            (RefState::Orphaned { since }, Some(grace)) => {
                now.saturating_duration_since(since) > grace
            }
        }
    }
}

/// Placeholder for a socket being created outside the map lock. Inserts of
/// the same key wait on it instead of creating their own socket.
pub(crate) struct PendingConnect {
    done: Mutex<bool>,
    cond: Condvar,
}

impl PendingConnect {
    #[inline]
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }

    pub(crate) fn finish(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }
}

pub(crate) enum Slot<S> {
    Connecting(Arc<PendingConnect>),
    Ready(SingleConnection<S>),
}

impl<S> Slot<S> {
    #[inline]
    pub(crate) fn ready(&self) -> Option<&SingleConnection<S>> {
        match self {
            Self::Ready(sc) => Some(sc),
            Self::Connecting(_) => None,
        }
    }

    #[inline]
    pub(crate) fn ready_mut(&mut self) -> Option<&mut SingleConnection<S>> {
        match self {
            Self::Ready(sc) => Some(sc),
            Self::Connecting(_) => None,
        }
    }
}
