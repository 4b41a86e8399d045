use std::{
    io,
    sync::{
        mpsc::{self, RecvTimeoutError},
        Weak,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use super::Shared;
use crate::creator::SocketCreator;

const THREAD_NAME: &str = "socket-map-reaper";

/// Background thread sweeping a map every interval.
///
/// Dropping the reaper stops the thread and waits for it, so no sweep is in
/// progress once the drop returns.
pub(crate) struct Reaper {
    // Dropping the sender is the stop signal.
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    pub(crate) fn spawn<C: SocketCreator>(
        shared: Weak<Shared<C>>,
        interval: Duration,
    ) -> io::Result<Self> {
        let (stop, stopped) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_owned())
            .spawn(move || run(shared, stopped, interval))?;
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                #[cfg(feature = "logging")]
                tracing::warn!("socket map reaper panicked");
            }
        }
    }
}

fn run<C: SocketCreator>(
    shared: Weak<Shared<C>>,
    stopped: mpsc::Receiver<()>,
    interval: Duration,
) {
    loop {
        match stopped.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => (),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                #[cfg(feature = "logging")]
                tracing::debug!("socket map reaper stopped");
                return;
            }
        }

        match shared.upgrade() {
            Some(shared) => {
                shared.sweep_at(Instant::now());
            }
            None => {
                #[cfg(feature = "logging")]
                tracing::debug!("socket map gone, reaper exit");
                return;
            }
        }
    }
}
