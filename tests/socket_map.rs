use std::{
    io,
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc, Arc, Barrier, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use socket_map::{
    Connection, SocketCreator, SocketId, SocketMap, SocketMapError, SocketMapKey,
    SocketMapOptions, SocketOptions,
};

struct SlowSocket {
    created_at: Instant,
    closed: AtomicBool,
}

impl Connection for SlowSocket {
    fn last_active(&self) -> Instant {
        self.created_at
    }

    fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone)]
struct SlowCreator {
    created: Arc<AtomicUsize>,
    delay: Duration,
}

impl SlowCreator {
    fn new(delay: Duration) -> Self {
        Self {
            created: Arc::new(AtomicUsize::new(0)),
            delay,
        }
    }
}

impl SocketCreator for SlowCreator {
    type Socket = SlowSocket;
    type Error = io::Error;

    fn create_socket(&self, _options: &SocketOptions) -> io::Result<SlowSocket> {
        thread::sleep(self.delay);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(SlowSocket {
            created_at: Instant::now(),
            closed: AtomicBool::new(false),
        })
    }
}

/// Fails (or panics) on its first call after a delay, succeeds afterwards.
#[derive(Clone)]
struct FlakyCreator {
    calls: Arc<AtomicUsize>,
    delay: Duration,
    panic_first: bool,
}

impl SocketCreator for FlakyCreator {
    type Socket = SlowSocket;
    type Error = io::Error;

    fn create_socket(&self, _options: &SocketOptions) -> io::Result<SlowSocket> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            thread::sleep(self.delay);
            if self.panic_first {
                panic!("creator panicked");
            }
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        Ok(SlowSocket {
            created_at: Instant::now(),
            closed: AtomicBool::new(false),
        })
    }
}

#[derive(Debug)]
enum Outcome {
    Shared(SocketId),
    Failed,
    Panicked,
}

fn key(port: u16) -> SocketMapKey {
    SocketMapKey::new(SocketAddr::from(([10, 1, 2, 3], port)))
}

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn concurrent_inserts_create_one_socket() {
    init_logging();
    const THREADS: usize = 16;

    let creator = SlowCreator::new(Duration::from_millis(50));
    let options = SocketMapOptions::new(creator.clone()).sweep_interval(None);
    let map = Arc::new(SocketMap::new(options).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let map = map.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                map.insert(&key(7000)).unwrap().id()
            })
        })
        .collect();
    let ids: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert_eq!(creator.created.load(Ordering::SeqCst), 1);
    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(map.ref_count(&key(7000)), Some(THREADS));
}

#[test]
fn creation_on_one_key_does_not_block_others() {
    init_logging();
    let creator = SlowCreator::new(Duration::from_millis(300));
    let options = SocketMapOptions::new(creator).sweep_interval(None);
    let map = Arc::new(SocketMap::new(options).unwrap());

    let slow = {
        let map = map.clone();
        thread::spawn(move || map.insert(&key(7100)).unwrap())
    };
    thread::sleep(Duration::from_millis(50));

    // The map lock is free while the slow creator runs.
    let started = Instant::now();
    assert!(map.find(&key(7100)).is_none());
    assert!(map.list().is_empty());
    assert!(started.elapsed() < Duration::from_millis(200));

    let handle = slow.join().unwrap();
    assert_eq!(map.find(&key(7100)), Some(handle));
}

#[test]
fn balanced_churn_leaves_only_orphans() {
    init_logging();
    const THREADS: usize = 8;
    const ROUNDS: usize = 200;

    let creator = SlowCreator::new(Duration::ZERO);
    let options = SocketMapOptions::new(creator)
        .defer_close_second(3600)
        .sweep_interval(None);
    let map = Arc::new(SocketMap::new(options).unwrap());

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let map = map.clone();
            thread::spawn(move || {
                for round in 0..ROUNDS {
                    let k = key(7200 + ((t + round) % 4) as u16);
                    let h = map.insert(&k).unwrap();
                    map.remove(&k, h.id()).unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    assert_eq!(map.len(), 4);
    for port in 7200..7204 {
        assert_eq!(map.ref_count(&key(port)), Some(0));
    }
    assert!(map
        .dump()
        .entries()
        .iter()
        .all(|entry| entry.ref_count == 0));
}

#[test]
fn background_reaper_evicts_orphans() {
    init_logging();
    let options = SocketMapOptions::new(SlowCreator::new(Duration::ZERO))
        .defer_close_second(0)
        .sweep_interval(Some(Duration::from_millis(20)));
    let map = SocketMap::new(options).unwrap();

    let k = key(7300);
    let h = map.insert(&k).unwrap();
    thread::sleep(Duration::from_millis(100));
    // Referenced sockets are left alone.
    assert!(map.find(&k).is_some());

    map.remove(&k, h.id()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while map.find(&k).is_some() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(map.find(&k).is_none());
    assert!(h.closed.load(Ordering::SeqCst));

    let err = map.remove(&k, h.id()).unwrap_err();
    assert!(matches!(err, SocketMapError::NotFound { .. }));
}

#[test]
fn drop_stops_reaper_and_closes_sockets() {
    init_logging();
    let options = SocketMapOptions::new(SlowCreator::new(Duration::ZERO))
        .defer_close_second(3600)
        .sweep_interval(Some(Duration::from_millis(10)));
    let map = SocketMap::new(options).unwrap();

    let active = map.insert(&key(7400)).unwrap();
    let orphan = map.insert(&key(7401)).unwrap();
    map.remove(&key(7401), orphan.id()).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(!orphan.closed.load(Ordering::SeqCst));

    drop(map);
    assert!(active.closed.load(Ordering::SeqCst));
    assert!(orphan.closed.load(Ordering::SeqCst));
}

/// All threads insert one key while the first creation fails slowly. The
/// waiters must wake up, one of them creates the socket and the rest share it.
fn waiters_retry_after_failed_creation(panic_first: bool, port: u16) {
    init_logging();
    const THREADS: usize = 8;

    let creator = FlakyCreator {
        calls: Arc::new(AtomicUsize::new(0)),
        delay: Duration::from_millis(100),
        panic_first,
    };
    let options = SocketMapOptions::new(creator.clone()).sweep_interval(None);
    let map = Arc::new(SocketMap::new(options).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));
    let (tx, rx) = mpsc::channel();

    for _ in 0..THREADS {
        let map = map.clone();
        let barrier = barrier.clone();
        let tx = tx.clone();
        thread::spawn(move || {
            barrier.wait();
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| map.insert(&key(port))))
            {
                Ok(Ok(handle)) => Outcome::Shared(handle.id()),
                Ok(Err(_)) => Outcome::Failed,
                Err(_) => Outcome::Panicked,
            };
            tx.send(outcome).unwrap();
        });
    }
    drop(tx);

    let outcomes: Vec<_> = (0..THREADS)
        .map(|_| {
            rx.recv_timeout(Duration::from_secs(10))
                .expect("insert did not return")
        })
        .collect();

    let ids: Vec<_> = outcomes
        .iter()
        .filter_map(|outcome| match outcome {
            Outcome::Shared(id) => Some(*id),
            _ => None,
        })
        .collect();
    let failed = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, Outcome::Failed))
        .count();
    let panicked = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, Outcome::Panicked))
        .count();

    assert_eq!(ids.len(), THREADS - 1);
    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!((failed, panicked), if panic_first { (0, 1) } else { (1, 0) });
    assert_eq!(creator.calls.load(Ordering::SeqCst), 2);
    assert_eq!(map.ref_count(&key(port)), Some(ids.len()));
    assert_eq!(map.find(&key(port)).map(|h| h.id()), Some(ids[0]));
}

#[test]
fn waiters_retry_after_creator_error() {
    waiters_retry_after_failed_creation(false, 7500);
}

#[test]
fn waiters_retry_after_creator_panic() {
    waiters_retry_after_failed_creation(true, 7501);
}

#[test]
fn process_wide_map_in_a_static() {
    static SOCKET_MAP: OnceLock<SocketMap<SlowCreator>> = OnceLock::new();

    fn socket_map() -> &'static SocketMap<SlowCreator> {
        SOCKET_MAP.get_or_init(|| {
            let options = SocketMapOptions::new(SlowCreator::new(Duration::ZERO))
                .defer_close_second(3600)
                .sweep_interval(None);
            SocketMap::new(options).unwrap()
        })
    }

    init_logging();
    let k = key(7600);
    let first = thread::spawn(move || socket_map().insert(&key(7600)).unwrap())
        .join()
        .unwrap();
    let second = socket_map().insert(&k).unwrap();
    assert_eq!(first, second);
    assert_eq!(socket_map().ref_count(&k), Some(2));

    socket_map().remove(&k, first.id()).unwrap();
    socket_map().remove(&k, second.id()).unwrap();
    assert_eq!(socket_map().ref_count(&k), Some(0));
}
