// rust/boost-runtime/src/tracker/socket.rs

//! TCP rendezvous tracker.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use tracing::{debug, info, warn};

use super::protocol::{RankAssignment, WorkerMessage};
use super::{
    Tracker, TrackerFactory, CODE_STOPPED, CODE_SUCCESS, CODE_TIMEOUT, CODE_WORKER_FAILED,
    ENV_NUM_WORKER, ENV_TRACKER_PORT, ENV_TRACKER_URI,
};
use crate::config::TrackerConfig;
use crate::error::{BoostError, Result};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

enum TrackerEvent {
    Shutdown { rank: u32 },
    Failed { rank: Option<u32>, reason: String },
}

struct Shared {
    num_workers: u32,
    stopped: AtomicBool,
    next_rank: AtomicU32,
    events: Sender<TrackerEvent>,
    connections: Mutex<Vec<TcpStream>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tracker that hands out ranks over TCP and collects shutdown reports.
///
/// Ranks are assigned in connection order. The round succeeds once every
/// rank has sent `shutdown`; any `error` message or a connection closed
/// before `shutdown` fails it.
pub struct SocketTracker {
    host: String,
    port: u16,
    shared: Arc<Shared>,
    events: Receiver<TrackerEvent>,
    stop_signal: Receiver<()>,
    stop_sender: Mutex<Option<Sender<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl SocketTracker {
    pub fn new(config: &TrackerConfig, num_workers: usize) -> Result<Self> {
        let num_workers = u32::try_from(num_workers)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                BoostError::config(format!("tracker cannot serve {num_workers} workers"))
            })?;

        let (events_tx, events_rx) = channel::unbounded();
        let (stop_tx, stop_rx) = channel::bounded(0);

        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            shared: Arc::new(Shared {
                num_workers,
                stopped: AtomicBool::new(false),
                next_rank: AtomicU32::new(0),
                events: events_tx,
                connections: Mutex::new(Vec::new()),
            }),
            events: events_rx,
            stop_signal: stop_rx,
            stop_sender: Mutex::new(Some(stop_tx)),
            local_addr: Mutex::new(None),
            acceptor: Mutex::new(None),
        })
    }

    /// Address the tracker is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    pub fn num_workers(&self) -> u32 {
        self.shared.num_workers
    }

    fn next_event(&self, deadline: Option<Instant>) -> std::result::Result<TrackerEvent, i32> {
        match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                select! {
                    recv(self.events) -> event => event.map_err(|_| CODE_STOPPED),
                    recv(self.stop_signal) -> _ => Err(CODE_STOPPED),
                    default(remaining) => Err(CODE_TIMEOUT),
                }
            }
            None => select! {
                recv(self.events) -> event => event.map_err(|_| CODE_STOPPED),
                recv(self.stop_signal) -> _ => Err(CODE_STOPPED),
            },
        }
    }
}

impl Tracker for SocketTracker {
    fn start(&self, timeout: Option<Duration>) -> Result<bool> {
        let mut acceptor = lock(&self.acceptor);
        if acceptor.is_some() {
            return Ok(true);
        }

        let listener = TcpListener::bind((self.host.as_str(), self.port)).map_err(|e| {
            BoostError::tracker_with_source(
                format!("failed to bind tracker to {}:{}", self.host, self.port),
                e,
            )
        })?;
        let addr = listener
            .local_addr()
            .map_err(|e| BoostError::tracker_with_source("failed to read tracker address", e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| BoostError::tracker_with_source("failed to configure tracker socket", e))?;
        *lock(&self.local_addr) = Some(addr);

        let (ready_tx, ready_rx) = channel::bounded(1);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("dbr-tracker-accept".to_string())
            .spawn(move || {
                let _ = ready_tx.send(());
                accept_loop(&listener, &shared);
            })
            .map_err(|e| BoostError::tracker_with_source("failed to spawn tracker thread", e))?;
        *acceptor = Some(handle);

        let ready = match timeout {
            Some(timeout) => ready_rx.recv_timeout(timeout).is_ok(),
            None => ready_rx.recv().is_ok(),
        };
        if ready {
            info!(
                "Tracker listening on {} for {} workers",
                addr, self.shared.num_workers
            );
        }
        Ok(ready)
    }

    fn worker_env(&self) -> BTreeMap<String, String> {
        let (uri, port) = match self.local_addr() {
            Some(addr) => (addr.ip().to_string(), addr.port()),
            None => (self.host.clone(), self.port),
        };

        let mut env = BTreeMap::new();
        env.insert(ENV_TRACKER_URI.to_string(), uri);
        env.insert(ENV_TRACKER_PORT.to_string(), port.to_string());
        env.insert(ENV_NUM_WORKER.to_string(), self.shared.num_workers.to_string());
        env
    }

    fn wait_for(&self, timeout: Option<Duration>) -> i32 {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut finished = 0u32;

        loop {
            match self.next_event(deadline) {
                Ok(TrackerEvent::Shutdown { rank }) => {
                    finished += 1;
                    debug!(
                        "Worker rank {} shut down ({}/{})",
                        rank, finished, self.shared.num_workers
                    );
                    if finished == self.shared.num_workers {
                        info!("All {} workers finished", finished);
                        return CODE_SUCCESS;
                    }
                }
                Ok(TrackerEvent::Failed { rank, reason }) => {
                    match rank {
                        Some(rank) => warn!("Worker rank {} failed: {}", rank, reason),
                        None => warn!("Worker connection failed: {}", reason),
                    }
                    return CODE_WORKER_FAILED;
                }
                Err(code) => {
                    if code == CODE_TIMEOUT {
                        warn!(
                            "Timed out with {}/{} workers finished",
                            finished, self.shared.num_workers
                        );
                    }
                    return code;
                }
            }
        }
    }

    fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        drop(lock(&self.stop_sender).take());

        for conn in lock(&self.shared.connections).drain(..) {
            let _ = conn.shutdown(Shutdown::Both);
        }

        if let Some(handle) = lock(&self.acceptor).take() {
            if handle.join().is_err() {
                warn!("Tracker accept thread panicked");
            }
        }
        debug!("Tracker stopped");
    }
}

impl Drop for SocketTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: &TcpListener, shared: &Arc<Shared>) {
    let mut handlers = Vec::new();

    while !shared.stopped.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("Worker connected from {}", peer);
                let conn_shared = Arc::clone(shared);
                let spawned = thread::Builder::new()
                    .name("dbr-tracker-conn".to_string())
                    .spawn(move || {
                        if let Err(e) = serve_worker(stream, &conn_shared) {
                            let _ = conn_shared.events.send(TrackerEvent::Failed {
                                rank: None,
                                reason: e.to_string(),
                            });
                        }
                    });
                match spawned {
                    Ok(handle) => handlers.push(handle),
                    Err(e) => {
                        let _ = shared.events.send(TrackerEvent::Failed {
                            rank: None,
                            reason: format!("failed to spawn connection thread: {e}"),
                        });
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(e) => {
                let _ = shared.events.send(TrackerEvent::Failed {
                    rank: None,
                    reason: format!("accept failed: {e}"),
                });
                break;
            }
        }
    }

    for handle in handlers {
        let _ = handle.join();
    }
}

fn io_error(context: &str) -> impl FnOnce(std::io::Error) -> BoostError + '_ {
    move |e| BoostError::tracker_with_source(context, e)
}

fn serve_worker(stream: TcpStream, shared: &Shared) -> Result<()> {
    stream
        .set_nonblocking(false)
        .map_err(io_error("failed to configure worker connection"))?;
    {
        let mut connections = lock(&shared.connections);
        // stop() shuts down registered connections; anything later is ignored.
        if shared.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        connections.push(stream.try_clone().map_err(io_error("failed to clone connection"))?);
    }

    let mut writer = stream.try_clone().map_err(io_error("failed to clone connection"))?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    let read = reader
        .read_line(&mut line)
        .map_err(io_error("failed to read start message"))?;
    if read == 0 {
        return Err(BoostError::tracker("worker disconnected before start"));
    }
    let task_id = match line.parse::<WorkerMessage>()? {
        WorkerMessage::Start { task_id } => task_id,
        other => {
            return Err(BoostError::tracker(format!(
                "expected start message, got '{other}'"
            )))
        }
    };

    let rank = shared.next_rank.fetch_add(1, Ordering::SeqCst);
    if rank >= shared.num_workers {
        return Err(BoostError::tracker(format!(
            "task {task_id} connected but all {} ranks are taken",
            shared.num_workers
        )));
    }
    let assignment = RankAssignment {
        rank,
        world_size: shared.num_workers,
    };
    writeln!(writer, "{assignment}")
        .and_then(|()| writer.flush())
        .map_err(io_error("failed to send rank assignment"))?;
    debug!("Assigned rank {} to task {}", rank, task_id);

    line.clear();
    let event = match reader.read_line(&mut line) {
        Ok(0) | Err(_) => TrackerEvent::Failed {
            rank: Some(rank),
            reason: "disconnected before shutdown".to_string(),
        },
        Ok(_) => match line.parse::<WorkerMessage>() {
            Ok(WorkerMessage::Shutdown { .. }) => TrackerEvent::Shutdown { rank },
            Ok(WorkerMessage::Error { message, .. }) => TrackerEvent::Failed {
                rank: Some(rank),
                reason: message,
            },
            Ok(other) => TrackerEvent::Failed {
                rank: Some(rank),
                reason: format!("unexpected message '{other}'"),
            },
            Err(e) => TrackerEvent::Failed {
                rank: Some(rank),
                reason: e.to_string(),
            },
        },
    };
    let _ = shared.events.send(event);
    Ok(())
}

/// Creates one [`SocketTracker`] per round from a fixed configuration.
#[derive(Debug, Clone)]
pub struct SocketTrackerFactory {
    config: TrackerConfig,
}

impl SocketTrackerFactory {
    pub fn new(config: TrackerConfig) -> Self {
        Self { config }
    }
}

impl TrackerFactory for SocketTrackerFactory {
    fn create(&self, num_workers: usize) -> Result<Arc<dyn Tracker>> {
        Ok(Arc::new(SocketTracker::new(&self.config, num_workers)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{TrackerClient, ENV_TASK_ID};

    fn started_tracker(num_workers: usize) -> Arc<SocketTracker> {
        let tracker = Arc::new(SocketTracker::new(&TrackerConfig::default(), num_workers).unwrap());
        assert!(tracker.start(Some(Duration::from_secs(5))).unwrap());
        tracker
    }

    fn task_env(tracker: &SocketTracker, task_id: usize) -> BTreeMap<String, String> {
        let mut env = tracker.worker_env();
        env.insert(ENV_TASK_ID.to_string(), task_id.to_string());
        env
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(SocketTracker::new(&TrackerConfig::default(), 0).is_err());
    }

    #[test]
    fn test_worker_env_after_start() {
        let tracker = started_tracker(3);
        let env = tracker.worker_env();

        assert_eq!(env.get(ENV_TRACKER_URI).map(String::as_str), Some("127.0.0.1"));
        let port: u16 = env[ENV_TRACKER_PORT].parse().unwrap();
        assert_ne!(port, 0);
        assert_eq!(env[ENV_NUM_WORKER], "3");
        tracker.stop();
    }

    #[test]
    fn test_all_workers_shutdown_returns_success() {
        let tracker = started_tracker(3);

        let workers: Vec<_> = (0..3)
            .map(|task| {
                let env = task_env(&tracker, task);
                thread::spawn(move || {
                    let client = TrackerClient::connect(&env).unwrap();
                    assert_eq!(client.world_size(), 3);
                    let rank = client.rank();
                    client.shutdown().unwrap();
                    rank
                })
            })
            .collect();

        assert_eq!(tracker.wait_for(Some(Duration::from_secs(10))), CODE_SUCCESS);

        let mut ranks: Vec<u32> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        ranks.sort_unstable();
        assert_eq!(ranks, vec![0, 1, 2]);
        tracker.stop();
    }

    #[test]
    fn test_disconnect_without_shutdown_fails() {
        let tracker = started_tracker(2);
        let addr = tracker.local_addr().unwrap();

        let worker = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            writeln!(stream, "start 0").unwrap();
            let mut line = String::new();
            BufReader::new(stream.try_clone().unwrap()).read_line(&mut line).unwrap();
            assert!(line.starts_with("rank 0 2"));
            // Connection dropped here without a shutdown message.
        });
        worker.join().unwrap();

        assert_eq!(tracker.wait_for(Some(Duration::from_secs(10))), CODE_WORKER_FAILED);
    }

    #[test]
    fn test_reported_error_fails() {
        let tracker = started_tracker(2);
        let env = task_env(&tracker, 0);

        let worker = thread::spawn(move || {
            let client = TrackerClient::connect(&env).unwrap();
            client.report_error("native training failed").unwrap();
        });

        assert_eq!(tracker.wait_for(Some(Duration::from_secs(10))), CODE_WORKER_FAILED);
        worker.join().unwrap();
    }

    #[test]
    fn test_timeout_without_workers() {
        let tracker = started_tracker(1);
        assert_eq!(tracker.wait_for(Some(Duration::from_millis(100))), CODE_TIMEOUT);
    }

    #[test]
    fn test_stop_unblocks_wait() {
        let tracker = started_tracker(2);
        let waiter = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || tracker.wait_for(None))
        };

        thread::sleep(Duration::from_millis(50));
        tracker.stop();
        assert_eq!(waiter.join().unwrap(), CODE_STOPPED);

        // Stopping twice is harmless.
        tracker.stop();
    }

    #[test]
    fn test_factory_creates_fresh_trackers() {
        let factory = SocketTrackerFactory::new(TrackerConfig::default());
        let a = factory.create(2).unwrap();
        let b = factory.create(2).unwrap();
        assert!(a.start(None).unwrap());
        assert!(b.start(None).unwrap());
        assert_ne!(a.worker_env()[ENV_TRACKER_PORT], b.worker_env()[ENV_TRACKER_PORT]);
        a.stop();
        b.stop();
    }
}
