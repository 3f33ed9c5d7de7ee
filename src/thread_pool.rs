//! Thread-per-connection serving.
//!
//! The alternative to the event loop: an accept thread hands every peer to
//! a dedicated worker that uses blocking I/O. Workers are tracked by a
//! [`ThreadRegistry`] so shutdown can unblock them and wait for them with a
//! bounded timeout.

use std::{
    net::{Shutdown, SocketAddrV4},
    os::fd::RawFd,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, Builder, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    error::{NetError, Result},
    net::{
        socket::shutdown_raw,
        tcp::{traits::ConnectionId, TcpConnection, TcpListener, TcpServerConfig},
    },
};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(250);
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Blocking body of one connection's worker thread.
///
/// The connection is in blocking mode: [`TcpConnection::read_some`] waits
/// for data and [`TcpConnection::flush`] writes everything queued. Returning
/// ends the worker and closes the connection; [`NetError::GracefulClose`] and
/// disconnect errors count as a normal end.
pub trait PeerHandler: Send + Sync + 'static {
    fn serve(&self, conn_id: ConnectionId, conn: &mut TcpConnection) -> Result<()>;
}

struct WorkerEntry {
    conn_id: ConnectionId,
    fd: RawFd,
    thread: Option<JoinHandle<()>>,
}

/// Mutex-guarded list of live workers.
///
/// A worker leaves the list before it closes its socket; its thread handle
/// moves to `exited` so shutdown can join it.
#[derive(Default)]
pub struct ThreadRegistry {
    workers: Mutex<Vec<WorkerEntry>>,
    exited: Mutex<Vec<JoinHandle<()>>>,
    stopping: AtomicBool,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<WorkerEntry>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tracks a worker serving `fd`. Refused once shutdown has begun.
    pub fn register(&self, conn_id: ConnectionId, fd: RawFd) -> bool {
        let mut workers = self.lock();
        if self.stopping.load(Ordering::Acquire) {
            return false;
        }
        workers.push(WorkerEntry {
            conn_id,
            fd,
            thread: None,
        });
        true
    }

    /// Hands over the thread serving `conn_id`, which may already have left.
    pub(crate) fn attach(&self, conn_id: ConnectionId, thread: JoinHandle<()>) {
        let mut workers = self.lock();
        match workers.iter_mut().find(|worker| worker.conn_id == conn_id) {
            Some(worker) => worker.thread = Some(thread),
            None => {
                drop(workers);
                self.retire(thread);
            }
        }
    }

    /// Must run before the worker closes its descriptor.
    pub fn unregister(&self, conn_id: ConnectionId) {
        let thread = {
            let mut workers = self.lock();
            workers
                .iter()
                .position(|worker| worker.conn_id == conn_id)
                .and_then(|idx| workers.swap_remove(idx).thread)
        };
        if let Some(thread) = thread {
            self.retire(thread);
        }
    }

    fn retire(&self, thread: JoinHandle<()>) {
        let mut exited = self.exited.lock().unwrap_or_else(PoisonError::into_inner);
        // Threads that already finished need no join.
        exited.retain(|thread| !thread.is_finished());
        exited.push(thread);
    }

    // A worker whose thread ended without unregistering panicked.
    fn reap_panicked(&self) {
        let dead: Vec<WorkerEntry> = {
            let mut workers = self.lock();
            let (dead, live): (Vec<_>, Vec<_>) = workers
                .drain(..)
                .partition(|worker| worker.thread.as_ref().is_some_and(JoinHandle::is_finished));
            *workers = live;
            dead
        };
        for worker in dead {
            tracing::error!(conn_id = worker.conn_id.as_u64(), "worker thread panicked");
            if let Some(thread) = worker.thread {
                let _ = thread.join();
            }
        }
    }

    fn join_exited(&self) {
        let exited = std::mem::take(&mut *self.exited.lock().unwrap_or_else(PoisonError::into_inner));
        for thread in exited {
            if thread.join().is_err() {
                tracing::error!("worker thread panicked after leaving the registry");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Shuts down every worker's socket, then waits for the workers to
    /// leave, checking every [`SHUTDOWN_POLL_INTERVAL`]. Once all have left,
    /// their threads are joined.
    ///
    /// Fails with [`NetError::ShutdownTimeout`] if any are still running
    /// after `timeout`.
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        {
            let workers = self.lock();
            self.stopping.store(true, Ordering::Release);
            for worker in workers.iter() {
                if let Err(e) = shutdown_raw(worker.fd, Shutdown::Both) {
                    tracing::warn!(
                        conn_id = worker.conn_id.as_u64(),
                        fd = worker.fd,
                        error = %e,
                        "failed to shut down worker socket"
                    );
                }
            }
            tracing::info!(workers = workers.len(), "terminating worker threads");
        }

        let started = Instant::now();
        loop {
            self.reap_panicked();
            let remaining = self.len();
            if remaining == 0 {
                self.join_exited();
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                tracing::error!(remaining, ?timeout, "worker threads did not terminate");
                return Err(NetError::ShutdownTimeout(timeout));
            }
            thread::sleep(SHUTDOWN_POLL_INTERVAL.min(timeout - elapsed));
        }
    }
}

struct ServerInner<P: PeerHandler> {
    listener: TcpListener,
    config: TcpServerConfig,
    handler: P,
    registry: ThreadRegistry,
    running: AtomicBool,
    next_conn_id: AtomicU64,
}

impl<P: PeerHandler> ServerInner<P> {
    fn accept_loop(self: Arc<Self>) {
        tracing::debug!(port = self.listener.local_port(), "accept thread started");
        while self.running.load(Ordering::Acquire) {
            match self.listener.wait_pending(ACCEPT_POLL_INTERVAL) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "waiting for connections failed");
                    break;
                }
            }
            loop {
                match self.listener.try_accept() {
                    Ok(Some(conn)) => self.spawn_worker(conn),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        }
        tracing::debug!("accept thread stopped");
    }

    fn spawn_worker(self: &Arc<Self>, mut conn: TcpConnection) {
        let peer = conn.peer_addr();
        if let Some(max) = self.config.max_connections {
            if self.registry.len() >= max {
                tracing::warn!(%peer, max, "connection limit reached, rejecting");
                return;
            }
        }
        if let Err(e) = conn.set_nonblocking(false) {
            tracing::warn!(%peer, error = %e, "failed to switch connection to blocking mode");
            return;
        }
        if self.config.no_delay {
            if let Err(e) = conn.set_nodelay(true) {
                tracing::warn!(%peer, error = %e, "failed to set TCP_NODELAY");
            }
        }
        conn.configure(
            self.config.read_chunk,
            self.config.max_input,
            self.config.line_reader(),
        );
        conn.set_pack_threshold(self.config.pack_threshold);

        let conn_id = ConnectionId::new(self.next_conn_id.fetch_add(1, Ordering::Relaxed));
        if !self.registry.register(conn_id, conn.fd()) {
            return;
        }

        let inner = Arc::clone(self);
        let spawned = Builder::new()
            .name(format!("mill-tcp-worker-{}", conn_id.as_u64()))
            .spawn(move || inner.serve(conn_id, conn, peer));
        match spawned {
            Ok(thread) => self.registry.attach(conn_id, thread),
            Err(e) => {
                tracing::error!(%peer, error = %e, "failed to spawn worker thread");
                self.registry.unregister(conn_id);
            }
        }
    }

    fn serve(&self, conn_id: ConnectionId, mut conn: TcpConnection, peer: SocketAddrV4) {
        tracing::debug!(conn_id = conn_id.as_u64(), %peer, "worker started");
        match self.handler.serve(conn_id, &mut conn) {
            Ok(()) => {}
            Err(e) if e.is_disconnect() => {
                tracing::debug!(conn_id = conn_id.as_u64(), %peer, reason = %e, "peer disconnected");
            }
            Err(e) => {
                tracing::warn!(conn_id = conn_id.as_u64(), %peer, error = %e, "worker failed");
            }
        }
        // Leave the registry while the descriptor is still open.
        self.registry.unregister(conn_id);
        conn.close();
    }
}

/// Thread-per-connection TCP server.
///
/// Drives the same [`TcpListener`] as the event-driven server, from a
/// dedicated accept thread. Each peer gets its own worker thread running a
/// [`PeerHandler`] over a blocking [`TcpConnection`].
pub struct ThreadedTcpServer<P: PeerHandler> {
    inner: Arc<ServerInner<P>>,
    accept_thread: Option<JoinHandle<()>>,
}

impl<P: PeerHandler> ThreadedTcpServer<P> {
    pub fn bind(config: TcpServerConfig, handler: P) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.address, config.port, config.backlog)?;
        Ok(Self {
            inner: Arc::new(ServerInner {
                listener,
                config,
                handler,
                registry: ThreadRegistry::new(),
                running: AtomicBool::new(false),
                next_conn_id: AtomicU64::new(1),
            }),
            accept_thread: None,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.inner.listener.local_port()
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.inner.registry
    }

    pub fn active_workers(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_running(&self) -> bool {
        self.accept_thread.is_some()
    }

    /// Spawns the accept thread. Starting twice is a no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.accept_thread.is_some() {
            return Ok(());
        }
        self.inner.running.store(true, Ordering::Release);
        let inner = Arc::clone(&self.inner);
        let handle = Builder::new()
            .name("mill-tcp-accept".into())
            .spawn(move || inner.accept_loop())
            .map_err(|e| NetError::from_io("spawn", e))?;
        self.accept_thread = Some(handle);
        Ok(())
    }

    /// Stops accepting, then terminates the workers within `timeout`.
    pub fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        self.inner.running.store(false, Ordering::Release);
        if let Some(handle) = self.accept_thread.take() {
            if handle.join().is_err() {
                tracing::error!("accept thread panicked");
            }
        }
        self.inner.registry.shutdown(timeout)
    }
}

impl<P: PeerHandler> Drop for ThreadedTcpServer<P> {
    fn drop(&mut self) {
        if self.accept_thread.is_none() {
            return;
        }
        if let Err(e) = self.shutdown(DEFAULT_SHUTDOWN_TIMEOUT) {
            tracing::error!(error = %e, "threaded server shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::{Read, Write},
        net::{Ipv4Addr, TcpStream},
    };

    struct LineEcho;

    impl PeerHandler for LineEcho {
        fn serve(&self, _conn_id: ConnectionId, conn: &mut TcpConnection) -> Result<()> {
            loop {
                conn.read_some()?;
                while let Some(line) = conn.read_line()? {
                    conn.queue(line.as_bytes());
                    conn.queue(b"\n");
                }
                conn.flush()?;
            }
        }
    }

    struct Stubborn;

    impl PeerHandler for Stubborn {
        fn serve(&self, _conn_id: ConnectionId, _conn: &mut TcpConnection) -> Result<()> {
            thread::sleep(Duration::from_secs(2));
            Ok(())
        }
    }

    fn local_config() -> TcpServerConfig {
        TcpServerConfig::builder()
            .address(Ipv4Addr::LOCALHOST)
            .build()
            .unwrap()
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_registry_bookkeeping() {
        let registry = ThreadRegistry::new();
        assert!(registry.register(ConnectionId::new(1), -1));
        assert!(registry.register(ConnectionId::new(2), -1));
        assert_eq!(registry.len(), 2);

        registry.unregister(ConnectionId::new(1));
        registry.unregister(ConnectionId::new(2));
        assert!(registry.is_empty());

        registry.shutdown(Duration::from_millis(10)).unwrap();
        assert!(registry.is_stopping());
        assert!(!registry.register(ConnectionId::new(3), -1));
    }

    #[test]
    fn test_shutdown_joins_workers_that_left() {
        let registry = Arc::new(ThreadRegistry::new());
        let closed = Arc::new(AtomicBool::new(false));
        let conn_id = ConnectionId::new(7);
        assert!(registry.register(conn_id, -1));

        let (r, c) = (Arc::clone(&registry), Arc::clone(&closed));
        let worker = thread::spawn(move || {
            r.unregister(conn_id);
            // Cleanup after leaving the registry still counts as running.
            thread::sleep(Duration::from_millis(100));
            c.store(true, Ordering::Release);
        });
        registry.attach(conn_id, worker);

        registry.shutdown(Duration::from_secs(2)).unwrap();
        assert!(closed.load(Ordering::Acquire));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_panicked_worker_does_not_stall_shutdown() {
        let registry = ThreadRegistry::new();
        let conn_id = ConnectionId::new(9);
        assert!(registry.register(conn_id, -1));
        let worker = thread::spawn(|| panic!("handler blew up"));
        registry.attach(conn_id, worker);

        registry.shutdown(Duration::from_secs(2)).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_workers_echo_and_shut_down() {
        let mut server = ThreadedTcpServer::bind(local_config(), LineEcho).unwrap();
        server.start().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", server.local_port())).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(b"hello\n").unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello\n");
        assert_eq!(server.active_workers(), 1);

        // The idle worker is blocked in recv until its socket is shut down.
        server.shutdown(Duration::from_secs(2)).unwrap();
        assert_eq!(server.active_workers(), 0);
        assert!(!server.is_running());
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_worker_leaves_after_peer_close() {
        let mut server = ThreadedTcpServer::bind(local_config(), LineEcho).unwrap();
        server.start().unwrap();

        let client = TcpStream::connect(("127.0.0.1", server.local_port())).unwrap();
        wait_for(|| server.active_workers() == 1);
        drop(client);
        wait_for(|| server.active_workers() == 0);
        server.shutdown(Duration::from_millis(100)).unwrap();
    }

    #[test]
    fn test_shutdown_times_out_on_stuck_worker() {
        let mut server = ThreadedTcpServer::bind(local_config(), Stubborn).unwrap();
        server.start().unwrap();

        let _client = TcpStream::connect(("127.0.0.1", server.local_port())).unwrap();
        wait_for(|| server.active_workers() == 1);

        let err = server.shutdown(Duration::from_millis(300)).unwrap_err();
        assert!(matches!(err, NetError::ShutdownTimeout(_)));
    }
}
