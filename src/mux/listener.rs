use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
#[cfg(unix)]
use std::os::unix::net::UnixListener as StdUnixListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ProxyError, Result};
use crate::model::{ListenerKey, Network};

/// Accepted connection stream, TCP or Unix.
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

pub type BoxedIo = Box<dyn IoStream>;

/// Invoked once per accepted connection.
pub type ConnHandler =
    Arc<dyn Fn(BoxedIo, SocketAddr, ListenerKey) -> BoxFuture<'static, ()> + Send + Sync>;

/// Tracks in-flight connections so a graceful stop can wait for them.
#[derive(Clone, Default)]
pub struct ConnectionWatcher {
    inner: Arc<WatcherInner>,
}

#[derive(Default)]
struct WatcherInner {
    active: AtomicUsize,
    notify: Notify,
}

impl ConnectionWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(&self) -> ConnectionGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Waits for the active count to reach zero; false if the deadline
    /// expired first.
    pub async fn drain(&self, deadline: Duration) -> bool {
        tokio::time::timeout(deadline, async {
            loop {
                if self.active() == 0 {
                    return;
                }
                let notified = self.inner.notify.notified();
                if self.active() == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

pub struct ConnectionGuard {
    inner: Arc<WatcherInner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }
}

/// An owned bound socket. Clones share the underlying socket (dup'd fd), so
/// one instance can keep accepting while another is handed to a successor.
pub enum BoundSocket {
    Tcp(StdTcpListener),
    #[cfg(unix)]
    Unix(StdUnixListener),
}

impl BoundSocket {
    pub fn bind(key: &ListenerKey) -> Result<Self> {
        match key.network {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 => {
                let listener = StdTcpListener::bind(&key.address)
                    .map_err(|e| ProxyError::Bind(format!("{key}: {e}")))?;
                listener
                    .set_nonblocking(true)
                    .map_err(|e| ProxyError::Bind(format!("{key}: {e}")))?;
                Ok(BoundSocket::Tcp(listener))
            }
            #[cfg(unix)]
            Network::Unix => {
                // A stale socket file from a previous run blocks the bind.
                let _ = std::fs::remove_file(&key.address);
                let listener = StdUnixListener::bind(&key.address)
                    .map_err(|e| ProxyError::Bind(format!("{key}: {e}")))?;
                listener
                    .set_nonblocking(true)
                    .map_err(|e| ProxyError::Bind(format!("{key}: {e}")))?;
                Ok(BoundSocket::Unix(listener))
            }
            #[cfg(not(unix))]
            Network::Unix => Err(ProxyError::Bind(format!(
                "{key}: unix listeners are not supported on this platform"
            ))),
        }
    }

    /// Reconstructs a listener from a raw file descriptor handed over by a
    /// previous process generation. The socket must already be bound and
    /// listening; it is not rebound.
    #[cfg(unix)]
    pub unsafe fn from_raw_fd(key: &ListenerKey, fd: std::os::unix::io::RawFd) -> Result<Self> {
        use std::os::unix::io::FromRawFd;
        let socket = match key.network {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 => {
                BoundSocket::Tcp(StdTcpListener::from_raw_fd(fd))
            }
            Network::Unix => BoundSocket::Unix(StdUnixListener::from_raw_fd(fd)),
        };
        match &socket {
            BoundSocket::Tcp(l) => l.set_nonblocking(true)?,
            BoundSocket::Unix(l) => l.set_nonblocking(true)?,
        }
        Ok(socket)
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            BoundSocket::Tcp(l) => l.try_clone().map(BoundSocket::Tcp),
            #[cfg(unix)]
            BoundSocket::Unix(l) => l.try_clone().map(BoundSocket::Unix),
        }
    }
}

enum Acceptor {
    Tcp(tokio::net::TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

impl Acceptor {
    fn new(socket: BoundSocket) -> io::Result<Self> {
        match socket {
            BoundSocket::Tcp(l) => tokio::net::TcpListener::from_std(l).map(Acceptor::Tcp),
            #[cfg(unix)]
            BoundSocket::Unix(l) => tokio::net::UnixListener::from_std(l).map(Acceptor::Unix),
        }
    }

    async fn accept(&self) -> io::Result<(BoxedIo, SocketAddr)> {
        match self {
            Acceptor::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                Ok((Box::new(stream), peer))
            }
            #[cfg(unix)]
            Acceptor::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                // Unix peers have no socket address; report loopback.
                Ok((Box::new(stream), "127.0.0.1:0".parse().unwrap()))
            }
        }
    }
}

struct Entry {
    refcount: usize,
    socket: Option<BoundSocket>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl Entry {
    fn new() -> Self {
        Self {
            refcount: 0,
            socket: None,
            shutdown: None,
            task: None,
        }
    }

    fn stop_accepting(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Reference-counted pool of bound sockets keyed by
/// `(protocol, network, address)`. One socket exists per distinct key, with
/// a refcount equal to the number of hosts referencing it. Refcounts are
/// only touched from the configurator's single-threaded context.
pub struct ListenerManager {
    entries: Mutex<HashMap<ListenerKey, Entry>>,
    watcher: ConnectionWatcher,
}

impl ListenerManager {
    pub fn new(watcher: ConnectionWatcher) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            watcher,
        }
    }

    /// Registers one more host reference; binds lazily on `start`.
    pub fn acquire(&self, key: &ListenerKey) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
        entry.refcount += 1;
        debug!(listener = %key, refcount = entry.refcount, "listener acquired");
    }

    /// Drops one host reference; the socket closes when the last reference
    /// goes away. Returns true when the listener was destroyed.
    pub fn release(&self, key: &ListenerKey) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount > 0 {
            debug!(listener = %key, refcount = entry.refcount, "listener released");
            return false;
        }
        let mut entry = entries.remove(key).unwrap();
        entry.stop_accepting();
        drop(entry);
        info!(listener = %key, "listener closed");
        true
    }

    pub fn refcount(&self, key: &ListenerKey) -> usize {
        self.entries.lock().get(key).map_or(0, |e| e.refcount)
    }

    pub fn is_bound(&self, key: &ListenerKey) -> bool {
        self.entries.lock().get(key).is_some_and(|e| e.socket.is_some())
    }

    pub fn keys(&self) -> Vec<ListenerKey> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Takes ownership of a pre-bound socket (the hijack protocol). The
    /// socket is served once `start` runs.
    pub fn adopt(&self, key: &ListenerKey, socket: BoundSocket) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
        entry.socket = Some(socket);
        info!(listener = %key, "adopted listener socket");
    }

    /// Binds (unless adopted) and starts the accept loop for one key.
    pub fn start(&self, key: &ListenerKey, handler: ConnHandler) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(key.clone())
            .or_insert_with(Entry::new);
        if entry.socket.is_none() {
            entry.socket = Some(BoundSocket::bind(key)?);
            info!(listener = %key, "listener bound");
        }
        if entry.task.is_none() {
            let socket = entry
                .socket
                .as_ref()
                .unwrap()
                .try_clone()
                .map_err(|e| ProxyError::Bind(format!("{key}: {e}")))?;
            let (tx, rx) = watch::channel(false);
            entry.shutdown = Some(tx);
            entry.task = Some(spawn_accept_loop(
                key.clone(),
                socket,
                rx,
                handler,
                self.watcher.clone(),
            ));
        }
        Ok(())
    }

    pub fn start_all(&self, handler: ConnHandler) -> Result<()> {
        for key in self.keys() {
            self.start(&key, handler.clone())?;
        }
        Ok(())
    }

    /// Detaches every bound socket: accept loops stop, but the sockets stay
    /// open and are returned for adoption by a successor. In-flight
    /// connections are untouched.
    pub fn detach_all(&self) -> Vec<(ListenerKey, BoundSocket)> {
        let mut entries = self.entries.lock();
        let mut detached = Vec::new();
        for (key, entry) in entries.iter_mut() {
            entry.stop_accepting();
            if let Some(socket) = entry.socket.take() {
                detached.push((key.clone(), socket));
            }
        }
        detached
    }

    /// Stops accepting and closes every socket still owned.
    pub fn close_all(&self) {
        let mut entries = self.entries.lock();
        for (key, entry) in entries.iter_mut() {
            entry.stop_accepting();
            if entry.socket.take().is_some() {
                debug!(listener = %key, "listener closed");
            }
        }
        entries.clear();
    }
}

fn spawn_accept_loop(
    key: ListenerKey,
    socket: BoundSocket,
    mut shutdown: watch::Receiver<bool>,
    handler: ConnHandler,
    watcher: ConnectionWatcher,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let acceptor = match Acceptor::new(socket) {
            Ok(a) => a,
            Err(e) => {
                error!(listener = %key, error = %e, "failed to register listener");
                return;
            }
        };
        info!(listener = %key, "accepting connections");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = acceptor.accept() => match accepted {
                    Ok((io, peer)) => {
                        let guard = watcher.guard();
                        let fut = handler(io, peer, key.clone());
                        tokio::spawn(async move {
                            fut.await;
                            drop(guard);
                        });
                    }
                    Err(e) => {
                        warn!(listener = %key, error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }
        debug!(listener = %key, "accept loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Protocol;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn key(address: &str) -> ListenerKey {
        ListenerKey {
            protocol: Protocol::Http,
            network: Network::Tcp,
            address: address.to_string(),
        }
    }

    fn echo_handler() -> ConnHandler {
        Arc::new(|mut io, _peer, _key| {
            Box::pin(async move {
                let mut buf = [0u8; 64];
                if let Ok(n) = io.read(&mut buf).await {
                    let _ = io.write_all(&buf[..n]).await;
                }
            })
        })
    }

    #[tokio::test]
    async fn refcounted_bind_and_release() {
        let manager = ListenerManager::new(ConnectionWatcher::new());
        let port = crate::testutils::free_port();
        let k = key(&format!("127.0.0.1:{port}"));

        manager.acquire(&k);
        manager.acquire(&k);
        manager.start(&k, echo_handler()).unwrap();
        assert!(manager.is_bound(&k));
        assert_eq!(manager.refcount(&k), 2);

        assert!(!manager.release(&k));
        assert!(manager.is_bound(&k));

        assert!(manager.release(&k));
        assert!(!manager.is_bound(&k));

        // The port is free again.
        tokio::time::sleep(Duration::from_millis(20)).await;
        StdTcpListener::bind(format!("127.0.0.1:{port}")).unwrap();
    }

    #[tokio::test]
    async fn serves_connections_and_detaches() {
        let manager = ListenerManager::new(ConnectionWatcher::new());
        let port = crate::testutils::free_port();
        let addr = format!("127.0.0.1:{port}");
        let k = key(&addr);

        manager.acquire(&k);
        manager.start(&k, echo_handler()).unwrap();

        let mut stream = tokio::net::TcpStream::connect(&addr).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // Detach: socket survives, accepting stops on this manager.
        let detached = manager.detach_all();
        assert_eq!(detached.len(), 1);

        // A successor adopts the same socket and serves again.
        let manager2 = ListenerManager::new(ConnectionWatcher::new());
        for (k, socket) in detached {
            manager2.acquire(&k);
            manager2.adopt(&k, socket);
        }
        manager2.start_all(echo_handler()).unwrap();

        let mut stream = tokio::net::TcpStream::connect(&addr).await.unwrap();
        stream.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let manager = ListenerManager::new(ConnectionWatcher::new());
        let k = key("256.256.256.256:80");
        manager.acquire(&k);
        assert!(matches!(
            manager.start(&k, echo_handler()),
            Err(ProxyError::Bind(_))
        ));
    }

    #[tokio::test]
    async fn watcher_drains_after_guards_drop() {
        let watcher = ConnectionWatcher::new();
        let guard = watcher.guard();
        assert_eq!(watcher.active(), 1);
        assert!(!watcher.drain(Duration::from_millis(30)).await);
        drop(guard);
        assert!(watcher.drain(Duration::from_millis(30)).await);
    }
}
