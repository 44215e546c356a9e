//! Registry of live subscriber connections
//!
//! The registry is the only state shared between the accept loop, the
//! fan-out loop and the per-connection handlers. Every access goes through
//! the read/write lock: fan-out iterates under the read lock, while
//! registration, removal and shutdown take the write lock, so a connection
//! is never written to after it has been removed and closed.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};

use crate::shutdown::Shutdown;

pub type ConnectionId = u64;

/// Write side of a subscriber connection
pub type FeedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A registered subscriber
pub struct Connection {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    writer: Mutex<FeedWriter>,
}

impl Connection {
    fn new(id: ConnectionId, peer: SocketAddr, writer: FeedWriter) -> Self {
        Connection {
            id,
            peer,
            writer: Mutex::new(writer),
        }
    }

    /// Write one line. Gives up with `Interrupted` once `shutdown` fires.
    ///
    /// There is no per-write deadline, so a stalled subscriber holds up the
    /// caller until it drains or the server shuts down.
    pub async fn send(&self, line: &[u8], shutdown: &Shutdown) -> io::Result<()> {
        tokio::select! {
            _ = shutdown.triggered() => Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "real-time server shutting down",
            )),
            res = async {
                let mut writer = self.writer.lock().await;
                writer.write_all(line).await?;
                writer.flush().await
            } => res,
        }
    }

    /// Shut down the write side; errors are ignored since the peer may be gone
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<BTreeMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and send `greeting` as its first line.
    ///
    /// The connection's writer is held from before insertion until the
    /// greeting is written, so no broadcast can reach the subscriber first.
    /// If the greeting cannot be written the connection is removed again.
    pub async fn register(
        &self,
        peer: SocketAddr,
        writer: FeedWriter,
        greeting: &[u8],
    ) -> io::Result<Arc<Connection>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(id, peer, writer));

        let written = {
            let mut guard = conn.writer.lock().await;
            self.connections.write().await.insert(id, Arc::clone(&conn));
            match guard.write_all(greeting).await {
                Ok(()) => guard.flush().await,
                Err(e) => Err(e),
            }
        };

        if let Err(e) = written {
            self.deregister(id).await;
            conn.close().await;
            return Err(e);
        }

        Ok(conn)
    }

    /// Remove a connection. Returns it if it was still registered.
    pub async fn deregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.write().await.remove(&id)
    }

    /// Remove every connection, returning them for closing
    pub async fn drain(&self) -> Vec<Arc<Connection>> {
        let mut connections = self.connections.write().await;
        std::mem::take(&mut *connections).into_values().collect()
    }

    /// Write `line` to every registered connection under the read lock.
    ///
    /// Failures are logged and skipped; removing a broken connection is left
    /// to its own handler. Returns the number of successful writes.
    pub async fn broadcast(&self, line: &[u8], shutdown: &Shutdown) -> usize {
        let connections = self.connections.read().await;
        let mut delivered = 0;

        for conn in connections.values() {
            if shutdown.is_triggered() {
                break;
            }
            match conn.send(line, shutdown).await {
                Ok(()) => delivered += 1,
                Err(e) => log::debug!("Failed to send to subscriber {}: {}", conn.peer, e),
            }
        }

        delivered
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_register_sends_greeting_first() {
        let registry = ConnectionRegistry::new();
        let shutdown = Shutdown::new();
        let (client, server) = duplex(1024);

        registry.register(peer(), Box::new(server), b"hello\n").await.unwrap();
        assert_eq!(registry.broadcast(b"data\n", &shutdown).await, 1);

        let mut client = client;
        let mut buf = vec![0u8; 11];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\ndata\n");
    }

    #[tokio::test]
    async fn test_deregister_and_drain() {
        let registry = ConnectionRegistry::new();
        let (_c1, s1) = duplex(64);
        let (_c2, s2) = duplex(64);

        let first = registry.register(peer(), Box::new(s1), b"").await.unwrap();
        registry.register(peer(), Box::new(s2), b"").await.unwrap();
        assert_eq!(registry.len().await, 2);

        assert!(registry.deregister(first.id).await.is_some());
        assert!(registry.deregister(first.id).await.is_none());
        assert_eq!(registry.drain().await.len(), 1);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_broadcast_tolerates_closed_peer() {
        let registry = ConnectionRegistry::new();
        let shutdown = Shutdown::new();
        let (gone, s1) = duplex(64);
        let (mut alive, s2) = duplex(64);

        registry.register(peer(), Box::new(s1), b"").await.unwrap();
        registry.register(peer(), Box::new(s2), b"").await.unwrap();
        drop(gone);

        assert_eq!(registry.broadcast(b"x\n", &shutdown).await, 1);
        // The broken connection stays until its handler removes it
        assert_eq!(registry.len().await, 2);

        let mut buf = [0u8; 2];
        alive.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x\n");
    }

    #[tokio::test]
    async fn test_send_gives_up_on_cancel() {
        let registry = ConnectionRegistry::new();
        let shutdown = Shutdown::new();
        // Tiny buffer that nobody reads, so the write stalls
        let (_client, server) = duplex(4);
        let conn = registry.register(peer(), Box::new(server), b"").await.unwrap();

        shutdown.trigger();
        let err = conn.send(b"a line longer than four bytes\n", &shutdown).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }
}
