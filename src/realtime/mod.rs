//! Real-time push feed
//!
//! A TCP server that fans out every recorded access event to connected
//! subscribers as JSON lines. Producers hand messages over through a bounded
//! queue with `try_send`, so a slow or absent subscriber can never hold up
//! the recorder: when the queue is full the message is dropped.

pub mod client;
pub mod message;
pub mod registry;

pub use client::FeedReader;
pub use message::FeedMessage;
pub use registry::{Connection, ConnectionRegistry};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant};

use crate::config::RealtimeConfig;
use crate::models::AccessEvent;
use crate::shutdown::Shutdown;

const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Errors that can occur while starting the real-time server
#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Failed to bind real-time listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Fan-out server for the real-time feed
pub struct Broadcaster {
    config: RealtimeConfig,
    registry: Arc<ConnectionRegistry>,
    queue: Option<mpsc::Sender<Vec<u8>>>,
    shutdown: Shutdown,
    tasks: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Broadcaster {
    pub fn new(config: RealtimeConfig) -> Self {
        Broadcaster {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            queue: None,
            shutdown: Shutdown::new(),
            tasks: Vec::new(),
            local_addr: None,
        }
    }

    /// Bind the listener and spawn the accept and fan-out loops.
    ///
    /// Does nothing when the feed is disabled, has no listen address, or is
    /// already running.
    pub async fn start(&mut self) -> Result<(), RealtimeError> {
        if !self.config.enable || self.config.listen_addr.is_empty() {
            log::debug!("Real-time feed disabled");
            return Ok(());
        }
        if self.queue.is_some() {
            return Ok(());
        }

        let addr = self.config.listen_addr.clone();
        let listener = TcpListener::bind(addr.as_str())
            .await
            .map_err(|source| RealtimeError::Bind {
                addr: addr.clone(),
                source,
            })?;
        self.local_addr = listener.local_addr().ok();

        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        self.shutdown = Shutdown::new();

        self.tasks.push(tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.registry),
            self.shutdown.clone(),
            self.config.heartbeat_interval(),
        )));
        self.tasks.push(tokio::spawn(fan_out_loop(
            rx,
            Arc::clone(&self.registry),
            self.shutdown.clone(),
        )));
        self.queue = Some(tx);

        log::info!(
            "Real-time server listening on {}",
            self.local_addr.map(|a| a.to_string()).unwrap_or(addr)
        );
        Ok(())
    }

    /// Stop the server and wait for every task it spawned.
    ///
    /// Calling this on a server that is not running does nothing.
    pub async fn stop(&mut self) {
        let Some(queue) = self.queue.take() else {
            return;
        };

        self.shutdown.trigger();

        for conn in self.registry.drain().await {
            conn.close().await;
        }

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                log::warn!("Real-time task ended abnormally: {}", e);
            }
        }

        drop(queue);
        self.local_addr = None;
        log::info!("Real-time server stopped");
    }

    /// Queue an access event for every subscriber without waiting.
    ///
    /// Returns false when the server is not running or the queue is full,
    /// in which case the message is dropped.
    pub fn push_record(&self, event: &AccessEvent) -> bool {
        let Some(ref queue) = self.queue else {
            return false;
        };

        let line = match (FeedMessage::UrlAccess { data: event.clone() }).to_line() {
            Ok(line) => line,
            Err(e) => {
                log::error!("Failed to serialize real-time record: {}", e);
                return false;
            }
        };

        match queue.try_send(line) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Real-time queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("Real-time queue closed");
                false
            }
        }
    }

    /// Whether the server is running and accepting subscribers
    pub fn is_enabled(&self) -> bool {
        self.queue.is_some()
    }

    /// Address the listener is bound to while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn connected_clients(&self) -> usize {
        self.registry.len().await
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    shutdown: Shutdown,
    heartbeat: Duration,
) {
    let mut handlers = JoinSet::new();
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => {
                        failures = 0;
                        accepted
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        let delay = accept_backoff(failures);
                        log::error!("Failed to accept subscriber: {} (retrying in {:?})", e, delay);
                        tokio::select! {
                            _ = shutdown.triggered() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                };

                let greeting = match FeedMessage::welcome().to_line() {
                    Ok(line) => line,
                    Err(e) => {
                        log::error!("Failed to serialize welcome message: {}", e);
                        continue;
                    }
                };

                let (reader, writer) = stream.into_split();
                match registry.register(peer, Box::new(writer), &greeting).await {
                    Ok(conn) => {
                        log::info!("Subscriber connected: {}", peer);
                        handlers.spawn(handle_connection(
                            conn,
                            reader,
                            Arc::clone(&registry),
                            shutdown.clone(),
                            heartbeat,
                        ));
                    }
                    Err(e) => log::warn!("Failed to greet subscriber {}: {}", peer, e),
                }
            }
            Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = joined {
                    log::warn!("Subscriber handler ended abnormally: {}", e);
                }
            }
        }
    }

    drop(listener);
    while let Some(joined) = handlers.join_next().await {
        if let Err(e) = joined {
            log::warn!("Subscriber handler ended abnormally: {}", e);
        }
    }
}

/// Delay before the next accept after `failures` consecutive errors,
/// e.g. while the process is out of file descriptors
fn accept_backoff(failures: u32) -> Duration {
    let millis = 10u64.saturating_mul(1 << failures.saturating_sub(1).min(10));
    Duration::from_millis(millis).min(MAX_ACCEPT_BACKOFF)
}

async fn fan_out_loop(
    mut rx: mpsc::Receiver<Vec<u8>>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Shutdown,
) {
    loop {
        let line = tokio::select! {
            _ = shutdown.triggered() => break,
            next = rx.recv() => match next {
                Some(line) => line,
                None => break,
            },
        };

        let delivered = registry.broadcast(&line, &shutdown).await;
        log::trace!("Real-time message delivered to {} subscribers", delivered);
    }
}

/// Heartbeat and liveness loop for one subscriber
async fn handle_connection(
    conn: Arc<Connection>,
    mut reader: OwnedReadHalf,
    registry: Arc<ConnectionRegistry>,
    shutdown: Shutdown,
    heartbeat: Duration,
) {
    let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
    let mut scratch = [0u8; 512];

    let reason = loop {
        tokio::select! {
            _ = shutdown.triggered() => break "server shutdown",
            _ = ticker.tick() => {
                let line = match FeedMessage::heartbeat().to_line() {
                    Ok(line) => line,
                    Err(e) => {
                        log::error!("Failed to serialize heartbeat: {}", e);
                        continue;
                    }
                };
                if let Err(e) = conn.send(&line, &shutdown).await {
                    log::debug!("Heartbeat to {} failed: {}", conn.peer, e);
                    break "write failed";
                }
            }
            // Subscribers are not expected to send anything; reading only
            // detects a closed connection
            read = reader.read(&mut scratch) => match read {
                Ok(0) => break "closed by peer",
                Ok(_) => {}
                Err(e) => {
                    log::debug!("Read from {} failed: {}", conn.peer, e);
                    break "read failed";
                }
            },
        }
    };

    registry.deregister(conn.id).await;
    conn.close().await;
    log::info!("Subscriber disconnected: {} ({})", conn.peer, reason);
}
