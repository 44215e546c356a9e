use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::models::AccessEvent;
use crate::shutdown::Shutdown;

/// Largest datagram accepted from the proxy
const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Failed to bind ingest listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// UDP endpoint the proxy reports access events to.
///
/// Each datagram carries one or more JSON lines, one `AccessEvent` per line.
pub struct IngestListener {
    socket: UdpSocket,
}

impl IngestListener {
    pub async fn bind(addr: &str) -> Result<Self, IngestError> {
        let socket = UdpSocket::bind(addr).await.map_err(|source| IngestError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        Ok(IngestListener { socket })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Forward parsed events until the channel closes or `shutdown` fires
    pub async fn run(&self, tx: mpsc::Sender<AccessEvent>, shutdown: Shutdown) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        log::info!("Ingest listener started on {:?}", self.socket.local_addr().ok());

        loop {
            let size = tokio::select! {
                _ = shutdown.triggered() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((size, _peer)) => size,
                    Err(e) => {
                        log::error!("Ingest recv error: {}", e);
                        continue;
                    }
                },
            };

            let payload = String::from_utf8_lossy(&buf[..size]);
            for event in parse_datagram(&payload) {
                // A full channel must not keep the listener from seeing shutdown
                tokio::select! {
                    _ = shutdown.triggered() => {
                        log::info!("Ingest listener stopped with events still pending");
                        return;
                    }
                    sent = tx.send(event) => if sent.is_err() {
                        log::info!("Channel closed, stopping ingest listener");
                        return;
                    },
                }
            }
        }

        log::info!("Ingest listener stopped");
    }
}

/// Parse every non-blank line of a datagram, skipping the ones that fail
pub fn parse_datagram(payload: &str) -> Vec<AccessEvent> {
    payload
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match AccessEvent::from_reported_line(line) {
            Ok(event) => Some(event),
            Err(e) => {
                log::debug!("Ignoring malformed access event: {}", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_datagram() {
        let payload = concat!(
            "{\"user_id\":1,\"email\":\"a@x.io\",\"domain\":\"one.com\"}\n",
            "\n",
            "not json\n",
            "{\"user_id\":2,\"domain\":\"\"}\n",
            "{\"user_id\":3,\"email\":\"c@x.io\",\"domain\":\"three.com\",\"protocol\":\"trojan\"}",
        );
        let events = parse_datagram(payload);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].domain, "one.com");
        assert_eq!(events[1].protocol, "trojan");
    }

    #[tokio::test]
    async fn test_forwards_datagrams_until_shutdown() {
        let listener = IngestListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let shutdown = Shutdown::new();

        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { listener.run(tx, shutdown).await })
        };

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(b"{\"user_id\":9,\"email\":\"z@x.io\",\"domain\":\"udp.example.com\"}\n", addr)
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.domain, "udp.example.com");
        assert_eq!(event.actor_key(), "z@x.io(9)");

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(3), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_while_channel_is_full() {
        let listener = IngestListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Capacity one, so the listener blocks as soon as the test stops reading
        let (tx, mut rx) = mpsc::channel(1);
        let shutdown = Shutdown::new();

        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { listener.run(tx, shutdown).await })
        };

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(
                concat!(
                    "{\"user_id\":1,\"domain\":\"a.example.com\"}\n",
                    "{\"user_id\":2,\"domain\":\"b.example.com\"}\n",
                    "{\"user_id\":3,\"domain\":\"c.example.com\"}\n",
                )
                .as_bytes(),
                addr,
            )
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.actor_id, 1);
        // The second event refills the channel and the third one blocks
        tokio::time::sleep(Duration::from_millis(200)).await;

        shutdown.trigger();
        let joined = tokio::time::timeout(Duration::from_secs(2), task).await;
        assert!(joined.is_ok());
        assert_eq!(rx.recv().await.map(|e| e.actor_id), Some(2));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_bind_failure() {
        assert!(matches!(
            IngestListener::bind("not-an-address").await,
            Err(IngestError::Bind { .. })
        ));
    }
}
