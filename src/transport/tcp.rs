//! TCP Transport
//!
//! Default transport: a TCP listener feeding inbound messages into the
//! engine's event channel, and one-shot outbound connections for sends.
//! Gossip tolerates lost messages (the next round's digest exchange recovers
//! them), so outbound connections are not pooled.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use super::{read_message, write_message, Message, Transport, TransportEvent};
use crate::error::{Error, Result};
use crate::peer::{Delta, PeerRef, PeerSummary};

/// Default timeout for outbound connections
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP transport for gossip exchange
pub struct TcpTransport {
    /// Bind address for the listener
    bind_address: String,
    /// Channel for inbound events
    events: mpsc::Sender<TransportEvent>,
    /// Outbound connect timeout
    connect_timeout: Duration,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl TcpTransport {
    /// Create a new TCP transport
    pub fn new(bind_address: String, events: mpsc::Sender<TransportEvent>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            bind_address,
            events,
            connect_timeout: CONNECT_TIMEOUT,
            shutdown: shutdown_tx,
        }
    }

    /// Set the outbound connect timeout
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Returns the bound address (useful when binding to port 0).
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Gossip transport listening on {}", addr);

        let events = self.events.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((socket, peer_addr)) => {
                                let events = events.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(socket, events.clone()).await {
                                        tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                        let _ = events
                                            .send(TransportEvent::Error(e.to_string()))
                                            .await;
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                                let _ = events.send(TransportEvent::Error(e.to_string())).await;
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("Gossip transport stopped");
        });

        Ok(addr)
    }

    /// Stop accepting connections
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Open a connection and send one message
    async fn send(&self, target: &PeerRef, message: Message) -> Result<()> {
        let stream = self.connect(&target.address).await?;
        let (_, mut writer) = stream.into_split();

        tracing::trace!("Sending {} to {}", message.type_name(), target.id);
        write_message(&mut writer, &message).await
    }

    /// Connect to an address with timeout
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send_digest(
        &self,
        target: &PeerRef,
        sender: PeerSummary,
        digest: Vec<PeerSummary>,
    ) -> Result<()> {
        let from = PeerRef {
            id: sender.id,
            address: sender.address,
        };
        self.send(target, Message::Digest { from, digest }).await
    }

    async fn send_deltas(
        &self,
        target: &PeerRef,
        sender: PeerSummary,
        deltas: Vec<Delta>,
    ) -> Result<()> {
        let from = PeerRef {
            id: sender.id,
            address: sender.address,
        };
        self.send(target, Message::Deltas { from, deltas }).await
    }
}

/// Read messages off one connection until it closes
async fn handle_connection(
    socket: TcpStream,
    events: mpsc::Sender<TransportEvent>,
) -> Result<()> {
    let (mut reader, _) = socket.into_split();

    loop {
        match read_message(&mut reader).await {
            Ok(message) => {
                tracing::trace!("Received {}", message.type_name());

                let event = match message {
                    Message::Digest { from, digest } => TransportEvent::Digest { from, digest },
                    Message::Deltas { from, deltas } => TransportEvent::Deltas { from, deltas },
                };

                if events.send(event).await.is_err() {
                    // Engine is gone, stop reading
                    break;
                }
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_ref(id: &str, address: &str) -> PeerRef {
        PeerRef {
            id: id.into(),
            address: address.into(),
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    #[tokio::test]
    async fn test_digest_delivery_over_loopback() {
        init_tracing();

        let (tx, mut rx) = mpsc::channel(16);
        let receiver = TcpTransport::new("127.0.0.1:0".into(), tx);
        let addr = receiver.start().await.unwrap();

        let (sender_tx, _sender_rx) = mpsc::channel(16);
        let sender = TcpTransport::new("127.0.0.1:0".into(), sender_tx);

        let target = peer_ref("b", &addr.to_string());
        let summary = PeerSummary {
            id: "a".into(),
            max_version_seen: 2,
            address: "127.0.0.1:9".into(),
        };
        sender
            .send_digest(&target, summary.clone(), vec![summary.clone()])
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            TransportEvent::Digest { from, digest } => {
                assert_eq!(from.id, "a");
                assert_eq!(from.address, "127.0.0.1:9");
                assert_eq!(digest.len(), 1);
                assert_eq!(digest[0].max_version_seen, 2);
            }
            other => panic!("Expected digest, got {:?}", other),
        }

        receiver.stop();
    }

    #[tokio::test]
    async fn test_send_to_unreachable_address_fails() {
        let (tx, _rx) = mpsc::channel(16);
        let transport = TcpTransport::new("127.0.0.1:0".into(), tx)
            .with_connect_timeout(Duration::from_millis(200));

        let target = peer_ref("nobody", "127.0.0.1:1");
        let result = transport
            .send_deltas(
                &target,
                PeerSummary {
                    id: "a".into(),
                    max_version_seen: 0,
                    address: "".into(),
                },
                vec![],
            )
            .await;

        assert!(result.is_err());
        assert!(result.unwrap_err().is_retryable());
    }
}
