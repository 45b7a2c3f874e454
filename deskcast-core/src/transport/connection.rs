//! A framed TCP connection to one viewer.
//!
//! The socket is split into a writer task and a reader task that talk to
//! the owner over mpsc channels, plus a heartbeat task that keeps idle
//! links alive. All three stop once the connection value is dropped or
//! the socket fails.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use super::codec::DeskcastCodec;
use super::message::Message;
use crate::error::{DeskcastError, Result};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const QUEUE_DEPTH: usize = 64;

pub type ConnectionSender = mpsc::Sender<Message>;

#[derive(Debug)]
pub struct ViewerConnection {
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<Message>,
}

impl ViewerConnection {
    pub fn new(stream: TcpStream) -> Self {
        Self::with_heartbeat(stream, HEARTBEAT_INTERVAL)
    }

    pub fn with_heartbeat(stream: TcpStream, heartbeat: Duration) -> Self {
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("failed to set TCP_NODELAY: {e}");
        }
        let (mut net_writer, mut net_reader) = Framed::new(stream, DeskcastCodec).split();

        // Owner -> network
        let (user_tx, mut network_rx) = mpsc::channel::<Message>(QUEUE_DEPTH);
        // Network -> owner
        let (network_tx, user_rx) = mpsc::channel::<Message>(QUEUE_DEPTH);

        tokio::spawn(async move {
            while let Some(message) = network_rx.recv().await {
                if let Err(e) = net_writer.send(message).await {
                    warn!(?peer, "network write error: {e}");
                    break;
                }
            }
            let _ = net_writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(result) = net_reader.next().await {
                match result {
                    Ok(Message::Heartbeat) => {}
                    Ok(message) => {
                        if network_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(?peer, "network read error: {e}");
                        break;
                    }
                }
            }
            debug!(?peer, "reader finished");
        });

        let heartbeat_tx = user_tx.downgrade();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
            loop {
                interval.tick().await;
                let Some(tx) = heartbeat_tx.upgrade() else {
                    break;
                };
                if tx.send(Message::Heartbeat).await.is_err() {
                    break;
                }
            }
        });

        Self {
            tx: user_tx,
            rx: user_rx,
        }
    }

    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }

    pub async fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| DeskcastError::ChannelClosed)
    }

    /// Next inbound message other than a heartbeat. `None` once the peer
    /// disconnects or sends something undecodable.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Split into independent send and receive halves.
    pub fn into_split(self) -> (ConnectionSender, mpsc::Receiver<Message>) {
        (self.tx, self.rx)
    }
}
