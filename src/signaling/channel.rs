//! Signaling channel capability
//!
//! The control-plane transport (usually a WebSocket with its own reconnect
//! logic) is injected into the session rather than built in. It only has to
//! move already-framed text in both directions.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use crate::error::NetworkError;

/// Managed control-plane socket
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Open the channel. Inbound frames arrive on the returned receiver, which
    /// yields `None` once the channel is gone.
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<String>, NetworkError>;

    /// Send one text frame
    async fn send(&self, text: String) -> Result<(), NetworkError>;

    /// Close the channel
    async fn stop(&self);
}

/// In-process signaling channel backed by tokio channels
pub struct MemorySignaling {
    inbound: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    outbound: mpsc::UnboundedSender<String>,
    stopped: AtomicBool,
}

/// Remote end of a [`MemorySignaling`] channel
pub struct MemoryPeer {
    /// Frames sent here are delivered to the client
    pub to_client: mpsc::UnboundedSender<String>,
    /// Frames sent by the client
    pub from_client: mpsc::UnboundedReceiver<String>,
}

/// Create a connected client/peer pair
pub fn memory_pair() -> (MemorySignaling, MemoryPeer) {
    let (to_client, inbound) = mpsc::unbounded_channel();
    let (outbound, from_client) = mpsc::unbounded_channel();

    (
        MemorySignaling {
            inbound: Mutex::new(Some(inbound)),
            outbound,
            stopped: AtomicBool::new(false),
        },
        MemoryPeer {
            to_client,
            from_client,
        },
    )
}

impl MemorySignaling {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingChannel for MemorySignaling {
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<String>, NetworkError> {
        self.inbound
            .lock()
            .take()
            .ok_or_else(|| NetworkError::Signaling("channel already started".to_string()))
    }

    async fn send(&self, text: String) -> Result<(), NetworkError> {
        if self.is_stopped() {
            return Err(NetworkError::SignalingClosed);
        }
        self.outbound
            .send(text)
            .map_err(|_| NetworkError::SignalingClosed)
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair() {
        let (channel, mut peer) = memory_pair();
        let mut inbound = channel.start().await.unwrap();

        channel.send("hello".to_string()).await.unwrap();
        assert_eq!(peer.from_client.recv().await.unwrap(), "hello");

        peer.to_client.send("world".to_string()).unwrap();
        assert_eq!(inbound.recv().await.unwrap(), "world");

        drop(peer);
        assert!(inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_start_once_and_stop() {
        let (channel, _peer) = memory_pair();
        assert!(channel.start().await.is_ok());
        assert!(channel.start().await.is_err());

        channel.stop().await;
        assert!(matches!(
            channel.send("late".to_string()).await,
            Err(NetworkError::SignalingClosed)
        ));
    }
}
