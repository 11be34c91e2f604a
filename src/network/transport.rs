//! Datagram transport for the voice data channel
//!
//! Owns the connected UDP socket and runs the two socket loops:
//! - the receive loop hands every datagram from the voice endpoint to a callback
//! - the send loop flushes the [`SendQueue`] on a fixed cadence
//!
//! Both loops stop as soon as the session's cancellation token fires.

use bytes::Bytes;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::NetworkConfig;
use crate::error::{NetworkError, Result};
use crate::network::queue::SendQueue;
use crate::network::udp::{create_connected_socket, UdpSocket};

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub datagrams_sent: u64,
    pub bytes_sent: u64,
    pub datagrams_received: u64,
    pub bytes_received: u64,
    /// Empty datagrams and datagrams from anywhere but the voice endpoint
    pub foreign_datagrams: u64,
    /// Inbound payloads the session could not use
    pub ignored_payloads: u64,
}

#[derive(Default)]
struct Counters {
    datagrams_sent: AtomicU64,
    bytes_sent: AtomicU64,
    datagrams_received: AtomicU64,
    bytes_received: AtomicU64,
    foreign_datagrams: AtomicU64,
    ignored_payloads: AtomicU64,
}

/// UDP socket bound to one voice endpoint
pub struct DatagramTransport {
    socket: UdpSocket,
    remote: SocketAddr,
    max_datagram_size: usize,
    counters: Counters,
}

impl DatagramTransport {
    /// Open a socket connected to `remote`
    pub async fn open(config: &NetworkConfig, remote: SocketAddr) -> Result<Self> {
        let socket = create_connected_socket(config, remote).await?;
        tracing::debug!(
            "Voice socket {} connected to {}",
            socket.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            remote
        );

        Ok(Self {
            socket,
            remote,
            max_datagram_size: config.max_datagram_size,
            counters: Counters::default(),
        })
    }

    /// Negotiated voice endpoint
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()).into())
    }

    /// Send one datagram to the voice endpoint
    pub async fn send(&self, datagram: &[u8]) -> Result<usize> {
        let sent = self
            .socket
            .send(datagram)
            .await
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;

        self.counters.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
        Ok(sent)
    }

    /// Send everything currently queued, in order. Stops early on cancellation.
    pub async fn flush(&self, queue: &SendQueue, cancel: &CancellationToken) -> Result<usize> {
        let mut sent = 0;
        while !cancel.is_cancelled() {
            let Some(datagram) = queue.try_dequeue() else {
                break;
            };
            self.send(&datagram).await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Flush `queue` every `interval` until cancelled
    pub async fn send_loop(
        &self,
        queue: &SendQueue,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let sent = self.flush(queue, cancel).await?;
            if sent > 0 {
                tracing::trace!("Flushed {} datagrams to {}", sent, self.remote);
            }
        }
    }

    /// Receive datagrams until cancelled, passing those from the voice
    /// endpoint to `on_datagram`. An error from the socket or the callback
    /// ends the loop.
    pub async fn receive_loop<F, Fut>(&self, cancel: &CancellationToken, mut on_datagram: F) -> Result<()>
    where
        F: FnMut(Bytes) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut buf = vec![0u8; self.max_datagram_size];

        loop {
            let (len, from) = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                received = self.socket.recv_from(&mut buf) => {
                    received.map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?
                }
            };

            if self.is_foreign(len, from) {
                self.counters.foreign_datagrams.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Dropped {}-byte datagram from {}", len, from);
                continue;
            }

            self.counters.datagrams_received.fetch_add(1, Ordering::Relaxed);
            self.counters.bytes_received.fetch_add(len as u64, Ordering::Relaxed);

            on_datagram(Bytes::copy_from_slice(&buf[..len])).await?;
        }
    }

    /// Empty, or not from the voice endpoint
    fn is_foreign(&self, len: usize, from: SocketAddr) -> bool {
        len == 0 || from != self.remote
    }

    pub(crate) fn record_ignored(&self) {
        self.counters.ignored_payloads.fetch_add(1, Ordering::Relaxed);
    }

    /// Get statistics
    pub fn stats(&self) -> TransportStats {
        TransportStats {
            datagrams_sent: self.counters.datagrams_sent.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            datagrams_received: self.counters.datagrams_received.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            foreign_datagrams: self.counters.foreign_datagrams.load(Ordering::Relaxed),
            ignored_payloads: self.counters.ignored_payloads.load(Ordering::Relaxed),
        }
    }
}
