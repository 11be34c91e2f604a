//! In-process voice server
//!
//! Answers the client side of a session over a [`MemoryPeer`] and a UDP
//! socket on the loopback interface:
//! - Login is answered with Ready, ProtocolSelect with SessionDescription
//! - discovery probes are answered with the address the probe came from
//! - RTP packets are parsed and counted

use parking_lot::Mutex;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::constants::MAX_DATAGRAM_SIZE;
use crate::crypto::TransportMode;
use crate::error::{NetworkError, Result};
use crate::protocol::{
    build_discovery_reply, RtpPacket, DISCOVERY_PACKET_SIZE, RTP_FLAGS, RTP_PAYLOAD_TYPE,
};
use crate::signaling::messages::{ProtocolSelect, Ready, SessionDescription};
use crate::signaling::{ControlEvent, MemoryPeer, OutboundMessage};

/// What the server announces
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    pub ssrc: u32,
    pub modes: Vec<TransportMode>,
    pub heartbeat_interval_ms: u64,
    pub secret_key: Vec<u8>,
    /// Address reported in discovery replies instead of the observed one
    pub advertised_address: Option<String>,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            ssrc: rand::rng().random(),
            modes: vec![TransportMode::XSalsa20Poly1305, TransportMode::Plain],
            heartbeat_interval_ms: 1000,
            secret_key: rand::rng().random::<[u8; 32]>().to_vec(),
            advertised_address: None,
        }
    }
}

/// Counters kept by the server
#[derive(Debug, Clone, Default)]
pub struct LoopbackStats {
    pub logins: u64,
    pub keepalives: u64,
    pub probes: u64,
    pub audio_packets: u64,
    pub audio_bytes: u64,
    /// Packets whose sequence did not follow the previous one
    pub sequence_gaps: u64,
    pub last_sequence: Option<u16>,
    /// Datagrams that were neither probes nor RTP for the announced ssrc
    pub rejected_datagrams: u64,
    pub selected: Option<ProtocolSelect>,
}

/// Running loopback server
pub struct LoopbackServer {
    local_addr: SocketAddr,
    events: mpsc::UnboundedSender<String>,
    stats: Arc<Mutex<LoopbackStats>>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl LoopbackServer {
    /// Bind a UDP socket on 127.0.0.1 and start serving `peer`
    pub async fn start(peer: MemoryPeer, options: LoopbackOptions) -> Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        let MemoryPeer {
            to_client,
            from_client,
        } = peer;
        let options = Arc::new(options);
        let stats = Arc::new(Mutex::new(LoopbackStats::default()));
        let cancel = CancellationToken::new();

        let mut tasks = JoinSet::new();
        tasks.spawn(serve_signaling(
            from_client,
            to_client.clone(),
            local_addr.port(),
            options.clone(),
            stats.clone(),
            cancel.clone(),
        ));
        tasks.spawn(serve_datagrams(socket, options, stats.clone(), cancel.clone()));

        tracing::info!("Loopback voice server listening on {}", local_addr);

        Ok(Self {
            local_addr,
            events: to_client,
            stats,
            cancel,
            tasks,
        })
    }

    /// Voice port announced in Ready
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> LoopbackStats {
        self.stats.lock().clone()
    }

    /// Push an extra control event to the client
    pub fn send_event(&self, event: &ControlEvent) -> Result<()> {
        self.events
            .send(event.to_json()?)
            .map_err(|_| NetworkError::SignalingClosed.into())
    }

    /// Stop serving and wait for both tasks
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while self.tasks.join_next().await.is_some() {}
        tracing::debug!("Loopback voice server stopped");
    }
}

impl Drop for LoopbackServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve_signaling(
    mut from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<String>,
    port: u16,
    options: Arc<LoopbackOptions>,
    stats: Arc<Mutex<LoopbackStats>>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            frame = from_client.recv() => frame,
        };
        let Some(text) = frame else {
            tracing::debug!("Client closed signaling");
            return;
        };

        let reply = match OutboundMessage::parse(&text) {
            Ok(OutboundMessage::Login(login)) => {
                tracing::debug!("Login from user {} (session {})", login.user_id, login.session_id);
                stats.lock().logins += 1;
                Some(ControlEvent::Ready(Ready {
                    ssrc: options.ssrc,
                    port,
                    modes: options.modes.clone(),
                    heartbeat_interval: options.heartbeat_interval_ms,
                }))
            }
            Ok(OutboundMessage::ProtocolSelect(select)) => {
                tracing::debug!(
                    "Client selected {} at {}:{} ({})",
                    select.protocol,
                    select.data.address,
                    select.data.port,
                    select.data.mode
                );
                let mode = select.data.mode.clone();
                stats.lock().selected = Some(select);
                Some(ControlEvent::SessionDescription(SessionDescription {
                    secret_key: options.secret_key.clone(),
                    mode,
                }))
            }
            Ok(OutboundMessage::KeepAlive(_)) => {
                stats.lock().keepalives += 1;
                None
            }
            Err(e) => {
                tracing::warn!("Loopback server ignoring frame: {}", e);
                None
            }
        };

        if let Some(event) = reply {
            let sent = event.to_json().map(|json| to_client.send(json).is_ok());
            match sent {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => tracing::warn!("Loopback server cannot encode reply: {}", e),
            }
        }
    }
}

async fn serve_datagrams(
    socket: UdpSocket,
    options: Arc<LoopbackOptions>,
    stats: Arc<Mutex<LoopbackStats>>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let (len, from) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!("Loopback server receive failed: {}", e);
                    continue;
                }
            },
        };
        let datagram = &buf[..len];

        if is_probe(datagram) {
            let ssrc = u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
            stats.lock().probes += 1;

            let address = options
                .advertised_address
                .clone()
                .unwrap_or_else(|| from.ip().to_string());
            match build_discovery_reply(ssrc, &address, from.port()) {
                Ok(reply) => {
                    if let Err(e) = socket.send_to(&reply, from).await {
                        tracing::warn!("Loopback server discovery reply failed: {}", e);
                    }
                }
                Err(e) => tracing::warn!("Loopback server cannot build reply: {}", e),
            }
        } else if len >= 2 && datagram[0] == RTP_FLAGS && datagram[1] == RTP_PAYLOAD_TYPE {
            record_audio(&stats, options.ssrc, datagram);
        } else {
            stats.lock().rejected_datagrams += 1;
        }
    }
}

/// A probe carries the ssrc and nothing else
fn is_probe(datagram: &[u8]) -> bool {
    datagram.len() == DISCOVERY_PACKET_SIZE && datagram[4..].iter().all(|b| *b == 0)
}

fn record_audio(stats: &Mutex<LoopbackStats>, ssrc: u32, datagram: &[u8]) {
    let mut stats = stats.lock();
    let packet = match RtpPacket::parse(datagram) {
        Ok(packet) if packet.ssrc() == ssrc => packet,
        _ => {
            stats.rejected_datagrams += 1;
            return;
        }
    };

    if let Some(last) = stats.last_sequence {
        if packet.sequence() != last.wrapping_add(1) {
            stats.sequence_gaps += 1;
        }
    }
    stats.last_sequence = Some(packet.sequence());
    stats.audio_packets += 1;
    stats.audio_bytes += packet.payload().len() as u64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_audio_packet, build_discovery_probe, parse_discovery_reply};
    use crate::session::SessionIdentity;
    use crate::signaling::messages::Login;
    use crate::signaling::memory_pair;
    use crate::signaling::SignalingChannel;
    use std::time::Duration;

    fn options() -> LoopbackOptions {
        LoopbackOptions {
            ssrc: 4242,
            modes: vec![TransportMode::Plain],
            heartbeat_interval_ms: 250,
            secret_key: vec![5; 32],
            advertised_address: None,
        }
    }

    #[tokio::test]
    async fn test_login_answered_with_ready() {
        let (client, peer) = memory_pair();
        let mut inbound = client.start().await.unwrap();
        let server = LoopbackServer::start(peer, options()).await.unwrap();

        let identity = SessionIdentity {
            server_id: "s".to_string(),
            user_id: "u".to_string(),
            session_id: "x".to_string(),
            token: "t".to_string(),
        };
        let login = OutboundMessage::Login(Login::from(&identity));
        client.send(login.to_json().unwrap()).await.unwrap();

        let frame = inbound.recv().await.unwrap();
        assert_eq!(
            ControlEvent::parse(&frame).unwrap(),
            ControlEvent::Ready(Ready {
                ssrc: 4242,
                port: server.port(),
                modes: vec![TransportMode::Plain],
                heartbeat_interval: 250,
            })
        );
        assert_eq!(server.stats().logins, 1);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_probe_answered_with_observed_address() {
        let (_client, peer) = memory_pair();
        let server = LoopbackServer::start(peer, options()).await.unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(server.local_addr()).await.unwrap();
        socket.send(&build_discovery_probe(4242)).await.unwrap();

        let mut buf = [0u8; 128];
        let len = tokio::time::timeout(Duration::from_secs(1), socket.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = parse_discovery_reply(&buf[..len]).unwrap();

        assert_eq!(reply.address, "127.0.0.1");
        assert_eq!(reply.port, socket.local_addr().unwrap().port());
        assert_eq!(server.stats().probes, 1);
    }

    #[test]
    fn test_audio_sequence_tracking() {
        let stats = Mutex::new(LoopbackStats::default());
        for sequence in [10u16, 11, 13] {
            record_audio(&stats, 7, &build_audio_packet(7, sequence, 0, &[1, 2]));
        }
        record_audio(&stats, 7, &build_audio_packet(8, 14, 0, &[1]));

        let stats = stats.lock();
        assert_eq!(stats.audio_packets, 3);
        assert_eq!(stats.audio_bytes, 6);
        assert_eq!(stats.sequence_gaps, 1);
        assert_eq!(stats.last_sequence, Some(13));
        assert_eq!(stats.rejected_datagrams, 1);
    }
}
