//! Voice session handshake
//!
//! Drives the login exchange over the signaling channel and the IP discovery
//! exchange over the datagram socket, in that interleaved order:
//!
//! ```text
//! client                                  voice server
//!   │  Idle                                    │
//!   │──── LOGIN ──────────────────────────────>│
//!   │  AwaitingReady                           │
//!   │<─── READY (ssrc, port, modes) ───────────│
//!   │  AwaitingDiscovery  (socket opened)      │
//!   │════ discovery probe (UDP) ══════════════>│
//!   │<═══ discovery reply (UDP) ═══════════════│
//!   │  AwaitingSessionDescription              │
//!   │──── PROTOCOL_SELECT (address, port) ────>│
//!   │<─── SESSION_DESCRIPTION (secret key) ────│
//!   │  Connected                               │
//! ```
//!
//! Any state can move to `Closed` when the session is torn down.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::crypto::{select_mode, SecretKey, TransportMode};
use crate::error::{Error, NetworkError, Result};
use crate::network::queue::SendQueue;
use crate::network::transport::DatagramTransport;
use crate::protocol::{build_discovery_probe, parse_discovery_reply, RtpPacket};
use crate::session::{SessionIdentity, VoiceSession};
use crate::signaling::messages::{Login, ProtocolSelect, Ready, SessionDescription};
use crate::signaling::{ControlEvent, OutboundMessage, SignalingChannel};

/// Handshake progress, in the order states are reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandshakeState {
    /// Nothing sent yet
    Idle,
    /// Login sent, waiting for Ready
    AwaitingReady,
    /// Socket open and probe queued, waiting for the discovery reply
    AwaitingDiscovery,
    /// Protocol selected, waiting for the session description
    AwaitingSessionDescription,
    /// Session usable for audio
    Connected,
    /// Torn down
    Closed,
}

/// Handshake state machine for one voice session
pub struct Handshake {
    session: Arc<VoiceSession>,
    signaling: Arc<dyn SignalingChannel>,
    queue: SendQueue,
    config: Arc<AppConfig>,
    cancel: CancellationToken,
    state: watch::Sender<HandshakeState>,
    /// Set once the session description has been stored
    described: watch::Sender<bool>,
    transport: watch::Sender<Option<Arc<DatagramTransport>>>,
    heartbeat: watch::Sender<Option<Duration>>,
}

impl Handshake {
    pub fn new(
        session: Arc<VoiceSession>,
        signaling: Arc<dyn SignalingChannel>,
        queue: SendQueue,
        config: Arc<AppConfig>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            signaling,
            queue,
            config,
            cancel,
            state: watch::channel(HandshakeState::Idle).0,
            described: watch::channel(false).0,
            transport: watch::channel(None).0,
            heartbeat: watch::channel(None).0,
        }
    }

    pub fn state(&self) -> HandshakeState {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<HandshakeState> {
        self.state.subscribe()
    }

    pub fn session(&self) -> &Arc<VoiceSession> {
        &self.session
    }

    /// Datagram socket, present from `AwaitingDiscovery` until `Closed`
    pub fn transport(&self) -> Option<Arc<DatagramTransport>> {
        self.transport.borrow().clone()
    }

    pub fn subscribe_transport(&self) -> watch::Receiver<Option<Arc<DatagramTransport>>> {
        self.transport.subscribe()
    }

    /// Keep-alive interval announced in the Ready event
    pub fn subscribe_heartbeat(&self) -> watch::Receiver<Option<Duration>> {
        self.heartbeat.subscribe()
    }

    /// Log in and wait until the voice server has described the session.
    ///
    /// Allowed from `Idle`, and from `AwaitingReady` to retry after a timeout.
    pub async fn login(&self, identity: SessionIdentity) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::AuthenticationCancelled);
        }
        match self.state() {
            HandshakeState::Idle | HandshakeState::AwaitingReady => {}
            HandshakeState::Closed => return Err(Error::AuthenticationCancelled),
            found => {
                return Err(Error::InvalidState {
                    expected: HandshakeState::Idle,
                    found,
                })
            }
        }

        self.described.send_replace(false);
        self.session.with_clock(|clock| clock.reset_sequence());

        let login = Login::from(&identity);
        tracing::info!(
            "Logging in to voice server {} as user {} (server {})",
            self.session.host(),
            identity.user_id,
            identity.server_id
        );
        self.session.set_identity(identity);

        self.state.send_if_modified(|state| {
            if *state == HandshakeState::Idle {
                *state = HandshakeState::AwaitingReady;
                true
            } else {
                false
            }
        });
        self.send_message(OutboundMessage::Login(login)).await?;

        let timeout = self.config.voice.login_timeout();
        let mut described = self.described.subscribe();
        let wait = async move { described.wait_for(|done| *done).await.map(|_| ()) };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::AuthenticationCancelled),
            result = tokio::time::timeout(timeout, wait) => match result {
                Err(_) => {
                    tracing::warn!("Voice server did not describe the session within {:?}", timeout);
                    return Err(Error::AuthenticationTimeout(timeout));
                }
                Ok(Err(_)) => return Err(Error::AuthenticationCancelled),
                Ok(Ok(())) => {}
            }
        }

        if let Err(e) = self.transition(
            HandshakeState::AwaitingSessionDescription,
            HandshakeState::Connected,
        ) {
            return if self.state() == HandshakeState::Closed {
                Err(Error::AuthenticationCancelled)
            } else {
                Err(e)
            };
        }

        tracing::info!(
            "Voice session connected (ssrc {}, mode {})",
            self.session.ssrc().unwrap_or_default(),
            self.session.mode().map(TransportMode::as_str).unwrap_or("?")
        );
        Ok(())
    }

    /// Parse and dispatch one signaling frame
    pub async fn on_control_message(&self, text: &str) -> Result<()> {
        let event = ControlEvent::parse(text)?;
        self.on_control_event(event).await
    }

    pub async fn on_control_event(&self, event: ControlEvent) -> Result<()> {
        match event {
            ControlEvent::Ready(ready) => self.on_ready(ready).await,
            ControlEvent::SessionDescription(description) => {
                self.on_session_description(description)
            }
            ControlEvent::Unknown { op } => Err(Error::UnknownControlOpcode(op)),
        }
    }

    async fn on_ready(&self, ready: Ready) -> Result<()> {
        self.expect_state(HandshakeState::AwaitingReady)?;
        tracing::debug!(
            "Ready: ssrc {}, port {}, modes {:?}, heartbeat {}ms",
            ready.ssrc,
            ready.port,
            ready.modes,
            ready.heartbeat_interval
        );

        let endpoint = resolve_endpoint(self.session.host(), ready.port).await?;
        let mode = select_mode(&ready.modes, &self.config.voice.preferred_modes);
        self.session.set_negotiated(ready.ssrc, mode.clone(), endpoint)?;
        self.session.with_clock(|clock| clock.randomize());

        let transport = Arc::new(DatagramTransport::open(&self.config.network, endpoint).await?);

        self.transition(HandshakeState::AwaitingReady, HandshakeState::AwaitingDiscovery)?;
        self.transport.send_replace(Some(transport));
        if self.state() == HandshakeState::Closed {
            self.transport.send_replace(None);
            return Err(Error::AuthenticationCancelled);
        }

        if ready.heartbeat_interval > 0 {
            self.heartbeat
                .send_replace(Some(Duration::from_millis(ready.heartbeat_interval)));
        }

        self.queue.enqueue(build_discovery_probe(ready.ssrc));
        tracing::info!("Voice endpoint {} (mode {}), discovery probe queued", endpoint, mode);
        Ok(())
    }

    fn on_session_description(&self, description: SessionDescription) -> Result<()> {
        self.expect_state(HandshakeState::AwaitingSessionDescription)?;

        if self.session.mode() != Some(&description.mode) {
            tracing::warn!(
                "Server described mode {} but {:?} was selected",
                description.mode,
                self.session.mode()
            );
        }

        let key = SecretKey::new(description.secret_key);
        tracing::debug!("Session description received ({:?})", key);
        self.session.set_secret_key(key)?;
        self.described.send_replace(true);
        Ok(())
    }

    /// Route a datagram from the voice endpoint: the first one answers the
    /// discovery probe, everything after it is voice payload.
    pub async fn on_datagram(&self, datagram: Bytes) -> Result<()> {
        match self.state() {
            HandshakeState::AwaitingDiscovery => self.on_discovery_reply(&datagram).await,
            HandshakeState::AwaitingSessionDescription | HandshakeState::Connected => {
                self.on_voice_payload(&datagram)
            }
            state => Err(Error::ProtocolViolation(format!(
                "unexpected datagram in state {:?}",
                state
            ))),
        }
    }

    /// Handle the discovery reply and select the UDP protocol
    pub async fn on_discovery_reply(&self, datagram: &[u8]) -> Result<()> {
        self.expect_state(HandshakeState::AwaitingDiscovery)?;
        let reply = parse_discovery_reply(datagram)?;
        let mode = self
            .session
            .mode()
            .cloned()
            .unwrap_or(TransportMode::Plain);

        tracing::info!("External address {}:{}", reply.address, reply.port);
        self.session.set_external_address(reply.clone())?;
        self.transition(
            HandshakeState::AwaitingDiscovery,
            HandshakeState::AwaitingSessionDescription,
        )?;

        self.send_message(OutboundMessage::ProtocolSelect(ProtocolSelect::udp(
            reply.address,
            reply.port,
            mode,
        )))
        .await
    }

    /// Inbound audio is recognised but not decoded
    pub fn on_voice_payload(&self, datagram: &[u8]) -> Result<()> {
        let packet = RtpPacket::parse(datagram)?;
        tracing::trace!(
            "Voice packet ssrc {} seq {} ts {} ({} bytes)",
            packet.ssrc(),
            packet.sequence(),
            packet.timestamp(),
            packet.total_size()
        );
        Err(Error::Unsupported("inbound voice decoding"))
    }

    /// Serialize and send a control message. Gives up with
    /// `AuthenticationCancelled` once the session is cancelled.
    pub async fn send_message(&self, message: OutboundMessage) -> Result<()> {
        let text = message.to_json()?;
        tracing::trace!("Sending signaling op {}", message.opcode());
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::AuthenticationCancelled),
            sent = self.signaling.send(text) => sent.map_err(Error::from),
        }
    }

    /// Move to `Closed` and drop the datagram socket
    pub fn close(&self) {
        let previous = self.state.send_replace(HandshakeState::Closed);
        self.transport.send_replace(None);
        if previous != HandshakeState::Closed {
            tracing::info!("Voice session closed (was {:?})", previous);
        }
    }

    fn expect_state(&self, expected: HandshakeState) -> Result<()> {
        let found = self.state();
        if found == expected {
            Ok(())
        } else {
            Err(Error::ProtocolViolation(format!(
                "expected state {:?}, found {:?}",
                expected, found
            )))
        }
    }

    fn transition(&self, from: HandshakeState, to: HandshakeState) -> Result<()> {
        let mut found = from;
        let moved = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                found = *state;
                false
            }
        });

        if moved {
            tracing::debug!("Handshake {:?} -> {:?}", from, to);
            Ok(())
        } else {
            Err(Error::ProtocolViolation(format!(
                "cannot move from {:?} to {:?}: state is {:?}",
                from, to, found
            )))
        }
    }
}

/// Resolve the voice host, taking the first address returned
async fn resolve_endpoint(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| NetworkError::ResolveFailed(format!("{}:{}: {}", host, port, e)))?;

    addrs
        .next()
        .ok_or_else(|| NetworkError::ResolveFailed(format!("{}:{}: no addresses", host, port)).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_audio_packet, build_discovery_reply};
    use crate::signaling::messages::{opcode, KeepAlive};
    use crate::signaling::{memory_pair, MemoryPeer};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::net::UdpSocket;
    use tokio::task::JoinHandle;

    const SSRC: u32 = 0x0A0B_0C0D;

    struct Fixture {
        handshake: Arc<Handshake>,
        peer: MemoryPeer,
        queue: SendQueue,
        cancel: CancellationToken,
        server: UdpSocket,
    }

    async fn fixture(login_timeout_ms: u64) -> Fixture {
        let (channel, peer) = memory_pair();
        let mut config = AppConfig::default();
        config.voice.login_timeout_ms = login_timeout_ms;
        config.network.bind_address = "127.0.0.1".to_string();

        let queue = SendQueue::new();
        let cancel = CancellationToken::new();
        let session = Arc::new(VoiceSession::with_rng("127.0.0.1", StdRng::seed_from_u64(1)));
        let handshake = Arc::new(Handshake::new(
            session,
            Arc::new(channel),
            queue.clone(),
            Arc::new(config),
            cancel.clone(),
        ));

        Fixture {
            handshake,
            peer,
            queue,
            cancel,
            server: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    fn identity() -> SessionIdentity {
        SessionIdentity {
            server_id: "server".to_string(),
            user_id: "user".to_string(),
            session_id: "session".to_string(),
            token: "token".to_string(),
        }
    }

    fn ready(port: u16) -> ControlEvent {
        ControlEvent::Ready(Ready {
            ssrc: SSRC,
            port,
            modes: vec![TransportMode::XSalsa20Poly1305, TransportMode::Plain],
            heartbeat_interval: 5000,
        })
    }

    /// Start a login in the background and bring the handshake to `AwaitingDiscovery`
    async fn until_discovery(fx: &mut Fixture) -> JoinHandle<Result<()>> {
        let handshake = fx.handshake.clone();
        let login = tokio::spawn(async move { handshake.login(identity()).await });

        let frame = fx.peer.from_client.recv().await.unwrap();
        assert!(matches!(
            OutboundMessage::parse(&frame).unwrap(),
            OutboundMessage::Login(_)
        ));
        assert_eq!(fx.handshake.state(), HandshakeState::AwaitingReady);

        let port = fx.server.local_addr().unwrap().port();
        fx.handshake.on_control_event(ready(port)).await.unwrap();
        assert_eq!(fx.handshake.state(), HandshakeState::AwaitingDiscovery);
        login
    }

    #[tokio::test]
    async fn test_login_times_out() {
        let mut fx = fixture(100).await;

        let result = fx.handshake.login(identity()).await;
        assert!(matches!(result, Err(Error::AuthenticationTimeout(_))));
        assert_eq!(fx.handshake.state(), HandshakeState::AwaitingReady);

        let frame = fx.peer.from_client.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["op"], opcode::LOGIN);
        assert_eq!(value["d"]["token"], "token");
    }

    #[tokio::test]
    async fn test_login_cancelled() {
        let fx = fixture(10_000).await;
        let handshake = fx.handshake.clone();
        let login = tokio::spawn(async move { handshake.login(identity()).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        fx.cancel.cancel();

        let result = login.await.unwrap();
        assert!(matches!(result, Err(Error::AuthenticationCancelled)));
    }

    #[tokio::test]
    async fn test_full_handshake() {
        let mut fx = fixture(5_000).await;
        let login = until_discovery(&mut fx).await;

        let session = fx.handshake.session().clone();
        assert_eq!(session.ssrc(), Some(SSRC));
        assert_eq!(session.mode(), Some(&TransportMode::Plain));
        assert_eq!(session.endpoint(), Some(fx.server.local_addr().unwrap()));
        assert!(session.secret_key().is_none());
        assert!(fx.handshake.transport().is_some());
        assert_eq!(
            *fx.handshake.subscribe_heartbeat().borrow(),
            Some(Duration::from_millis(5000))
        );
        assert_eq!(fx.queue.try_dequeue().unwrap(), build_discovery_probe(SSRC));

        let reply = build_discovery_reply(SSRC, "198.51.100.4", 40_000).unwrap();
        fx.handshake.on_datagram(reply).await.unwrap();
        assert_eq!(
            fx.handshake.state(),
            HandshakeState::AwaitingSessionDescription
        );

        let frame = fx.peer.from_client.recv().await.unwrap();
        assert_eq!(
            OutboundMessage::parse(&frame).unwrap(),
            OutboundMessage::ProtocolSelect(ProtocolSelect::udp(
                "198.51.100.4".to_string(),
                40_000,
                TransportMode::Plain
            ))
        );

        fx.handshake
            .on_control_message(r#"{"op":4,"d":{"secret_key":[9,9,9],"mode":"plain"}}"#)
            .await
            .unwrap();

        login.await.unwrap().unwrap();
        assert_eq!(fx.handshake.state(), HandshakeState::Connected);
        assert_eq!(session.secret_key().unwrap().as_bytes(), &[9, 9, 9]);
        assert_eq!(session.identity().unwrap().session_id, "session");
    }

    #[tokio::test]
    async fn test_bad_discovery_length_keeps_state() {
        let mut fx = fixture(5_000).await;
        let _login = until_discovery(&mut fx).await;

        for len in [69, 71] {
            let result = fx.handshake.on_discovery_reply(&vec![0u8; len]).await;
            assert!(matches!(result, Err(Error::ProtocolViolation(_))));
            assert_eq!(fx.handshake.state(), HandshakeState::AwaitingDiscovery);
        }
        assert!(fx.handshake.session().external_address().is_none());

        let reply = build_discovery_reply(SSRC, "10.0.0.2", 7).unwrap();
        fx.handshake.on_discovery_reply(&reply).await.unwrap();
        assert_eq!(
            fx.handshake.state(),
            HandshakeState::AwaitingSessionDescription
        );
    }

    #[tokio::test]
    async fn test_out_of_order_events() {
        let fx = fixture(5_000).await;

        let result = fx.handshake.on_control_event(ready(9)).await;
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));

        let result = fx
            .handshake
            .on_control_message(r#"{"op":4,"d":{"secret_key":[1],"mode":"plain"}}"#)
            .await;
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));

        let result = fx.handshake.on_datagram(Bytes::from_static(b"early")).await;
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));

        assert_eq!(fx.handshake.state(), HandshakeState::Idle);
        assert!(fx.handshake.session().ssrc().is_none());
    }

    #[tokio::test]
    async fn test_unknown_opcode_leaves_state() {
        let fx = fixture(5_000).await;
        let result = fx
            .handshake
            .on_control_message(r#"{"op":8,"d":{"heartbeat_interval":1}}"#)
            .await;

        assert!(matches!(result, Err(Error::UnknownControlOpcode(8))));
        assert_eq!(fx.handshake.state(), HandshakeState::Idle);
    }

    #[tokio::test]
    async fn test_voice_payload_not_supported() {
        let mut fx = fixture(5_000).await;
        let _login = until_discovery(&mut fx).await;
        let reply = build_discovery_reply(SSRC, "10.0.0.2", 7).unwrap();
        fx.handshake.on_datagram(reply).await.unwrap();

        let packet = build_audio_packet(77, 1, 0, &[1, 2, 3]);
        let result = fx.handshake.on_datagram(packet).await;
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_close_drops_transport() {
        let mut fx = fixture(5_000).await;
        let login = until_discovery(&mut fx).await;

        fx.cancel.cancel();
        fx.handshake.close();

        assert_eq!(fx.handshake.state(), HandshakeState::Closed);
        assert!(fx.handshake.transport().is_none());
        assert!(matches!(
            login.await.unwrap(),
            Err(Error::AuthenticationCancelled)
        ));
        assert!(matches!(
            fx.handshake.login(identity()).await,
            Err(Error::AuthenticationCancelled)
        ));
    }

    #[tokio::test]
    async fn test_keepalive_goes_out_on_signaling() {
        let mut fx = fixture(5_000).await;
        fx.handshake
            .send_message(OutboundMessage::KeepAlive(KeepAlive {}))
            .await
            .unwrap();

        let frame = fx.peer.from_client.recv().await.unwrap();
        assert_eq!(frame, r#"{"op":3,"d":{}}"#);
    }
}
