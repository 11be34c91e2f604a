//! Full voice sessions against the loopback server

use std::sync::Arc;
use std::time::Duration;

use voice_transport::codec::{AudioEncoder, OutboundFrame};
use voice_transport::config::AppConfig;
use voice_transport::crypto::TransportMode;
use voice_transport::loopback::{LoopbackOptions, LoopbackServer};
use voice_transport::signaling::memory_pair;
use voice_transport::{
    Error, HandshakeState, LoopKind, NetworkError, SessionIdentity, VoiceConnection,
};

/// Emits the first sample's low byte as a one-byte frame
struct TagEncoder;

impl AudioEncoder for TagEncoder {
    fn encode(&mut self, samples: &[i16]) -> voice_transport::Result<OutboundFrame> {
        Ok(OutboundFrame::new(vec![samples[0] as u8]))
    }

    fn samples_per_frame(&self) -> usize {
        480
    }
}

fn identity() -> SessionIdentity {
    SessionIdentity {
        server_id: "41771983423143937".to_string(),
        user_id: "104694319306248192".to_string(),
        session_id: "session".to_string(),
        token: "token".to_string(),
    }
}

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.voice.login_timeout_ms = 2_000;
    config.voice.send_interval_ms = 5;
    config.network.bind_address = "127.0.0.1".to_string();
    config
}

fn options() -> LoopbackOptions {
    LoopbackOptions {
        ssrc: 0xDEAD_BEEF,
        modes: vec![TransportMode::XSalsa20Poly1305, TransportMode::Plain],
        heartbeat_interval_ms: 50,
        secret_key: vec![7; 32],
        advertised_address: Some("203.0.113.9".to_string()),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_session_streams_audio() {
    let (client, peer) = memory_pair();
    let server = LoopbackServer::start(peer, options()).await.unwrap();
    let connection = VoiceConnection::connect(
        config(),
        "127.0.0.1",
        Arc::new(client),
        Box::new(TagEncoder),
    )
    .await
    .unwrap();

    connection.login(identity()).await.unwrap();
    assert_eq!(connection.state(), HandshakeState::Connected);

    let session = connection.session();
    assert_eq!(session.ssrc(), Some(0xDEAD_BEEF));
    assert_eq!(session.mode(), Some(&TransportMode::Plain));
    assert_eq!(session.secret_key().unwrap().as_bytes(), &[7; 32]);

    let external = session.external_address().unwrap();
    assert_eq!(external.address, "203.0.113.9");

    let selected = server.stats().selected.unwrap();
    assert_eq!(selected.protocol, "udp");
    assert_eq!(selected.data.address, "203.0.113.9");
    assert_eq!(selected.data.port, external.port);

    for i in 0..10i16 {
        connection.send_pcm(&[i; 480]).unwrap();
    }
    wait_until(|| server.stats().audio_packets == 10).await;

    let stats = server.stats();
    assert_eq!(stats.audio_bytes, 10);
    assert_eq!(stats.sequence_gaps, 0);
    assert_eq!(server.stats().probes, 1);

    let transport = connection.stats().unwrap();
    assert_eq!(transport.datagrams_sent, 11);
    assert_eq!(transport.datagrams_received, 1);

    wait_until(|| server.stats().keepalives >= 2).await;

    connection.disconnect();
    assert!(connection.closed().await.is_none());
    assert_eq!(connection.state(), HandshakeState::Closed);
    assert!(connection.stats().is_none());
    server.shutdown().await;
}

#[tokio::test]
async fn test_login_times_out_without_server() {
    let (client, _peer) = memory_pair();
    let mut config = config();
    config.voice.login_timeout_ms = 100;

    let connection =
        VoiceConnection::connect(config, "127.0.0.1", Arc::new(client), Box::new(TagEncoder))
            .await
            .unwrap();

    let result = connection.login(identity()).await;
    assert!(matches!(result, Err(Error::AuthenticationTimeout(_))));
    assert_eq!(connection.state(), HandshakeState::AwaitingReady);
    assert!(!connection.is_closed());
}

#[tokio::test]
async fn test_retry_after_timeout() {
    let (client, peer) = memory_pair();
    let mut config = config();
    config.voice.login_timeout_ms = 100;

    let connection =
        VoiceConnection::connect(config, "127.0.0.1", Arc::new(client), Box::new(TagEncoder))
            .await
            .unwrap();
    assert!(matches!(
        connection.login(identity()).await,
        Err(Error::AuthenticationTimeout(_))
    ));

    // The server only comes up after the first attempt gave up
    let server = LoopbackServer::start(peer, options()).await.unwrap();
    connection.login(identity()).await.unwrap();

    assert_eq!(connection.state(), HandshakeState::Connected);
    assert_eq!(server.stats().logins, 2);
}

#[tokio::test]
async fn test_server_going_away_ends_session() {
    let (client, peer) = memory_pair();
    let server = LoopbackServer::start(peer, options()).await.unwrap();
    let connection = VoiceConnection::connect(
        config(),
        "127.0.0.1",
        Arc::new(client),
        Box::new(TagEncoder),
    )
    .await
    .unwrap();
    connection.login(identity()).await.unwrap();

    server.shutdown().await;

    let failure = tokio::time::timeout(Duration::from_secs(2), connection.closed())
        .await
        .unwrap()
        .unwrap();
    // A keep-alive can notice the closed channel before the inbound side does
    assert!(matches!(
        failure.kind,
        LoopKind::Signaling | LoopKind::Heartbeat
    ));
    assert!(matches!(
        *failure.error,
        Error::Transport(NetworkError::SignalingClosed)
    ));
    assert_eq!(connection.state(), HandshakeState::Closed);
    assert!(matches!(
        connection.send_pcm(&[0; 480]),
        Err(Error::InvalidState { .. })
    ));
}
