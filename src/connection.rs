//! Voice connection lifecycle
//!
//! A [`VoiceConnection`] owns one cancellation scope and four loops:
//! signaling, heartbeat, receive and send. The first loop to exit cancels the
//! scope. Once every loop has stopped the watcher stops the signaling
//! channel, closes the handshake and clears the send queue.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::codec::{AudioEncoder, OutboundFrame};
use crate::config::AppConfig;
use crate::crypto::{PayloadCipher, UnsupportedCipher};
use crate::error::{Error, NetworkError, Result};
use crate::network::{DatagramTransport, Handshake, HandshakeState, SendQueue, TransportStats};
use crate::protocol::{build_audio_packet, rtp_header, RTP_HEADER_SIZE};
use crate::session::{SessionIdentity, VoiceSession};
use crate::signaling::messages::KeepAlive;
use crate::signaling::{OutboundMessage, SignalingChannel};

/// Nonce length handed to the payload cipher
const NONCE_SIZE: usize = 24;

/// Which loop of the session failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopKind {
    Signaling,
    Heartbeat,
    Receive,
    Send,
}

impl fmt::Display for LoopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopKind::Signaling => "signaling",
            LoopKind::Heartbeat => "heartbeat",
            LoopKind::Receive => "receive",
            LoopKind::Send => "send",
        };
        f.write_str(name)
    }
}

/// First error that ended the session
#[derive(Debug, Clone)]
pub struct LoopFailure {
    pub kind: LoopKind,
    pub error: Arc<Error>,
}

impl fmt::Display for LoopFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} loop failed: {}", self.kind, self.error)
    }
}

type LoopSet = JoinSet<(LoopKind, Result<()>)>;

/// Running voice session
pub struct VoiceConnection {
    handshake: Arc<Handshake>,
    queue: SendQueue,
    encoder: Mutex<Box<dyn AudioEncoder>>,
    cipher: Box<dyn PayloadCipher>,
    cancel: CancellationToken,
    closed: watch::Receiver<bool>,
    failure: Arc<Mutex<Option<LoopFailure>>>,
}

impl VoiceConnection {
    /// Start a session against the voice server at `host`
    pub async fn connect(
        config: AppConfig,
        host: impl Into<String>,
        signaling: Arc<dyn SignalingChannel>,
        encoder: Box<dyn AudioEncoder>,
    ) -> Result<Self> {
        let session = Arc::new(VoiceSession::new(host));
        Self::connect_with(config, session, signaling, encoder, Box::new(UnsupportedCipher)).await
    }

    /// Start a session with an explicit session state and payload cipher
    pub async fn connect_with(
        config: AppConfig,
        session: Arc<VoiceSession>,
        signaling: Arc<dyn SignalingChannel>,
        encoder: Box<dyn AudioEncoder>,
        cipher: Box<dyn PayloadCipher>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let inbound = signaling.start().await?;

        let cancel = CancellationToken::new();
        let queue = SendQueue::new();
        let handshake = Arc::new(Handshake::new(
            session,
            signaling.clone(),
            queue.clone(),
            config.clone(),
            cancel.clone(),
        ));

        let mut loops = LoopSet::new();
        spawn_loop(
            &mut loops,
            LoopKind::Signaling,
            signaling_loop(handshake.clone(), inbound, cancel.clone()),
        );
        spawn_loop(
            &mut loops,
            LoopKind::Heartbeat,
            heartbeat_loop(handshake.clone(), cancel.clone()),
        );
        spawn_loop(
            &mut loops,
            LoopKind::Receive,
            receive_loop(handshake.clone(), cancel.clone()),
        );
        spawn_loop(
            &mut loops,
            LoopKind::Send,
            send_loop(
                handshake.clone(),
                queue.clone(),
                config.voice.send_interval(),
                cancel.clone(),
            ),
        );

        let (closed_tx, closed) = watch::channel(false);
        let failure = Arc::new(Mutex::new(None));

        tokio::spawn(supervise(
            loops,
            cancel.clone(),
            failure.clone(),
            signaling,
            handshake.clone(),
            queue.clone(),
            closed_tx,
        ));

        tracing::info!("Voice connection to {} started", handshake.session().host());

        Ok(Self {
            handshake,
            queue,
            encoder: Mutex::new(encoder),
            cipher,
            cancel,
            closed,
            failure,
        })
    }

    /// Log in and wait for the session to be described
    pub async fn login(&self, identity: SessionIdentity) -> Result<()> {
        self.handshake.login(identity).await
    }

    /// Encode one frame of PCM and queue it for sending
    pub fn send_pcm(&self, samples: &[i16]) -> Result<()> {
        let frame = self.encoder.lock().encode(samples)?;
        self.send_frame(&frame)
    }

    /// Packetize an already-encoded frame and queue it for sending
    pub fn send_frame(&self, frame: &OutboundFrame) -> Result<()> {
        let found = self.handshake.state();
        if found != HandshakeState::Connected {
            return Err(Error::InvalidState {
                expected: HandshakeState::Connected,
                found,
            });
        }

        let session = self.handshake.session();
        let ssrc = session
            .ssrc()
            .ok_or_else(|| Error::ProtocolViolation("connected session has no ssrc".to_string()))?;

        // Sequence claim and enqueue share the clock lock so queue order
        // matches sequence order across producers
        session.with_clock(|clock| -> Result<()> {
            let sequence = clock.sequence();
            let ticks = clock.elapsed_ticks();

            let packet = match session.mode() {
                Some(mode) if !mode.is_plain() => {
                    let key = session.secret_key().ok_or_else(|| {
                        Error::ProtocolViolation("connected session has no secret key".to_string())
                    })?;
                    let mut nonce = [0u8; NONCE_SIZE];
                    nonce[..RTP_HEADER_SIZE].copy_from_slice(&rtp_header(ssrc, sequence, ticks));
                    let sealed = self.cipher.seal(frame.as_bytes(), &nonce, key)?;
                    build_audio_packet(ssrc, sequence, ticks, &sealed)
                }
                _ => build_audio_packet(ssrc, sequence, ticks, frame.as_bytes()),
            };

            clock.advance_sequence();
            self.queue.enqueue(packet);
            Ok(())
        })
    }

    /// Interleaved samples `send_pcm` expects per call
    pub fn samples_per_frame(&self) -> usize {
        self.encoder.lock().samples_per_frame()
    }

    pub fn state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<HandshakeState> {
        self.handshake.subscribe()
    }

    pub fn session(&self) -> &Arc<VoiceSession> {
        self.handshake.session()
    }

    /// Socket counters, while the datagram socket is open
    pub fn stats(&self) -> Option<TransportStats> {
        self.handshake.transport().map(|transport| transport.stats())
    }

    /// Datagrams waiting for the next flush
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Cancel every loop; teardown completes in the background
    pub fn disconnect(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!("Disconnecting voice session");
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait until teardown has finished, returning the error that caused it
    pub async fn closed(&self) -> Option<LoopFailure> {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|done| *done).await;
        self.failure()
    }

    pub fn failure(&self) -> Option<LoopFailure> {
        self.failure.lock().clone()
    }
}

impl Drop for VoiceConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Run `body` in its own task so a panic is reported against its loop
fn spawn_loop<F>(loops: &mut LoopSet, kind: LoopKind, body: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    loops.spawn(async move {
        let result = match tokio::spawn(body).await {
            Ok(result) => result,
            Err(e) => Err(NetworkError::TaskAborted(e.to_string()).into()),
        };
        (kind, result)
    });
}

async fn supervise(
    mut loops: LoopSet,
    cancel: CancellationToken,
    failure: Arc<Mutex<Option<LoopFailure>>>,
    signaling: Arc<dyn SignalingChannel>,
    handshake: Arc<Handshake>,
    queue: SendQueue,
    closed: watch::Sender<bool>,
) {
    while let Some(joined) = loops.join_next().await {
        match joined {
            Ok((kind, Ok(()))) => tracing::debug!("{} loop stopped", kind),
            Ok((kind, Err(error))) => {
                tracing::error!("{} loop failed: {}", kind, error);
                let mut slot = failure.lock();
                if slot.is_none() {
                    *slot = Some(LoopFailure {
                        kind,
                        error: Arc::new(error),
                    });
                }
            }
            Err(e) => tracing::error!("Voice loop supervisor task failed: {}", e),
        }
        cancel.cancel();
    }

    signaling.stop().await;
    handshake.close();
    let dropped = queue.clear();
    if dropped > 0 {
        tracing::debug!("Dropped {} unsent datagrams", dropped);
    }

    closed.send_replace(true);
    tracing::info!("Voice connection torn down");
}

async fn signaling_loop(
    handshake: Arc<Handshake>,
    mut inbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            frame = inbound.recv() => frame,
        };

        let Some(text) = frame else {
            return Err(NetworkError::SignalingClosed.into());
        };

        let handled = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            handled = handshake.on_control_message(&text) => handled,
        };

        if let Err(e) = handled {
            if e.is_fatal() {
                return Err(e);
            }
            tracing::warn!("Ignoring signaling frame: {}", e);
        }
    }
}

async fn heartbeat_loop(handshake: Arc<Handshake>, cancel: CancellationToken) -> Result<()> {
    let mut heartbeat = handshake.subscribe_heartbeat();
    let interval = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(()),
        announced = heartbeat.wait_for(Option::is_some) => announced.ok().and_then(|interval| *interval),
    };
    let Some(interval) = interval else {
        return Ok(());
    };

    tracing::debug!("Sending keep-alive every {:?}", interval);
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            sent = handshake.send_message(OutboundMessage::KeepAlive(KeepAlive {})) => sent?,
        }
        tracing::trace!("Keep-alive sent");
    }
}

async fn receive_loop(handshake: Arc<Handshake>, cancel: CancellationToken) -> Result<()> {
    let Some(transport) = wait_for_transport(&handshake, &cancel).await else {
        return Ok(());
    };

    let on_datagram = |datagram: Bytes| {
        let handshake = handshake.clone();
        let transport = transport.clone();
        let cancel = cancel.clone();
        async move {
            let discovering = handshake.state() == HandshakeState::AwaitingDiscovery;
            let handled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                handled = handshake.on_datagram(datagram) => handled,
            };
            match handled {
                Ok(()) => Ok(()),
                Err(e) if discovering || e.is_fatal() => Err(e),
                Err(e) => {
                    tracing::trace!("Ignoring datagram: {}", e);
                    transport.record_ignored();
                    Ok(())
                }
            }
        }
    };

    transport.receive_loop(&cancel, on_datagram).await
}

async fn send_loop(
    handshake: Arc<Handshake>,
    queue: SendQueue,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let Some(transport) = wait_for_transport(&handshake, &cancel).await else {
        return Ok(());
    };

    transport.send_loop(&queue, interval, &cancel).await
}

/// Wait for the handshake to open the datagram socket
async fn wait_for_transport(
    handshake: &Handshake,
    cancel: &CancellationToken,
) -> Option<Arc<DatagramTransport>> {
    let mut transport = handshake.subscribe_transport();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        opened = transport.wait_for(Option::is_some) => opened.ok().and_then(|t| (*t).clone()),
    }
}
