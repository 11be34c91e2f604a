//! Per-session identifiers, negotiated parameters and packet counters

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Instant;

use crate::crypto::{SecretKey, TransportMode};
use crate::error::{Error, Result};
use crate::protocol::{next_sequence, DiscoveryReply, TICKS_PER_SECOND};

/// Credentials presented to the voice server at login
#[derive(Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub server_id: String,
    pub user_id: String,
    pub session_id: String,
    pub token: String,
}

impl fmt::Debug for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionIdentity")
            .field("server_id", &self.server_id)
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Sequence and timestamp source for outbound packets.
///
/// Timestamps count 100 ns ticks on the monotonic clock from a random
/// per-session offset, so packets never reveal process start or wall time.
pub struct SessionClock {
    rng: StdRng,
    sequence: u16,
    origin: Instant,
    offset_ticks: u64,
}

impl SessionClock {
    fn new(rng: StdRng) -> Self {
        Self {
            rng,
            sequence: 0,
            origin: Instant::now(),
            offset_ticks: 0,
        }
    }

    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// Pick a random starting sequence and time offset
    pub fn randomize(&mut self) {
        self.sequence = self.rng.random_range(0..u16::MAX);
        self.offset_ticks = self.rng.random_range(0..i32::MAX as u64);
        self.origin = Instant::now();
    }

    /// Sequence number the next packet will carry
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn elapsed_ticks(&self) -> u64 {
        let nanos = self.origin.elapsed().as_nanos();
        let ticks = nanos / (1_000_000_000 / TICKS_PER_SECOND as u128);
        self.offset_ticks.wrapping_add(ticks as u64)
    }

    /// Move past the current sequence number
    pub fn advance_sequence(&mut self) {
        self.sequence = next_sequence(self.sequence);
    }

    /// Claim the sequence number and timestamp ticks for one packet
    pub fn next_packet(&mut self) -> (u16, u64) {
        let sequence = self.sequence;
        self.advance_sequence();
        (sequence, self.elapsed_ticks())
    }
}

/// State of one voice session, shared by the handshake and the loops
pub struct VoiceSession {
    host: String,
    identity: Mutex<Option<SessionIdentity>>,
    ssrc: OnceLock<u32>,
    mode: OnceLock<TransportMode>,
    endpoint: OnceLock<SocketAddr>,
    external: OnceLock<DiscoveryReply>,
    secret_key: OnceLock<SecretKey>,
    clock: Mutex<SessionClock>,
}

impl VoiceSession {
    /// Create a session against the voice server at `host`
    pub fn new(host: impl Into<String>) -> Self {
        Self::with_rng(host, StdRng::from_os_rng())
    }

    /// Create a session with an explicit random source
    pub fn with_rng(host: impl Into<String>, rng: StdRng) -> Self {
        Self {
            host: host.into(),
            identity: Mutex::new(None),
            ssrc: OnceLock::new(),
            mode: OnceLock::new(),
            endpoint: OnceLock::new(),
            external: OnceLock::new(),
            secret_key: OnceLock::new(),
            clock: Mutex::new(SessionClock::new(rng)),
        }
    }

    /// Voice server host name
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn identity(&self) -> Option<SessionIdentity> {
        self.identity.lock().clone()
    }

    pub(crate) fn set_identity(&self, identity: SessionIdentity) {
        *self.identity.lock() = Some(identity);
    }

    pub fn ssrc(&self) -> Option<u32> {
        self.ssrc.get().copied()
    }

    pub fn mode(&self) -> Option<&TransportMode> {
        self.mode.get()
    }

    /// Remote voice endpoint resolved from the Ready event
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint.get().copied()
    }

    /// Our address as seen by the voice server
    pub fn external_address(&self) -> Option<&DiscoveryReply> {
        self.external.get()
    }

    pub fn secret_key(&self) -> Option<&SecretKey> {
        self.secret_key.get()
    }

    pub(crate) fn set_negotiated(
        &self,
        ssrc: u32,
        mode: TransportMode,
        endpoint: SocketAddr,
    ) -> Result<()> {
        write_once(&self.ssrc, ssrc, "ssrc")?;
        write_once(&self.mode, mode, "transport mode")?;
        write_once(&self.endpoint, endpoint, "voice endpoint")
    }

    pub(crate) fn set_external_address(&self, reply: DiscoveryReply) -> Result<()> {
        write_once(&self.external, reply, "external address")
    }

    pub(crate) fn set_secret_key(&self, key: SecretKey) -> Result<()> {
        write_once(&self.secret_key, key, "secret key")
    }

    /// Run `f` with exclusive access to the sequence/timestamp source
    pub fn with_clock<R>(&self, f: impl FnOnce(&mut SessionClock) -> R) -> R {
        f(&mut self.clock.lock())
    }
}

fn write_once<T>(cell: &OnceLock<T>, value: T, what: &str) -> Result<()> {
    cell.set(value)
        .map_err(|_| Error::ProtocolViolation(format!("{} already set for this session", what)))
}
