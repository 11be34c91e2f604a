//! # Voice Transport
//!
//! Real-time voice session transport: a signaling handshake over an injected
//! control channel, UDP IP discovery and RTP-framed audio streaming.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                      VoiceConnection (connection)                        │
//! │        one CancellationToken, one JoinSet, one watcher task              │
//! │                                                                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  │
//! │  │  Signaling   │  │  Heartbeat   │  │   Receive    │  │     Send     │  │
//! │  │     loop     │  │     loop     │  │     loop     │  │     loop     │  │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘  └──────▲───────┘  │
//! │         │                 │                 │                 │          │
//! │         ▼                 ▼                 ▼                 │          │
//! │  ┌──────────────────────────────────────────────────┐  ┌──────┴───────┐  │
//! │  │          Handshake (network::handshake)          │  │  SendQueue   │  │
//! │  │ Idle → AwaitingReady → AwaitingDiscovery →       │  │    (FIFO)    │  │
//! │  │ AwaitingSessionDescription → Connected → Closed  │  └──────▲───────┘  │
//! │  └──────────────────────────────────────────────────┘         │          │
//! │                                                                │          │
//! │  PCM ──► AudioEncoder (codec) ──► RTP packetizer (protocol) ───┘          │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod loopback;
pub mod network;
pub mod protocol;
pub mod session;
pub mod signaling;

pub use connection::{LoopFailure, LoopKind, VoiceConnection};
pub use error::{Error, NetworkError, Result};
pub use network::HandshakeState;
pub use session::{SessionIdentity, VoiceSession};

/// Application-wide constants
pub mod constants {
    /// Default Opus sample rate for voice
    pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

    /// Default channel count (mono)
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Default frame size in milliseconds
    pub const DEFAULT_FRAME_SIZE_MS: u32 = 20;

    /// Default send queue flush interval in milliseconds
    pub const DEFAULT_SEND_INTERVAL_MS: u64 = 20;

    /// Default time to wait for the voice server to accept a login
    pub const DEFAULT_LOGIN_TIMEOUT_MS: u64 = 10_000;

    /// Default socket buffer size for the voice datagram socket
    pub const DEFAULT_SOCKET_BUFFER_SIZE: usize = 256 * 1024;

    /// Receive buffer length for a single datagram
    pub const MAX_DATAGRAM_SIZE: usize = 2048;

    /// Largest packet libopus will ever produce
    pub const MAX_OPUS_PACKET_SIZE: usize = 4000;
}
