//! Error types

use std::time::Duration;
use thiserror::Error;

use crate::network::HandshakeState;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error
#[derive(Debug, Error)]
pub enum Error {
    /// The voice server did not complete the login within the configured window
    #[error("no session description from voice server within {0:?}")]
    AuthenticationTimeout(Duration),

    /// The session was torn down while `login` was waiting
    #[error("session cancelled during login")]
    AuthenticationCancelled,

    /// Malformed datagram or control message, or a message in the wrong state
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Socket-level or signaling-level failure; fatal to the session
    #[error("transport failure: {0}")]
    Transport(#[from] NetworkError),

    #[error("unknown control opcode {0}")]
    UnknownControlOpcode(u8),

    /// Path intentionally left unimplemented
    #[error("not supported: {0}")]
    Unsupported(&'static str),

    #[error("invalid handshake state: expected {expected:?}, found {found:?}")]
    InvalidState {
        expected: HandshakeState,
        found: HandshakeState,
    },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error must tear the session down when it escapes a loop.
    ///
    /// Protocol noise (bad datagrams, unknown opcodes, unsupported payloads)
    /// is logged and skipped; everything else ends the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::ProtocolViolation(_) | Error::UnknownControlOpcode(_) | Error::Unsupported(_)
        )
    }
}

impl From<opus::Error> for Error {
    fn from(e: opus::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

/// Network-level errors
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to bind socket: {0}")]
    BindFailed(String),

    #[error("failed to connect socket to {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    #[error("failed to resolve voice endpoint {0}")]
    ResolveFailed(String),

    #[error("failed to send datagram: {0}")]
    SendFailed(String),

    #[error("failed to receive datagram: {0}")]
    ReceiveFailed(String),

    #[error("signaling channel closed")]
    SignalingClosed,

    #[error("signaling channel error: {0}")]
    Signaling(String),

    #[error("session task aborted: {0}")]
    TaskAborted(String),
}
