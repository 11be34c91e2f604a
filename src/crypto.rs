//! Payload protection negotiated for the voice data channel
//!
//! The voice server offers a list of modes in its Ready event and the client
//! picks one with [`select_mode`]. Only `plain` is carried end to end; other
//! modes route audio through a [`PayloadCipher`], and the bundled
//! [`UnsupportedCipher`] refuses to seal anything.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Transport mode name as exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TransportMode {
    /// Unencrypted RTP payloads
    Plain,
    /// XSalsa20-Poly1305 secretbox over the payload
    XSalsa20Poly1305,
    /// Any mode this crate does not know by name
    Other(String),
}

impl TransportMode {
    pub fn as_str(&self) -> &str {
        match self {
            TransportMode::Plain => "plain",
            TransportMode::XSalsa20Poly1305 => "xsalsa20_poly1305",
            TransportMode::Other(name) => name,
        }
    }

    pub fn is_plain(&self) -> bool {
        matches!(self, TransportMode::Plain)
    }
}

impl From<String> for TransportMode {
    fn from(value: String) -> Self {
        match value.as_str() {
            "plain" => TransportMode::Plain,
            "xsalsa20_poly1305" => TransportMode::XSalsa20Poly1305,
            _ => TransportMode::Other(value),
        }
    }
}

impl From<TransportMode> for String {
    fn from(mode: TransportMode) -> Self {
        match mode {
            TransportMode::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick the transport mode for a session.
///
/// Returns the first entry of `preferred` that the server offered. When the
/// server offers none of them the session falls back to [`TransportMode::Plain`].
pub fn select_mode(offered: &[TransportMode], preferred: &[TransportMode]) -> TransportMode {
    if let Some(mode) = preferred.iter().find(|mode| offered.contains(mode)) {
        return mode.clone();
    }

    tracing::warn!(
        "Server offered none of the preferred modes {:?} (offered {:?}), falling back to plain",
        preferred,
        offered
    );
    TransportMode::Plain
}

/// Session secret handed out in the session description
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey(Vec<u8>);

impl SecretKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey({} bytes)", self.0.len())
    }
}

/// Encrypts outbound payloads for non-plain transport modes
pub trait PayloadCipher: Send + Sync {
    fn seal(&self, payload: &[u8], nonce: &[u8], key: &SecretKey) -> Result<Vec<u8>>;
}

/// Cipher placeholder: payload encryption is not implemented
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedCipher;

impl PayloadCipher for UnsupportedCipher {
    fn seal(&self, _payload: &[u8], _nonce: &[u8], _key: &SecretKey) -> Result<Vec<u8>> {
        Err(Error::Unsupported("payload encryption"))
    }
}
