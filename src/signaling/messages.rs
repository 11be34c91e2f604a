//! Control messages exchanged over the signaling channel
//!
//! Every frame is a JSON envelope `{"op": <opcode>, "d": <payload>}`.
//!
//! ```text
//! client                              voice server
//!   │──── op 0 LOGIN ────────────────────>│
//!   │<─── op 2 READY (ssrc, port, modes) ─│
//!   │════ UDP discovery probe/reply ═════>│
//!   │──── op 1 PROTOCOL_SELECT ──────────>│
//!   │<─── op 4 SESSION_DESCRIPTION ───────│
//!   │──── op 3 KEEPALIVE (periodic) ─────>│
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::crypto::TransportMode;
use crate::error::{Error, Result};
use crate::session::SessionIdentity;

/// Opcodes of the voice signaling protocol
pub mod opcode {
    pub const LOGIN: u8 = 0;
    pub const PROTOCOL_SELECT: u8 = 1;
    pub const READY: u8 = 2;
    pub const KEEPALIVE: u8 = 3;
    pub const SESSION_DESCRIPTION: u8 = 4;
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    op: u8,
    #[serde(default)]
    d: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Login {
    pub server_id: String,
    pub user_id: String,
    pub session_id: String,
    pub token: String,
}

impl From<&SessionIdentity> for Login {
    fn from(identity: &SessionIdentity) -> Self {
        Self {
            server_id: identity.server_id.clone(),
            user_id: identity.user_id.clone(),
            session_id: identity.session_id.clone(),
            token: identity.token.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolSelect {
    pub protocol: String,
    pub data: ProtocolData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolData {
    pub address: String,
    pub port: u16,
    pub mode: TransportMode,
}

impl ProtocolSelect {
    pub fn udp(address: String, port: u16, mode: TransportMode) -> Self {
        Self {
            protocol: "udp".to_string(),
            data: ProtocolData { address, port, mode },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAlive {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ready {
    pub ssrc: u32,
    pub port: u16,
    #[serde(default)]
    pub modes: Vec<TransportMode>,
    /// Keep-alive period in milliseconds
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub secret_key: Vec<u8>,
    pub mode: TransportMode,
}

/// Messages the client sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Login(Login),
    ProtocolSelect(ProtocolSelect),
    KeepAlive(KeepAlive),
}

/// Messages the voice server sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    Ready(Ready),
    SessionDescription(SessionDescription),
    Unknown { op: u8 },
}

impl OutboundMessage {
    pub fn opcode(&self) -> u8 {
        match self {
            OutboundMessage::Login(_) => opcode::LOGIN,
            OutboundMessage::ProtocolSelect(_) => opcode::PROTOCOL_SELECT,
            OutboundMessage::KeepAlive(_) => opcode::KEEPALIVE,
        }
    }

    /// Serialize into a signaling frame
    pub fn to_json(&self) -> Result<String> {
        match self {
            OutboundMessage::Login(p) => encode(self.opcode(), p),
            OutboundMessage::ProtocolSelect(p) => encode(self.opcode(), p),
            OutboundMessage::KeepAlive(p) => encode(self.opcode(), p),
        }
    }

    /// Parse a client frame; used by the server side of a session
    pub fn parse(text: &str) -> Result<Self> {
        let envelope = parse_envelope(text)?;
        match envelope.op {
            opcode::LOGIN => Ok(Self::Login(payload(envelope)?)),
            opcode::PROTOCOL_SELECT => Ok(Self::ProtocolSelect(payload(envelope)?)),
            opcode::KEEPALIVE => Ok(Self::KeepAlive(KeepAlive {})),
            op => Err(Error::UnknownControlOpcode(op)),
        }
    }
}

impl ControlEvent {
    pub fn opcode(&self) -> u8 {
        match self {
            ControlEvent::Ready(_) => opcode::READY,
            ControlEvent::SessionDescription(_) => opcode::SESSION_DESCRIPTION,
            ControlEvent::Unknown { op } => *op,
        }
    }

    /// Parse a server frame. Unknown opcodes are returned as
    /// [`ControlEvent::Unknown`] rather than as an error.
    pub fn parse(text: &str) -> Result<Self> {
        let envelope = parse_envelope(text)?;
        match envelope.op {
            opcode::READY => Ok(Self::Ready(payload(envelope)?)),
            opcode::SESSION_DESCRIPTION => Ok(Self::SessionDescription(payload(envelope)?)),
            op => Ok(Self::Unknown { op }),
        }
    }

    /// Serialize into a signaling frame; used by the server side of a session
    pub fn to_json(&self) -> Result<String> {
        match self {
            ControlEvent::Ready(p) => encode(self.opcode(), p),
            ControlEvent::SessionDescription(p) => encode(self.opcode(), p),
            ControlEvent::Unknown { op } => encode(*op, &serde_json::Value::Null),
        }
    }
}

fn encode<T: Serialize>(op: u8, payload: &T) -> Result<String> {
    let d = serde_json::to_value(payload)
        .map_err(|e| Error::ProtocolViolation(format!("unserializable op {} payload: {}", op, e)))?;
    serde_json::to_string(&Envelope { op, d })
        .map_err(|e| Error::ProtocolViolation(format!("unserializable op {} frame: {}", op, e)))
}

fn parse_envelope(text: &str) -> Result<Envelope> {
    serde_json::from_str(text)
        .map_err(|e| Error::ProtocolViolation(format!("malformed signaling frame: {}", e)))
}

fn payload<T: DeserializeOwned>(envelope: Envelope) -> Result<T> {
    let op = envelope.op;
    serde_json::from_value(envelope.d)
        .map_err(|e| Error::ProtocolViolation(format!("malformed op {} payload: {}", op, e)))
}
