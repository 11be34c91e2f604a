//! Datagram framing for the voice data channel
//!
//! ## Audio Packet Format
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │                         RTP Header (12 bytes)                          │
//! ├──────────┬──────────┬────────────┬──────────────────┬──────────────────┤
//! │ Flags(1) │  PT(1)   │   Seq(2)   │   Timestamp(4)   │     SSRC(4)      │
//! │   0x80   │   0x78   │   u16 BE   │      u32 BE      │      u32 BE      │
//! ├──────────┴──────────┴────────────┴──────────────────┴──────────────────┤
//! │                       Opus Payload (variable)                          │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Discovery Datagram (70 bytes)
//!
//! ```text
//! probe:  [SSRC u32 BE][66 zero bytes]
//! reply:  [SSRC u32 BE][address ASCII, NUL padded, 64 bytes][port u16 LE]
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// RTP version 2, no padding, no extension, no CSRC
pub const RTP_FLAGS: u8 = 0x80;

/// Dynamic payload type used for Opus
pub const RTP_PAYLOAD_TYPE: u8 = 0x78;

/// RTP header size in bytes
pub const RTP_HEADER_SIZE: usize = 12;

/// Size of both the discovery probe and its reply
pub const DISCOVERY_PACKET_SIZE: usize = 70;

const DISCOVERY_ADDRESS_START: usize = 4;
const DISCOVERY_ADDRESS_END: usize = 68;

/// Maximum length of the address carried in a discovery reply
pub const DISCOVERY_ADDRESS_LEN: usize = DISCOVERY_ADDRESS_END - DISCOVERY_ADDRESS_START;

/// Timestamp ticks per second (100 ns ticks)
pub const TICKS_PER_SECOND: u64 = 10_000_000;

/// Right shift applied to elapsed ticks; one timestamp unit is 400 ns
pub const TIMESTAMP_SHIFT: u32 = 2;

/// Sequence number following `sequence`, wrapping at 2^16
pub fn next_sequence(sequence: u16) -> u16 {
    sequence.wrapping_add(1)
}

/// Quantize elapsed ticks to the 32-bit RTP timestamp
pub fn quantize_timestamp(ticks: u64) -> u32 {
    (ticks >> TIMESTAMP_SHIFT) as u32
}

/// Encode the fixed RTP header
pub fn rtp_header(ssrc: u32, sequence: u16, timestamp_ticks: u64) -> [u8; RTP_HEADER_SIZE] {
    let mut header = [0u8; RTP_HEADER_SIZE];
    header[0] = RTP_FLAGS;
    header[1] = RTP_PAYLOAD_TYPE;
    header[2..4].copy_from_slice(&sequence.to_be_bytes());
    header[4..8].copy_from_slice(&quantize_timestamp(timestamp_ticks).to_be_bytes());
    header[8..12].copy_from_slice(&ssrc.to_be_bytes());
    header
}

/// Build an outbound audio datagram around an encoded frame
pub fn build_audio_packet(ssrc: u32, sequence: u16, timestamp_ticks: u64, frame: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(RTP_HEADER_SIZE + frame.len());
    buf.put_slice(&rtp_header(ssrc, sequence, timestamp_ticks));
    buf.put_slice(frame);
    buf.freeze()
}

/// RTP packet as seen on the wire
#[derive(Debug, Clone)]
pub struct RtpPacket {
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
    payload: Bytes,
}

impl RtpPacket {
    /// Parse a datagram produced by [`build_audio_packet`]
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < RTP_HEADER_SIZE {
            return Err(Error::ProtocolViolation(format!(
                "RTP packet too short: expected >= {}, got {}",
                RTP_HEADER_SIZE,
                data.len()
            )));
        }
        if data[0] != RTP_FLAGS {
            return Err(Error::ProtocolViolation(format!(
                "unexpected RTP flags {:#04x}",
                data[0]
            )));
        }
        if data[1] != RTP_PAYLOAD_TYPE {
            return Err(Error::ProtocolViolation(format!(
                "unexpected RTP payload type {:#04x}",
                data[1]
            )));
        }

        Ok(Self {
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            payload: Bytes::copy_from_slice(&data[RTP_HEADER_SIZE..]),
        })
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Get packet size including header
    pub fn total_size(&self) -> usize {
        RTP_HEADER_SIZE + self.payload.len()
    }
}

/// Build the IP discovery probe for `ssrc`
pub fn build_discovery_probe(ssrc: u32) -> Bytes {
    let mut buf = BytesMut::zeroed(DISCOVERY_PACKET_SIZE);
    buf[0..4].copy_from_slice(&ssrc.to_be_bytes());
    buf.freeze()
}

/// Externally visible address reported by the voice server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryReply {
    pub address: String,
    pub port: u16,
}

/// Parse the voice server's answer to a discovery probe
pub fn parse_discovery_reply(data: &[u8]) -> Result<DiscoveryReply> {
    if data.len() != DISCOVERY_PACKET_SIZE {
        return Err(Error::ProtocolViolation(format!(
            "unexpected discovery reply length: expected {}, got {}",
            DISCOVERY_PACKET_SIZE,
            data.len()
        )));
    }

    let raw = &data[DISCOVERY_ADDRESS_START..DISCOVERY_ADDRESS_END];
    if !raw.is_ascii() {
        return Err(Error::ProtocolViolation(
            "discovery reply address is not ASCII".to_string(),
        ));
    }

    let address = String::from_utf8_lossy(raw).trim_end_matches('\0').to_string();
    let port = u16::from_le_bytes([data[68], data[69]]);

    Ok(DiscoveryReply { address, port })
}

/// Build a discovery reply, as the voice server does
pub fn build_discovery_reply(ssrc: u32, address: &str, port: u16) -> Result<Bytes> {
    if !address.is_ascii() || address.len() > DISCOVERY_ADDRESS_LEN {
        return Err(Error::ProtocolViolation(format!(
            "address {:?} does not fit a discovery reply",
            address
        )));
    }

    let mut buf = BytesMut::zeroed(DISCOVERY_PACKET_SIZE);
    buf[0..4].copy_from_slice(&ssrc.to_be_bytes());
    buf[DISCOVERY_ADDRESS_START..DISCOVERY_ADDRESS_START + address.len()]
        .copy_from_slice(address.as_bytes());
    buf[68..70].copy_from_slice(&port.to_le_bytes());
    Ok(buf.freeze())
}
