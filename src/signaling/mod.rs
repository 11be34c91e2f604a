//! Signaling (control-plane) side of a voice session

pub mod channel;
pub mod messages;

pub use channel::{memory_pair, MemoryPeer, MemorySignaling, SignalingChannel};
pub use messages::{ControlEvent, OutboundMessage};
