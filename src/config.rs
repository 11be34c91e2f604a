//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::*;
use crate::crypto::TransportMode;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Voice session configuration
    pub voice: VoiceConfig,

    /// Datagram socket configuration
    pub network: NetworkConfig,

    /// Audio encoder configuration
    pub encoder: EncoderConfig,
}

/// Voice session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// How long `login` waits for the server to describe the session
    pub login_timeout_ms: u64,

    /// Send queue flush interval
    pub send_interval_ms: u64,

    /// Acceptable transport modes, most preferred first
    pub preferred_modes: Vec<TransportMode>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            login_timeout_ms: DEFAULT_LOGIN_TIMEOUT_MS,
            send_interval_ms: DEFAULT_SEND_INTERVAL_MS,
            preferred_modes: vec![TransportMode::Plain],
        }
    }
}

impl VoiceConfig {
    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms.max(1))
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local bind address for the voice socket
    pub bind_address: String,

    /// Socket send buffer size
    pub send_buffer_size: usize,

    /// Socket receive buffer size
    pub recv_buffer_size: usize,

    /// Enable SO_REUSEADDR
    pub reuse_addr: bool,

    /// Read buffer length for a single datagram
    pub max_datagram_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            send_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
            recv_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
            reuse_addr: false,
            max_datagram_size: MAX_DATAGRAM_SIZE,
        }
    }
}

/// Opus encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Sample rate (8000, 12000, 16000, 24000 or 48000)
    pub sample_rate: u32,

    /// Number of channels (1 or 2)
    pub channels: u16,

    /// Application type
    pub application: EncoderApplication,

    /// Frame size in milliseconds
    pub frame_size_ms: u32,

    /// Bitrate in bits per second, encoder default when unset
    pub bitrate: Option<i32>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            application: EncoderApplication::Voip,
            frame_size_ms: DEFAULT_FRAME_SIZE_MS,
            bitrate: None,
        }
    }
}

impl EncoderConfig {
    /// Samples per channel in one frame
    pub fn frame_size(&self) -> usize {
        (self.sample_rate * self.frame_size_ms / 1000) as usize
    }

    /// Interleaved samples in one frame
    pub fn samples_per_frame(&self) -> usize {
        self.frame_size() * self.channels as usize
    }
}

/// Opus application hint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EncoderApplication {
    /// Speech intelligibility
    Voip,
    /// General audio fidelity
    Audio,
    /// Minimal algorithmic delay
    LowDelay,
}

impl AppConfig {
    /// Load configuration from file
    pub fn load(path: &PathBuf) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &PathBuf) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "voice-transport", "voice-transport")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
