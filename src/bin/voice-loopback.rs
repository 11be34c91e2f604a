//! Voice Loopback Demo
//!
//! Starts the in-process voice server, connects to it, logs in and streams a
//! generated tone through Opus until the duration elapses or Ctrl+C.
//!
//! Usage: voice-loopback [seconds] [config.toml]

use anyhow::{Context, Result};
use std::f32::consts::TAU;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_transport::{
    codec::OpusEncoder,
    config::AppConfig,
    loopback::{LoopbackOptions, LoopbackServer},
    signaling::memory_pair,
    SessionIdentity, VoiceConnection,
};

/// Test tone frequency
const TONE_HZ: f32 = 440.0;

/// Sine generator producing interleaved frames
struct Tone {
    phase: f32,
    step: f32,
    channels: usize,
}

impl Tone {
    fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            phase: 0.0,
            step: TAU * TONE_HZ / sample_rate as f32,
            channels: channels as usize,
        }
    }

    fn fill(&mut self, frame: &mut [i16]) {
        for chunk in frame.chunks_mut(self.channels) {
            let value = (self.phase.sin() * 0.25 * i16::MAX as f32) as i16;
            chunk.fill(value);
            self.phase = (self.phase + self.step) % TAU;
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<AppConfig> {
    let path = path.or_else(AppConfig::default_path);
    match path {
        Some(path) if path.exists() => {
            tracing::info!("Loading config from {}", path.display());
            AppConfig::load(&path).with_context(|| format!("reading {}", path.display()))
        }
        _ => Ok(AppConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting voice loopback demo");

    let mut args = std::env::args().skip(1);
    let seconds: u64 = match args.next() {
        Some(arg) => arg.parse().context("duration must be a whole number of seconds")?,
        None => 5,
    };
    let config = load_config(args.next().map(PathBuf::from))?;

    // Server side of the session
    let (client, peer) = memory_pair();
    let server = LoopbackServer::start(peer, LoopbackOptions::default()).await?;

    // Client side
    let encoder = OpusEncoder::new(config.encoder.clone())?;
    let frame_duration = Duration::from_millis(encoder.frame_duration_ms() as u64);
    let connection =
        VoiceConnection::connect(config.clone(), "127.0.0.1", Arc::new(client), Box::new(encoder))
            .await?;

    connection
        .login(SessionIdentity {
            server_id: "loopback".to_string(),
            user_id: "demo".to_string(),
            session_id: format!("demo-{}", std::process::id()),
            token: "loopback-token".to_string(),
        })
        .await
        .context("login to loopback voice server")?;

    let session = connection.session();
    if let Some(external) = session.external_address() {
        tracing::info!(
            "Connected: ssrc {}, external address {}:{}",
            session.ssrc().unwrap_or_default(),
            external.address,
            external.port
        );
    }

    // Stream the tone
    let mut tone = Tone::new(config.encoder.sample_rate, config.encoder.channels);
    let mut frame = vec![0i16; connection.samples_per_frame()];
    let mut ticker = tokio::time::interval(frame_duration);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);

    tracing::info!("Streaming {}Hz tone for {}s (Ctrl+C to stop)", TONE_HZ, seconds);
    let mut frames = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            _ = &mut deadline => break,
            failure = connection.closed() => {
                if let Some(failure) = failure {
                    tracing::error!("Session ended: {}", failure);
                }
                break;
            }
            _ = ticker.tick() => {
                tone.fill(&mut frame);
                connection.send_pcm(&frame)?;
                frames += 1;
            }
        }
    }

    // Let the send loop flush the last frames
    tokio::time::sleep(config.voice.send_interval() * 2).await;

    println!("\n=== Session Statistics ===");
    println!("  Frames encoded:     {}", frames);
    if let Some(stats) = connection.stats() {
        println!("  Datagrams sent:     {}", stats.datagrams_sent);
        println!("  Bytes sent:         {}", stats.bytes_sent);
        println!("  Datagrams received: {}", stats.datagrams_received);
        println!("  Ignored payloads:   {}", stats.ignored_payloads);
    }
    let server_stats = server.stats();
    println!("  Server packets:     {}", server_stats.audio_packets);
    println!("  Server bytes:       {}", server_stats.audio_bytes);
    println!("  Sequence gaps:      {}", server_stats.sequence_gaps);
    println!("  Keep-alives:        {}", server_stats.keepalives);
    println!();

    connection.disconnect();
    if let Some(failure) = connection.closed().await {
        tracing::warn!("Session closed with error: {}", failure);
    }
    server.shutdown().await;

    tracing::info!("Voice loopback demo finished");
    Ok(())
}
