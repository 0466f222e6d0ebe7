//! Command-line configuration for the client and relay binaries.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Live microphone and screen mirror client.
#[derive(Parser, Debug)]
#[command(name = "mirrorlive", version, about)]
pub struct ClientArgs {
    /// WebSocket URL of the relay
    #[arg(long, default_value = "ws://127.0.0.1:9083")]
    pub url: String,

    /// PulseAudio source name; uses the server default source when omitted
    #[arg(long)]
    pub audio_device: Option<String>,

    /// Disable periodic screen snapshots
    #[arg(long)]
    pub no_screen: bool,

    /// Write per-session WAV recordings under this directory
    #[arg(long, value_name = "DIR")]
    pub record: Option<PathBuf>,
}

/// Relay between mirror clients and the Gemini Live API.
#[derive(Parser, Debug)]
#[command(name = "mirrorlive-relay", version, about)]
pub struct RelayArgs {
    /// Address to listen on for client connections
    #[arg(long, default_value = "127.0.0.1:9083")]
    pub listen: String,

    /// Gemini API key; falls back to the GEMINI_API_KEY environment variable
    #[arg(long)]
    pub api_key: Option<String>,

    /// Model to run sessions against
    #[arg(long, default_value = "gemini-2.0-flash-exp")]
    pub model: String,

    /// System instruction applied to every session
    #[arg(long)]
    pub system_instruction: Option<String>,
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the default `info` level.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
