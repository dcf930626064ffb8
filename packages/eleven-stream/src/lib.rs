//! Streaming ElevenLabs text-to-speech for agent hosts.
//!
//! The crate exposes a `stream_tts` service that yields audio chunks as the
//! vendor produces them, and a `speak` command that forwards those chunks to
//! the host's real-time audio output (and optionally to local speakers).
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use eleven_stream::{HostRegistry, StreamConfig, plugin};
//!
//! #[tokio::main]
//! async fn main() -> eleven_stream::Result<()> {
//!     eleven_stream::init_tracing();
//!
//!     let host = HostRegistry::new();
//!     plugin::register(&host, StreamConfig::from_env())?;
//!
//!     let reply = host
//!         .invoke("speak", serde_json::json!({"text": "Hello there"}), Some("ada"))
//!         .await
//!         .map_err(|e| eleven_stream::Error::Host(e.to_string()))?;
//!     println!("{reply}");
//!     Ok(())
//! }
//! ```

mod client;
pub mod command;
pub mod config;
mod endpoints;
mod error;
pub mod format;
pub mod host;
pub mod playback;
pub mod plugin;
pub mod stream;

pub use client::{ClientConfig, ElevenLabsClient};
pub use command::{SPEAK_COMMAND, SpeakCommand, SpeakOutcome};
pub use config::StreamConfig;
pub use endpoints::tts::VoiceSettings;
pub use error::{Error, ErrorKind, Result};
pub use format::{Encoding, OutputFormat};
pub use host::{AudioOutput, Command, CommandContext, HostError, HostRegistry, PersonaDirectory};
pub use playback::{LocalPlayer, PlaybackSink, local_player};
pub use stream::{AudioStream, SpeechRequest, SpeechTransport, Streamer, TtsService};

/// Install a `tracing` subscriber filtered by `RUST_LOG`, defaulting to info for this crate.
///
/// Does nothing if the process already has a global subscriber.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = "eleven_stream=info".parse() {
        filter = filter.add_directive(directive);
    }

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}
