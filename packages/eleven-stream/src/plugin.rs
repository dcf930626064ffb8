//! Wiring into a host: the `stream_tts` service and the `speak` command.

use std::sync::Arc;

use tracing::{debug, info};

use crate::command::SpeakCommand;
use crate::config::StreamConfig;
use crate::error::Result;
use crate::host::HostRegistry;
use crate::playback::{PlaybackSink, local_player};
use crate::stream::{SpeechTransport, Streamer, TtsService};

/// Service name the streaming client is registered under.
pub const STREAM_TTS_SERVICE: &str = "stream_tts";

/// Build the HTTP client from `config` and register everything with `host`.
pub fn register(host: &HostRegistry, config: StreamConfig) -> Result<Arc<Streamer>> {
    if config.api_key.is_none() {
        // Registration still succeeds; every call fails with AuthenticationError.
        info!("No ElevenLabs API key configured");
    }

    let streamer = Arc::new(Streamer::from_config(Arc::new(config))?);
    let playback = streamer
        .config()
        .local_playback
        .then(|| local_player() as Arc<dyn PlaybackSink>);

    register_with(host, streamer.clone(), playback);
    Ok(streamer)
}

/// Register an already-built streamer, with `playback` as the local sink if any.
///
/// `playback` is ignored unless the streamer's config enables local playback.
pub fn register_with<T>(
    host: &HostRegistry,
    streamer: Arc<Streamer<T>>,
    playback: Option<Arc<dyn PlaybackSink>>,
) where
    T: SpeechTransport + 'static,
{
    let realtime_pacing = streamer.config().realtime_pacing;
    let playback = match playback {
        Some(_) if !streamer.config().local_playback => {
            debug!("Local playback disabled, ignoring playback sink");
            None
        }
        playback => playback,
    };
    let service: Arc<dyn TtsService> = streamer;

    host.register_service(STREAM_TTS_SERVICE, service.clone());
    host.register_command(Arc::new(
        SpeakCommand::new(service, playback).with_realtime_pacing(realtime_pacing),
    ));
    info!("ElevenLabs streaming TTS registered");
}
