//! The `speak` command: drives a TTS stream into the host audio channel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::format::OutputFormat;
use crate::host::{AudioOutput, Command, CommandContext};
use crate::playback::{PlaybackSession, PlaybackSink};
use crate::stream::{AudioStream, TtsService, clip};

pub const SPEAK_COMMAND: &str = "speak";

/// Fraction of a chunk's playback time to wait before sending the next one.
const PACING_FACTOR: f64 = 0.98;

/// Fewer chunks than this before a stop request means the agent was cut off.
const EARLY_INTERRUPT_CHUNKS: usize = 3;

#[derive(Debug, Deserialize)]
struct SpeakArgs {
    text: String,
    #[serde(default)]
    voice_id: Option<String>,
}

/// How a `speak` invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakOutcome {
    pub characters: usize,
    pub chunks: usize,
    pub bytes: usize,
    pub format: OutputFormat,
    pub played_locally: bool,
    /// The host audio channel asked to stop before the stream ended.
    pub interrupted: bool,
}

impl fmt::Display for SpeakOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.interrupted {
            if self.chunks < EARLY_INTERRUPT_CHUNKS {
                f.write_str("SYSTEM: WARNING - Command interrupted! ")?;
            }
            return write!(
                f,
                "Speech stopped by the audio output after {} audio chunks ({} bytes)",
                self.chunks, self.bytes
            );
        }
        write!(
            f,
            "Speech streaming completed: {} characters, {} audio chunks, {} bytes",
            self.characters, self.chunks, self.bytes
        )?;
        if self.played_locally {
            f.write_str(" (also played locally)")?;
        }
        Ok(())
    }
}

pub struct SpeakCommand {
    tts: Arc<dyn TtsService>,
    playback: Option<Arc<dyn PlaybackSink>>,
    realtime_pacing: bool,
}

impl SpeakCommand {
    /// `playback` is the local sink, present only when local playback is enabled.
    pub fn new(tts: Arc<dyn TtsService>, playback: Option<Arc<dyn PlaybackSink>>) -> Self {
        Self {
            tts,
            playback,
            realtime_pacing: false,
        }
    }

    pub fn with_realtime_pacing(mut self, enabled: bool) -> Self {
        self.realtime_pacing = enabled;
        self
    }

    pub async fn speak(&self, args: Value, ctx: &CommandContext) -> Result<SpeakOutcome> {
        let args: SpeakArgs = serde_json::from_value(args)
            .map_err(|e| Error::InvalidRequest(format!("bad speak arguments: {e}")))?;

        let voice_id = match args.voice_id.filter(|v| !v.trim().is_empty()) {
            Some(voice_id) => Some(voice_id),
            None => self.persona_voice(ctx).await,
        };

        let output = ctx.audio_output.clone();
        if output.is_none() && self.playback.is_none() {
            return Err(Error::Host(
                "no audio output channel registered and local playback is disabled".into(),
            ));
        }
        if output.is_none() {
            debug!("No host audio output registered, playing locally only");
        }

        let mut stream = self
            .tts
            .stream_tts(&args.text, voice_id.as_deref(), None, None)
            .await?;
        let format = stream.format();

        let mut playback = self
            .playback
            .as_deref()
            .map(|sink| PlaybackSession::begin(sink, format));

        let mut outcome = SpeakOutcome {
            characters: args.text.chars().count(),
            chunks: 0,
            bytes: 0,
            format,
            played_locally: false,
            interrupted: false,
        };

        let forwarded = self
            .forward(&mut stream, output.as_deref(), playback.as_mut(), &mut outcome)
            .await;
        // Close the upstream call before local playback starts.
        drop(stream);

        if let Err(e) = forwarded {
            // Never play a truncated utterance.
            if let Some(session) = playback {
                session.abort();
            }
            return Err(e);
        }

        outcome.played_locally = playback.as_ref().is_some_and(|s| s.is_active());
        drop(playback);

        info!(
            characters = outcome.characters,
            chunks = outcome.chunks,
            bytes = outcome.bytes,
            interrupted = outcome.interrupted,
            text = %clip(&args.text, 50),
            "Speech streaming finished"
        );
        Ok(outcome)
    }

    async fn forward(
        &self,
        stream: &mut AudioStream,
        output: Option<&dyn AudioOutput>,
        mut playback: Option<&mut PlaybackSession<'_>>,
        outcome: &mut SpeakOutcome,
    ) -> Result<()> {
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            outcome.chunks += 1;
            outcome.bytes += chunk.len();

            let keep_going = match output {
                Some(output) => output.send_chunk(chunk.clone()).await?,
                None => true,
            };

            if let Some(session) = playback.as_deref_mut() {
                session.push(chunk.clone());
            }

            if output.is_some() {
                self.pace(outcome.format, chunk.len()).await;
            }

            if !keep_going {
                debug!(chunks = outcome.chunks, "Audio output requested to stop streaming");
                outcome.interrupted = true;
                break;
            }
        }
        Ok(())
    }

    async fn persona_voice(&self, ctx: &CommandContext) -> Option<String> {
        let (Some(personas), Some(agent)) = (&ctx.personas, &ctx.agent_name) else {
            return None;
        };
        let voice_id = personas.voice_id(agent).await;
        if voice_id.is_none() {
            warn!(agent = %agent, "Could not get agent persona voice_id, using default");
        }
        voice_id
    }

    async fn pace(&self, format: OutputFormat, len: usize) {
        if !self.realtime_pacing {
            return;
        }
        let Some(rate) = format.byte_rate() else {
            return;
        };
        let seconds = len as f64 / f64::from(rate) * PACING_FACTOR;
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
    }
}

#[async_trait]
impl Command for SpeakCommand {
    fn name(&self) -> &str {
        SPEAK_COMMAND
    }

    fn description(&self) -> &str {
        "Convert text to speech using ElevenLabs streaming TTS and send the audio to the active call."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": {"type": "string", "description": "Text to convert to speech"},
                "voice_id": {"type": "string", "description": "ElevenLabs voice ID"}
            },
            "required": ["text"]
        })
    }

    async fn call(&self, args: Value, ctx: &CommandContext) -> String {
        match self.speak(args, ctx).await {
            Ok(outcome) => outcome.to_string(),
            Err(e) => {
                error!(kind = %e.kind(), error = %e, "Error in speak command");
                format!("{}: {e}", e.kind())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::host::PersonaDirectory;
    use crate::playback::tests::RecordingSink;
    use crate::stream::Streamer;
    use crate::stream::tests::{ScriptedTransport, test_config};
    use bytes::Bytes;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingOutput {
        chunks: Mutex<Vec<Bytes>>,
        stop_after: Option<usize>,
        fail: bool,
    }

    #[async_trait]
    impl AudioOutput for RecordingOutput {
        async fn send_chunk(&self, chunk: Bytes) -> Result<bool> {
            if self.fail {
                return Err(Error::Host("SIP session closed".into()));
            }
            let mut chunks = self.chunks.lock();
            chunks.push(chunk);
            Ok(self.stop_after.is_none_or(|limit| chunks.len() < limit))
        }
    }

    struct FixedPersona(&'static str);

    #[async_trait]
    impl PersonaDirectory for FixedPersona {
        async fn voice_id(&self, _agent_name: &str) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    fn streamer(transport: ScriptedTransport, config: Arc<StreamConfig>) -> Arc<Streamer<ScriptedTransport>> {
        Arc::new(Streamer::new(transport, config))
    }

    fn local_config() -> Arc<StreamConfig> {
        Arc::new(StreamConfig {
            local_playback: true,
            ..(*test_config()).clone()
        })
    }

    fn ctx(output: &Arc<RecordingOutput>) -> CommandContext {
        CommandContext::default().with_audio_output(output.clone())
    }

    #[tokio::test]
    async fn forwards_every_chunk_in_order() {
        let tts = streamer(ScriptedTransport::chunks(&[b"aa", b"bbb", b"c"]), test_config());
        let output = Arc::new(RecordingOutput::default());
        let command = SpeakCommand::new(tts, None);

        let status = command.call(json!({"text": "Hello"}), &ctx(&output)).await;

        assert_eq!(
            status,
            "Speech streaming completed: 5 characters, 3 audio chunks, 6 bytes"
        );
        let seen = output.chunks.lock().clone();
        assert_eq!(
            seen,
            vec![
                Bytes::from_static(b"aa"),
                Bytes::from_static(b"bbb"),
                Bytes::from_static(b"c"),
            ]
        );
    }

    #[tokio::test]
    async fn playback_receives_the_same_chunks() {
        let tts = streamer(ScriptedTransport::chunks(&[b"aa", b"bbb"]), local_config());
        let output = Arc::new(RecordingOutput::default());
        let sink = Arc::new(RecordingSink::default());
        let command = SpeakCommand::new(tts, Some(sink.clone()));

        let status = command.call(json!({"text": "Hi"}), &ctx(&output)).await;

        assert!(status.ends_with("(also played locally)"), "{status}");
        assert_eq!(output.chunks.lock().len(), 2);
        assert_eq!(
            *sink.events.lock(),
            vec!["begin mp3_44100_128", "push 7 2", "push 7 3", "finish 7"]
        );
    }

    #[tokio::test]
    async fn playback_failure_does_not_abort_forwarding() {
        let tts = streamer(ScriptedTransport::chunks(&[b"aa", b"bb", b"cc"]), local_config());
        let output = Arc::new(RecordingOutput::default());
        let sink = Arc::new(RecordingSink {
            fail_push: true,
            ..Default::default()
        });
        let command = SpeakCommand::new(tts, Some(sink));

        let outcome = command.speak(json!({"text": "Hi"}), &ctx(&output)).await.unwrap();
        assert_eq!(outcome.chunks, 3);
        assert!(!outcome.played_locally);
        assert_eq!(output.chunks.lock().len(), 3);
    }

    #[tokio::test]
    async fn stream_error_becomes_failed_status() {
        let tts = streamer(
            ScriptedTransport::failing_after(&[b"aa"], "connection reset by peer"),
            test_config(),
        );
        let output = Arc::new(RecordingOutput::default());
        let command = SpeakCommand::new(tts, None);

        let status = command.call(json!({"text": "Hello"}), &ctx(&output)).await;
        assert!(status.starts_with("TransportError:"), "{status}");
        assert!(status.contains("connection reset by peer"));
        assert_eq!(output.chunks.lock().len(), 1);
    }

    #[tokio::test]
    async fn stream_error_discards_local_playback() {
        let tts = streamer(
            ScriptedTransport::failing_after(&[b"half"], "connection reset by peer"),
            local_config(),
        );
        let output = Arc::new(RecordingOutput::default());
        let sink = Arc::new(RecordingSink::default());
        let command = SpeakCommand::new(tts, Some(sink.clone()));

        let status = command.call(json!({"text": "Hello"}), &ctx(&output)).await;
        assert!(status.starts_with("TransportError:"), "{status}");
        assert_eq!(
            *sink.events.lock(),
            vec!["begin mp3_44100_128", "push 7 4", "abort 7"]
        );
    }

    #[tokio::test]
    async fn failing_audio_output_discards_local_playback() {
        let tts = streamer(ScriptedTransport::chunks(&[b"1", b"2"]), local_config());
        let output = Arc::new(RecordingOutput {
            fail: true,
            ..Default::default()
        });
        let sink = Arc::new(RecordingSink::default());
        let command = SpeakCommand::new(tts, Some(sink.clone()));

        let status = command.call(json!({"text": "Hello"}), &ctx(&output)).await;
        assert!(status.starts_with("HostError:"), "{status}");
        assert_eq!(*sink.events.lock(), vec!["begin mp3_44100_128", "abort 7"]);
    }

    #[tokio::test]
    async fn missing_text_is_invalid_request() {
        let tts = streamer(ScriptedTransport::chunks(&[b"aa"]), test_config());
        let output = Arc::new(RecordingOutput::default());
        let command = SpeakCommand::new(tts, None);

        for args in [json!({}), json!({"text": 5}), json!({"text": "  "})] {
            let status = command.call(args, &ctx(&output)).await;
            assert!(status.starts_with("InvalidRequest:"), "{status}");
        }
        assert!(output.chunks.lock().is_empty());
    }

    #[tokio::test]
    async fn stop_request_interrupts_the_stream() {
        let tts = streamer(ScriptedTransport::chunks(&[b"1", b"2", b"3", b"4"]), test_config());
        let output = Arc::new(RecordingOutput {
            stop_after: Some(2),
            ..Default::default()
        });
        let command = SpeakCommand::new(tts, None);

        let outcome = command.speak(json!({"text": "Hello"}), &ctx(&output)).await.unwrap();
        assert!(outcome.interrupted);
        assert_eq!(outcome.chunks, 2);
        assert_eq!(output.chunks.lock().len(), 2);
        assert!(outcome.to_string().starts_with("SYSTEM: WARNING - Command interrupted!"));
    }

    #[tokio::test]
    async fn failing_audio_output_aborts() {
        let tts = streamer(ScriptedTransport::chunks(&[b"1", b"2"]), test_config());
        let output = Arc::new(RecordingOutput {
            fail: true,
            ..Default::default()
        });
        let command = SpeakCommand::new(tts, None);

        let status = command.call(json!({"text": "Hello"}), &ctx(&output)).await;
        assert!(status.starts_with("HostError:"), "{status}");
    }

    #[tokio::test]
    async fn no_output_and_no_playback_fails_before_streaming() {
        let transport = Arc::new(ScriptedTransport::chunks(&[b"1"]));
        let tts = Arc::new(Streamer::new(transport.clone(), test_config()));
        let command = SpeakCommand::new(tts, None);

        let status = command.call(json!({"text": "Hello"}), &CommandContext::default()).await;
        assert!(status.starts_with("HostError:"), "{status}");
        assert_eq!(transport.opened(), 0);
    }

    #[tokio::test]
    async fn voice_precedence() {
        let transport = Arc::new(ScriptedTransport::chunks(&[b"1"]));
        let tts = Arc::new(Streamer::new(transport.clone(), test_config()));
        let output = Arc::new(RecordingOutput::default());
        let command = SpeakCommand::new(tts, None);

        let mut persona_ctx = ctx(&output).with_agent("ada");
        persona_ctx.personas = Some(Arc::new(FixedPersona("persona-voice")));

        command.speak(json!({"text": "a", "voice_id": "explicit"}), &persona_ctx).await.unwrap();
        command.speak(json!({"text": "b"}), &persona_ctx).await.unwrap();
        command.speak(json!({"text": "c"}), &ctx(&output)).await.unwrap();

        let voices: Vec<String> = transport
            .requests
            .lock()
            .iter()
            .map(|r| r.voice_id.clone())
            .collect();
        assert_eq!(
            voices,
            vec!["explicit", "persona-voice", crate::config::DEFAULT_VOICE_ID]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_waits_for_telephony_playback_time() {
        // 4000 bytes of ulaw is half a second of audio.
        static HALF_SECOND: [u8; 4000] = [0x7f; 4000];
        let tts = streamer(
            ScriptedTransport::chunks(&[&HALF_SECOND, &HALF_SECOND]),
            test_config(),
        );
        let output = Arc::new(RecordingOutput::default());
        let command = SpeakCommand::new(tts, None).with_realtime_pacing(true);

        let started = tokio::time::Instant::now();
        let outcome = command.speak(json!({"text": "Hello"}), &ctx(&output)).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(outcome.format, OutputFormat::MuLaw8000Hz);
        assert!(elapsed >= Duration::from_millis(970), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1100), "{elapsed:?}");
    }
}
