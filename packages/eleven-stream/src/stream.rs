//! Streaming client: turns one speech request into a lazy sequence of audio chunks.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_stream::stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use crate::client::ElevenLabsClient;
use crate::config::StreamConfig;
use crate::endpoints::tts::VoiceSettings;
use crate::error::{Error, Result};
use crate::format::OutputFormat;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Parameters of one synthesis call, fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechRequest {
    pub text: String,
    pub voice_id: String,
    pub model_id: String,
    pub output_format: OutputFormat,
    pub voice_settings: VoiceSettings,
}

/// Opens the vendor stream for a request.
///
/// Implementations make exactly one upstream call per `open` and never retry.
#[async_trait]
pub trait SpeechTransport: Send + Sync {
    async fn open(&self, request: &SpeechRequest) -> Result<ChunkStream>;
}

#[async_trait]
impl<T: SpeechTransport + ?Sized> SpeechTransport for Arc<T> {
    async fn open(&self, request: &SpeechRequest) -> Result<ChunkStream> {
        (**self).open(request).await
    }
}

/// The `stream_tts` service as the host sees it.
#[async_trait]
pub trait TtsService: Send + Sync {
    async fn stream_tts(
        &self,
        text: &str,
        voice_id: Option<&str>,
        model_id: Option<&str>,
        output_format: Option<&str>,
    ) -> Result<AudioStream>;
}

pub struct Streamer<T = ElevenLabsClient> {
    transport: T,
    config: Arc<StreamConfig>,
}

impl Streamer<ElevenLabsClient> {
    pub fn from_config(config: Arc<StreamConfig>) -> Result<Self> {
        let client = ElevenLabsClient::from_config(&config)?;
        Ok(Self::new(client, config))
    }
}

impl<T: SpeechTransport> Streamer<T> {
    pub fn new(transport: T, config: Arc<StreamConfig>) -> Self {
        if config.local_playback {
            info!("Local audio playback enabled (MR_TTS_PLAY_LOCAL)");
        }
        Self { transport, config }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Resolve optional arguments against the configured defaults.
    ///
    /// Fails with [`Error::InvalidRequest`] on blank text or an unknown format.
    pub fn resolve(
        &self,
        text: &str,
        voice_id: Option<&str>,
        model_id: Option<&str>,
        output_format: Option<&str>,
    ) -> Result<SpeechRequest> {
        if text.trim().is_empty() {
            return Err(Error::InvalidRequest("text must not be empty".into()));
        }

        let config = &self.config;
        let voice_id = non_blank(voice_id).unwrap_or(&config.default_voice_id);
        let model_id = non_blank(model_id).unwrap_or(&config.default_model_id);
        let mut output_format = match non_blank(output_format) {
            Some(name) => OutputFormat::parse(name)?,
            None => config.default_output_format,
        };

        // Local players cannot decode the telephony encoding, and one upstream
        // stream feeds both destinations, so the whole request switches.
        if config.local_playback && output_format.is_telephony() {
            debug!(
                requested = %output_format,
                substitute = %config.local_playback_format,
                "Substituting playable format for local playback"
            );
            output_format = config.local_playback_format;
        }

        Ok(SpeechRequest {
            text: text.to_string(),
            voice_id: voice_id.to_string(),
            model_id: model_id.to_string(),
            output_format,
            voice_settings: VoiceSettings {
                stability: config.stability,
                similarity_boost: config.similarity_boost,
                speed: config.speed,
            },
        })
    }

    pub async fn stream_tts(
        &self,
        text: &str,
        voice_id: Option<&str>,
        model_id: Option<&str>,
        output_format: Option<&str>,
    ) -> Result<AudioStream> {
        let request = self.resolve(text, voice_id, model_id, output_format)?;
        self.stream_request(request).await
    }

    /// Open the upstream call and hand back its chunks as they arrive.
    pub async fn stream_request(&self, request: SpeechRequest) -> Result<AudioStream> {
        info!(
            voice_id = %request.voice_id,
            output_format = %request.output_format,
            text = %clip(&request.text, 50),
            "Starting TTS stream"
        );

        let body = self.transport.open(&request).await.inspect_err(|e| {
            error!(error = %e, "Error opening TTS stream");
        })?;

        Ok(AudioStream::new(body, request))
    }
}

#[async_trait]
impl<T: SpeechTransport> TtsService for Streamer<T> {
    async fn stream_tts(
        &self,
        text: &str,
        voice_id: Option<&str>,
        model_id: Option<&str>,
        output_format: Option<&str>,
    ) -> Result<AudioStream> {
        Streamer::stream_tts(self, text, voice_id, model_id, output_format).await
    }
}

/// Live, single-pass iteration over one response.
///
/// Yields every read in network order, empty ones included. Ends after the
/// first error and closes the upstream call when dropped.
pub struct AudioStream {
    inner: ChunkStream,
    request: SpeechRequest,
}

impl AudioStream {
    fn new(body: ChunkStream, request: SpeechRequest) -> Self {
        let inner = stream! {
            let mut body = body;
            let mut chunks = 0usize;
            let mut bytes = 0usize;

            while let Some(item) = body.next().await {
                match item {
                    Ok(chunk) => {
                        chunks += 1;
                        bytes += chunk.len();
                        debug!(chunk = chunks, size = chunk.len(), "Yielding audio chunk");
                        yield Ok(chunk);
                        // Let the host event loop run between chunks.
                        tokio::task::yield_now().await;
                    }
                    Err(e) => {
                        error!(error = %e, chunks, bytes, "Error in TTS streaming");
                        yield Err(e);
                        return;
                    }
                }
            }

            info!(chunks, bytes, "TTS streaming completed");
        };

        Self {
            inner: Box::pin(inner),
            request,
        }
    }

    pub fn format(&self) -> OutputFormat {
        self.request.output_format
    }

    pub fn request(&self) -> &SpeechRequest {
        &self.request
    }

    /// Write the stream to a file as it arrives.
    pub async fn save(mut self, path: impl AsRef<std::path::Path>) -> Result<usize> {
        let path = path.as_ref();
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| Error::Host(format!("failed to create {}: {e}", path.display())))?;

        let mut written = 0;
        while let Some(chunk) = self.inner.next().await {
            let data = chunk?;
            file.write_all(&data)
                .await
                .map_err(|e| Error::Host(format!("failed to write {}: {e}", path.display())))?;
            written += data.len();
        }
        file.flush()
            .await
            .map_err(|e| Error::Host(format!("failed to write {}: {e}", path.display())))?;

        Ok(written)
    }
}

impl std::fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioStream")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

impl Stream for AudioStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// At most `max` characters of `text`, for log lines.
pub(crate) fn clip(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures::channel::mpsc;
    use futures_util::{FutureExt, stream};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays a fixed sequence of results per `open`, recording every request.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        script: Vec<std::result::Result<&'static [u8], &'static str>>,
        pub(crate) requests: Mutex<Vec<SpeechRequest>>,
    }

    impl ScriptedTransport {
        pub(crate) fn chunks(chunks: &[&'static [u8]]) -> Self {
            Self {
                script: chunks.iter().map(|c| Ok(*c)).collect(),
                ..Default::default()
            }
        }

        pub(crate) fn failing_after(chunks: &[&'static [u8]], message: &'static str) -> Self {
            let mut script: Vec<_> = chunks.iter().map(|c| Ok(*c)).collect();
            script.push(Err(message));
            Self {
                script,
                ..Default::default()
            }
        }

        pub(crate) fn opened(&self) -> usize {
            self.requests.lock().len()
        }
    }

    #[async_trait]
    impl SpeechTransport for ScriptedTransport {
        async fn open(&self, request: &SpeechRequest) -> Result<ChunkStream> {
            self.requests.lock().push(request.clone());
            let items: Vec<Result<Bytes>> = self
                .script
                .iter()
                .map(|item| match item {
                    Ok(chunk) => Ok(Bytes::from_static(chunk)),
                    Err(message) => Err(Error::Transport(message.to_string())),
                })
                .collect();
            Ok(stream::iter(items).boxed())
        }
    }

    /// Hands out the receiving end of a channel so tests control arrival timing.
    struct ChannelTransport {
        rx: Mutex<Option<mpsc::UnboundedReceiver<Result<Bytes>>>>,
    }

    #[async_trait]
    impl SpeechTransport for ChannelTransport {
        async fn open(&self, _request: &SpeechRequest) -> Result<ChunkStream> {
            let rx = self.rx.lock().take().expect("opened twice");
            Ok(rx.boxed())
        }
    }

    struct AuthRejecting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SpeechTransport for AuthRejecting {
        async fn open(&self, _request: &SpeechRequest) -> Result<ChunkStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Authentication("invalid api key".into()))
        }
    }

    pub(crate) fn test_config() -> Arc<StreamConfig> {
        Arc::new(StreamConfig {
            api_key: Some("test-key".into()),
            realtime_pacing: false,
            ..Default::default()
        })
    }

    async fn collect(stream: AudioStream) -> Vec<Result<Bytes>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn chunks_concatenate_to_the_payload() {
        let streamer = Streamer::new(
            ScriptedTransport::chunks(&[b"RIFF", b"-audio-", b"-tail"]),
            test_config(),
        );
        let stream = streamer.stream_tts("Hello", None, None, None).await.unwrap();
        let chunks: Vec<Bytes> = collect(stream).await.into_iter().map(|c| c.unwrap()).collect();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), b"RIFF-audio--tail".to_vec());
    }

    #[tokio::test]
    async fn blank_text_fails_before_any_call() {
        let streamer = Streamer::new(ScriptedTransport::chunks(&[b"x"]), test_config());

        for text in ["", "   ", "\n\t"] {
            let err = streamer.stream_tts(text, None, None, None).await.err().unwrap();
            assert!(matches!(err, Error::InvalidRequest(_)), "{text:?}: {err}");
        }
        assert_eq!(streamer.transport.opened(), 0);
    }

    #[tokio::test]
    async fn unknown_format_fails_before_any_call() {
        let streamer = Streamer::new(ScriptedTransport::chunks(&[b"x"]), test_config());
        let err = streamer
            .stream_tts("Hello", None, None, Some("wav_1"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(streamer.transport.opened(), 0);
    }

    #[tokio::test]
    async fn explicit_arguments_override_configuration() {
        let streamer = Streamer::new(ScriptedTransport::chunks(&[b"x"]), test_config());
        let request = streamer
            .resolve("Hi", Some("voice-9"), Some("eleven_turbo_v2_5"), Some("pcm_16000"))
            .unwrap();
        assert_eq!(request.voice_id, "voice-9");
        assert_eq!(request.model_id, "eleven_turbo_v2_5");
        assert_eq!(request.output_format, OutputFormat::Pcm16000Hz);

        let defaults = streamer.resolve("Hi", None, Some(" "), None).unwrap();
        assert_eq!(defaults.voice_id, crate::config::DEFAULT_VOICE_ID);
        assert_eq!(defaults.model_id, crate::config::DEFAULT_MODEL_ID);
        assert_eq!(defaults.output_format, OutputFormat::MuLaw8000Hz);
        assert_eq!(defaults.voice_settings.stability, 0.5);
    }

    #[tokio::test]
    async fn local_playback_substitutes_telephony_format() {
        let config = Arc::new(StreamConfig {
            local_playback: true,
            ..(*test_config()).clone()
        });
        let streamer = Streamer::new(ScriptedTransport::chunks(&[b"x"]), config);

        let stream = streamer
            .stream_tts("Hello", None, None, Some("ulaw_8000"))
            .await
            .unwrap();
        assert_eq!(stream.format(), OutputFormat::Mp3_44100Hz128kbps);
        assert_eq!(
            streamer.transport.requests.lock()[0].output_format,
            OutputFormat::Mp3_44100Hz128kbps
        );

        // Already playable formats pass through.
        let pcm = streamer.resolve("Hello", None, None, Some("pcm_24000")).unwrap();
        assert_eq!(pcm.output_format, OutputFormat::Pcm24000Hz);
    }

    #[tokio::test]
    async fn telephony_format_kept_without_local_playback() {
        let streamer = Streamer::new(ScriptedTransport::chunks(&[b"x"]), test_config());
        let request = streamer.resolve("Hello", None, None, Some("ulaw_8000")).unwrap();
        assert_eq!(request.output_format, OutputFormat::MuLaw8000Hz);
    }

    #[tokio::test]
    async fn transport_failure_after_n_chunks_keeps_them() {
        let streamer = Streamer::new(
            ScriptedTransport::failing_after(&[b"one", b"two"], "connection reset"),
            test_config(),
        );
        let items = collect(streamer.stream_tts("Hello", None, None, None).await.unwrap()).await;

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap().as_ref(), b"one");
        assert_eq!(items[1].as_ref().unwrap().as_ref(), b"two");
        match &items[2] {
            Err(Error::Transport(message)) => assert!(message.contains("connection reset")),
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_ends_after_first_error() {
        let transport = ScriptedTransport {
            script: vec![Ok(&b"a"[..]), Err("first"), Ok(&b"b"[..])],
            ..Default::default()
        };
        let streamer = Streamer::new(transport, test_config());
        let items = collect(streamer.stream_tts("Hello", None, None, None).await.unwrap()).await;
        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn open_failure_is_returned_directly() {
        let streamer = Streamer::new(
            AuthRejecting {
                calls: AtomicUsize::new(0),
            },
            test_config(),
        );
        let err = streamer.stream_tts("Hello", None, None, None).await.err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Authentication);
        assert_eq!(streamer.transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn chunks_are_yielded_before_the_response_completes() {
        let (tx, rx) = mpsc::unbounded();
        let streamer = Streamer::new(
            ChannelTransport {
                rx: Mutex::new(Some(rx)),
            },
            test_config(),
        );
        let mut stream = streamer.stream_tts("Hello", None, None, None).await.unwrap();

        tx.unbounded_send(Ok(Bytes::from_static(b"first"))).unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.as_ref(), b"first");

        // Nothing else has arrived, so the stream is pending rather than done.
        assert!(stream.next().now_or_never().is_none());

        tx.unbounded_send(Ok(Bytes::from_static(b"second"))).unwrap();
        drop(tx);
        assert_eq!(stream.next().await.unwrap().unwrap().as_ref(), b"second");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn empty_reads_are_passed_through() {
        let streamer = Streamer::new(ScriptedTransport::chunks(&[b"a", b"", b"b"]), test_config());
        let items = collect(streamer.stream_tts("Hello", None, None, None).await.unwrap()).await;
        let sizes: Vec<usize> = items.into_iter().map(|c| c.unwrap().len()).collect();
        assert_eq!(sizes, vec![1, 0, 1]);
    }

    #[tokio::test]
    async fn concurrent_streams_stay_separate() {
        let left = Streamer::new(ScriptedTransport::chunks(&[b"L1", b"L2", b"L3"]), test_config());
        let right = Streamer::new(ScriptedTransport::chunks(&[b"R1", b"R2"]), test_config());

        let (a, b) = tokio::join!(
            async { collect(left.stream_tts("left", None, None, None).await.unwrap()).await },
            async { collect(right.stream_tts("right", None, None, None).await.unwrap()).await },
        );

        let a: Vec<u8> = a.into_iter().flat_map(|c| c.unwrap().to_vec()).collect();
        let b: Vec<u8> = b.into_iter().flat_map(|c| c.unwrap().to_vec()).collect();
        assert_eq!(a, b"L1L2L3".to_vec());
        assert_eq!(b, b"R1R2".to_vec());
    }

    #[tokio::test]
    async fn save_writes_every_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speech.raw");
        let streamer = Streamer::new(ScriptedTransport::chunks(&[b"abc", b"def"]), test_config());

        let written = streamer
            .stream_tts("Hello", None, None, None)
            .await
            .unwrap()
            .save(&path)
            .await
            .unwrap();
        assert_eq!(written, 6);
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
    }

    #[test]
    fn clip_respects_char_boundaries() {
        assert_eq!(clip("héllo wörld", 4), "héll");
        assert_eq!(clip("short", 50), "short");
    }
}
