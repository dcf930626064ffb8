//! Best-effort local playback of streamed audio.
//!
//! The async path only enqueues. A dedicated worker thread owns the probed
//! audio backends, buffers each utterance and plays it once the stream ends,
//! so a slow or busy audio device never delays the next network chunk.

mod backend;

pub use backend::{AudioBackend, ExternalPlayer, pcm_samples, probe};
#[cfg(feature = "rodio")]
pub use backend::RodioBackend;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, OnceLock};
use std::thread;

use bytes::{Bytes, BytesMut};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::format::OutputFormat;

pub type UtteranceId = u64;

/// Destination for a copy of the audio. Failures are never fatal to the caller.
pub trait PlaybackSink: Send + Sync {
    fn begin(&self, format: OutputFormat) -> Result<UtteranceId>;
    fn push(&self, id: UtteranceId, chunk: Bytes) -> Result<()>;
    /// The utterance is complete and may be played.
    fn finish(&self, id: UtteranceId) -> Result<()>;
    /// Discard the utterance unplayed.
    fn abort(&self, id: UtteranceId) -> Result<()>;
}

enum Job {
    Begin(UtteranceId, OutputFormat),
    Chunk(UtteranceId, Bytes),
    Finish(UtteranceId),
    Abort(UtteranceId),
}

/// Plays utterances on the local machine through the backends that probed successfully.
///
/// Each utterance goes to the first backend that supports its format, falling
/// through to the next one if playback fails. With no backend every call is a no-op.
pub struct LocalPlayer {
    jobs: Option<Sender<Job>>,
    backends: Vec<&'static str>,
    next_id: AtomicU64,
}

impl LocalPlayer {
    /// Bind to every available backend, or to nothing.
    pub fn probe() -> Self {
        let backends = backend::probe();
        if backends.is_empty() {
            warn!(
                "No audio playback backend available. Install ffplay or aplay, or build with the `rodio` feature, for local playback."
            );
            return Self::disabled();
        }
        Self::with_backends(backends)
    }

    pub fn disabled() -> Self {
        Self {
            jobs: None,
            backends: Vec::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_backend(backend: Box<dyn AudioBackend>) -> Self {
        Self::with_backends(vec![backend])
    }

    /// Backends are tried in the given order.
    pub fn with_backends(backends: Vec<Box<dyn AudioBackend>>) -> Self {
        let names: Vec<&'static str> = backends.iter().map(|b| b.name()).collect();
        let (tx, rx) = mpsc::channel();

        let spawned = thread::Builder::new()
            .name("eleven-stream-playback".into())
            .spawn(move || run_worker(backends, rx));

        match spawned {
            Ok(_) => {
                info!(backends = ?names, "Local playback bound");
                Self {
                    jobs: Some(tx),
                    backends: names,
                    next_id: AtomicU64::new(1),
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to start playback worker");
                Self::disabled()
            }
        }
    }

    /// The preferred backend.
    pub fn backend_name(&self) -> Option<&'static str> {
        self.backends.first().copied()
    }

    pub fn backend_names(&self) -> &[&'static str] {
        &self.backends
    }

    pub fn is_available(&self) -> bool {
        self.jobs.is_some()
    }

    fn send(&self, job: Job) -> Result<()> {
        let Some(jobs) = &self.jobs else {
            return Ok(());
        };
        jobs.send(job)
            .map_err(|_| Error::Playback("playback worker has stopped".into()))
    }
}

impl PlaybackSink for LocalPlayer {
    fn begin(&self, format: OutputFormat) -> Result<UtteranceId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send(Job::Begin(id, format))?;
        Ok(id)
    }

    fn push(&self, id: UtteranceId, chunk: Bytes) -> Result<()> {
        self.send(Job::Chunk(id, chunk))
    }

    fn finish(&self, id: UtteranceId) -> Result<()> {
        self.send(Job::Finish(id))
    }

    fn abort(&self, id: UtteranceId) -> Result<()> {
        self.send(Job::Abort(id))
    }
}

fn run_worker(mut backends: Vec<Box<dyn AudioBackend>>, jobs: mpsc::Receiver<Job>) {
    let mut pending: HashMap<UtteranceId, (OutputFormat, BytesMut)> = HashMap::new();

    while let Ok(job) = jobs.recv() {
        match job {
            Job::Begin(id, format) => {
                pending.insert(id, (format, BytesMut::new()));
            }
            Job::Chunk(id, chunk) => match pending.get_mut(&id) {
                Some((_, buf)) => buf.extend_from_slice(&chunk),
                None => warn!(utterance = id, "Dropping audio for unknown utterance"),
            },
            Job::Finish(id) => {
                let Some((format, buf)) = pending.remove(&id) else {
                    continue;
                };
                if !buf.is_empty() {
                    play(&mut backends, id, &buf, format);
                }
            }
            Job::Abort(id) => {
                if pending.remove(&id).is_some() {
                    debug!(utterance = id, "Discarded incomplete utterance");
                }
            }
        }
    }
    debug!("Playback worker exiting");
}

fn play(backends: &mut [Box<dyn AudioBackend>], id: UtteranceId, audio: &[u8], format: OutputFormat) {
    for backend in backends.iter_mut().filter(|b| b.supports(format)) {
        debug!(utterance = id, bytes = audio.len(), backend = backend.name(), "Playing audio locally");
        match backend.play(audio, format) {
            Ok(()) => {
                debug!(utterance = id, "Local playback finished");
                return;
            }
            Err(e) => warn!(utterance = id, backend = backend.name(), error = %e, "Error playing audio locally"),
        }
    }
    error!(utterance = id, %format, "No local backend could play the utterance");
}

/// The process-wide player, probed on first use.
pub fn local_player() -> Arc<LocalPlayer> {
    static PLAYER: OnceLock<Arc<LocalPlayer>> = OnceLock::new();
    PLAYER.get_or_init(|| Arc::new(LocalPlayer::probe())).clone()
}

/// One utterance on a sink. Logs and disables itself on the first failure.
pub(crate) struct PlaybackSession<'a> {
    sink: &'a dyn PlaybackSink,
    id: Option<UtteranceId>,
}

impl<'a> PlaybackSession<'a> {
    pub(crate) fn begin(sink: &'a dyn PlaybackSink, format: OutputFormat) -> Self {
        let id = sink
            .begin(format)
            .inspect_err(|e| warn!(error = %e, "Local playback unavailable for this utterance"))
            .ok();
        Self { sink, id }
    }

    pub(crate) fn push(&mut self, chunk: Bytes) {
        let Some(id) = self.id else {
            return;
        };
        if let Err(e) = self.sink.push(id, chunk) {
            warn!(error = %e, "Stopping local playback for this utterance");
            self.id = None;
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.id.is_some()
    }

    /// Drop the utterance without playing what was buffered.
    pub(crate) fn abort(mut self) {
        if let Some(id) = self.id.take() {
            if let Err(e) = self.sink.abort(id) {
                warn!(error = %e, "Failed to discard local playback");
            }
        }
    }
}

impl Drop for PlaybackSession<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            if let Err(e) = self.sink.finish(id) {
                warn!(error = %e, "Failed to finish local playback");
            }
        }
    }
}
