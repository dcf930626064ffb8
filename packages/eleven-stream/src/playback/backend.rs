use std::io::Write;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::{Error, Result};
use crate::format::{Encoding, OutputFormat};

/// A way of making sound on this machine. Runs on the playback worker thread.
pub trait AudioBackend: Send {
    fn name(&self) -> &'static str;

    fn supports(&self, format: OutputFormat) -> bool;

    /// Play a complete utterance, blocking until it has finished.
    fn play(&mut self, audio: &[u8], format: OutputFormat) -> Result<()>;
}

/// Every backend that works here, in order of preference.
pub fn probe() -> Vec<Box<dyn AudioBackend>> {
    let mut backends: Vec<Box<dyn AudioBackend>> = Vec::new();

    #[cfg(feature = "rodio")]
    {
        match RodioBackend::probe() {
            Ok(backend) => backends.push(Box::new(backend)),
            Err(e) => debug!(error = %e, "rodio output unavailable"),
        }
    }

    for player in [ExternalPlayer::ffplay(), ExternalPlayer::aplay()] {
        if player.is_installed() {
            backends.push(Box::new(player));
        } else {
            debug!(program = player.program, "Audio player not found");
        }
    }

    backends
}

#[cfg(feature = "rodio")]
pub use self::rodio_backend::RodioBackend;

#[cfg(feature = "rodio")]
mod rodio_backend {
    use super::*;
    use rodio::Decoder;
    use rodio::buffer::SamplesBuffer;

    /// In-process playback of mp3 and raw pcm through the default output device.
    pub struct RodioBackend;

    impl RodioBackend {
        pub fn probe() -> Result<Self> {
            rodio::OutputStreamBuilder::open_default_stream()
                .map_err(|e| Error::Playback(format!("no default output device: {e}")))?;
            Ok(Self)
        }
    }

    impl AudioBackend for RodioBackend {
        fn name(&self) -> &'static str {
            "rodio"
        }

        fn supports(&self, format: OutputFormat) -> bool {
            matches!(format.encoding(), Encoding::Mp3 | Encoding::Pcm)
        }

        fn play(&mut self, audio: &[u8], format: OutputFormat) -> Result<()> {
            let stream_handle = rodio::OutputStreamBuilder::open_default_stream()
                .map_err(|e| Error::Playback(format!("failed to open output stream: {e}")))?;
            let sink = rodio::Sink::connect_new(stream_handle.mixer());

            match format.encoding() {
                Encoding::Mp3 => {
                    let source = Decoder::new(std::io::Cursor::new(audio.to_vec()))
                        .map_err(|e| Error::Playback(format!("failed to decode {format}: {e}")))?;
                    sink.append(source);
                }
                Encoding::Pcm => {
                    sink.append(SamplesBuffer::new(1, format.sample_rate(), pcm_samples(audio)));
                }
                _ => return Err(Error::Playback(format!("rodio cannot play {format}"))),
            }
            sink.sleep_until_end();
            Ok(())
        }
    }
}

/// A command-line player fed the utterance on stdin.
#[derive(Debug, Clone)]
pub struct ExternalPlayer {
    program: &'static str,
    version_flag: &'static str,
}

impl ExternalPlayer {
    pub fn ffplay() -> Self {
        Self {
            program: "ffplay",
            version_flag: "-version",
        }
    }

    /// ALSA's player. Raw encodings only.
    pub fn aplay() -> Self {
        Self {
            program: "aplay",
            version_flag: "--version",
        }
    }

    fn is_installed(&self) -> bool {
        Command::new(self.program)
            .arg(self.version_flag)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
    }

    /// Arguments for playing `format` read from stdin.
    pub fn args(&self, format: OutputFormat) -> Result<Vec<String>> {
        let rate = format.sample_rate().to_string();
        let rate = rate.as_str();
        let args: Vec<&str> = match self.program {
            "ffplay" => {
                let mut args = vec!["-nodisp", "-autoexit", "-loglevel", "quiet"];
                match format.encoding() {
                    Encoding::MuLaw => args.extend(["-f", "mulaw", "-ar", rate, "-ac", "1"]),
                    Encoding::ALaw => args.extend(["-f", "alaw", "-ar", rate, "-ac", "1"]),
                    Encoding::Pcm => args.extend(["-f", "s16le", "-ar", rate, "-ac", "1"]),
                    Encoding::Mp3 => args.extend(["-f", "mp3"]),
                    // Let ffplay probe the container.
                    Encoding::Opus => {}
                }
                args.extend(["-i", "pipe:0"]);
                args
            }
            "aplay" => {
                let sample_format = match format.encoding() {
                    Encoding::MuLaw => "MU_LAW",
                    Encoding::ALaw => "A_LAW",
                    Encoding::Pcm => "S16_LE",
                    Encoding::Mp3 | Encoding::Opus => {
                        return Err(Error::Playback(format!("aplay cannot decode {format}")));
                    }
                };
                vec!["-q", "-t", "raw", "-f", sample_format, "-r", rate, "-c", "1", "-"]
            }
            other => return Err(Error::Playback(format!("unknown player {other}"))),
        };
        Ok(args.into_iter().map(str::to_string).collect())
    }
}

impl AudioBackend for ExternalPlayer {
    fn name(&self) -> &'static str {
        self.program
    }

    fn supports(&self, format: OutputFormat) -> bool {
        self.args(format).is_ok()
    }

    fn play(&mut self, audio: &[u8], format: OutputFormat) -> Result<()> {
        let mut child = Command::new(self.program)
            .args(self.args(format)?)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Playback(format!("failed to start {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(audio)
                .map_err(|e| Error::Playback(format!("{} closed its input: {e}", self.program)))?;
        }

        let status = child
            .wait()
            .map_err(|e| Error::Playback(format!("{} did not exit cleanly: {e}", self.program)))?;
        if !status.success() {
            return Err(Error::Playback(format!(
                "{} failed with {status}",
                self.program
            )));
        }
        Ok(())
    }
}

/// Signed 16-bit little-endian samples scaled to `[-1.0, 1.0)`. A trailing odd byte is dropped.
pub fn pcm_samples(audio: &[u8]) -> Vec<f32> {
    audio
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect()
}
