//! Output formats accepted by the ElevenLabs `output_format` query parameter.

use std::str::FromStr;

use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, EnumIter)]
pub enum OutputFormat {
    #[strum(serialize = "mp3_22050_32")]
    Mp3_22050Hz32kbps,
    #[strum(serialize = "mp3_44100_32")]
    Mp3_44100Hz32kbps,
    #[strum(serialize = "mp3_44100_64")]
    Mp3_44100Hz64kbps,
    #[strum(serialize = "mp3_44100_96")]
    Mp3_44100Hz96kbps,
    #[strum(serialize = "mp3_44100_128")]
    Mp3_44100Hz128kbps,
    #[strum(serialize = "mp3_44100_192")]
    Mp3_44100Hz192kbps,
    #[strum(serialize = "pcm_8000")]
    Pcm8000Hz,
    #[strum(serialize = "pcm_16000")]
    Pcm16000Hz,
    #[strum(serialize = "pcm_22050")]
    Pcm22050Hz,
    #[strum(serialize = "pcm_24000")]
    Pcm24000Hz,
    #[strum(serialize = "pcm_44100")]
    Pcm44100Hz,
    #[strum(serialize = "ulaw_8000")]
    MuLaw8000Hz,
    #[strum(serialize = "alaw_8000")]
    ALaw8000Hz,
    #[strum(serialize = "opus_48000_32")]
    Opus48000Hz32kbps,
    #[strum(serialize = "opus_48000_64")]
    Opus48000Hz64kbps,
    #[strum(serialize = "opus_48000_96")]
    Opus48000Hz96kbps,
    #[strum(serialize = "opus_48000_128")]
    Opus48000Hz128kbps,
    #[strum(serialize = "opus_48000_192")]
    Opus48000Hz192kbps,
}

/// How the bytes of a format are laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Mp3,
    /// Signed 16-bit little-endian mono samples.
    Pcm,
    MuLaw,
    ALaw,
    Opus,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Result<Self, Error> {
        Self::from_str(value.trim())
            .map_err(|_| Error::InvalidRequest(format!("unsupported output format '{value}'")))
    }

    pub fn encoding(&self) -> Encoding {
        use OutputFormat::*;
        match self {
            Mp3_22050Hz32kbps | Mp3_44100Hz32kbps | Mp3_44100Hz64kbps | Mp3_44100Hz96kbps
            | Mp3_44100Hz128kbps | Mp3_44100Hz192kbps => Encoding::Mp3,
            Pcm8000Hz | Pcm16000Hz | Pcm22050Hz | Pcm24000Hz | Pcm44100Hz => Encoding::Pcm,
            MuLaw8000Hz => Encoding::MuLaw,
            ALaw8000Hz => Encoding::ALaw,
            Opus48000Hz32kbps | Opus48000Hz64kbps | Opus48000Hz96kbps | Opus48000Hz128kbps
            | Opus48000Hz192kbps => Encoding::Opus,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        use OutputFormat::*;
        match self {
            Pcm8000Hz | MuLaw8000Hz | ALaw8000Hz => 8_000,
            Pcm16000Hz => 16_000,
            Mp3_22050Hz32kbps | Pcm22050Hz => 22_050,
            Pcm24000Hz => 24_000,
            Mp3_44100Hz32kbps | Mp3_44100Hz64kbps | Mp3_44100Hz96kbps | Mp3_44100Hz128kbps
            | Mp3_44100Hz192kbps | Pcm44100Hz => 44_100,
            Opus48000Hz32kbps | Opus48000Hz64kbps | Opus48000Hz96kbps | Opus48000Hz128kbps
            | Opus48000Hz192kbps => 48_000,
        }
    }

    /// The 8 kHz encoding SIP/telephony backends expect.
    pub fn is_telephony(&self) -> bool {
        matches!(self, OutputFormat::MuLaw8000Hz)
    }

    /// Bytes per second of audio, known only for uncompressed encodings.
    pub fn byte_rate(&self) -> Option<u32> {
        match self.encoding() {
            Encoding::MuLaw | Encoding::ALaw => Some(self.sample_rate()),
            Encoding::Pcm => Some(self.sample_rate() * 2),
            Encoding::Mp3 | Encoding::Opus => None,
        }
    }
}
