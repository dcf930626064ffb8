//! Process-wide configuration, resolved once at startup.
//!
//! Values come from the process environment (after loading an optional
//! `.env` file) and fall back to built-in defaults. The streaming client and
//! the `speak` command receive a [`StreamConfig`] explicitly, so tests can
//! build one from a fixed lookup instead of touching the environment.

use std::fmt;
use std::str::FromStr;

use tracing::warn;

use crate::format::OutputFormat;

/// George
pub const DEFAULT_VOICE_ID: &str = "JBFqnCBsd6RMkjVDRZzb";
/// Lowest-latency model, suited to real-time calls.
pub const DEFAULT_MODEL_ID: &str = "eleven_flash_v2_5";
pub const DEFAULT_OUTPUT_FORMAT: OutputFormat = OutputFormat::MuLaw8000Hz;
pub const DEFAULT_LOCAL_PLAYBACK_FORMAT: OutputFormat = OutputFormat::Mp3_44100Hz128kbps;
pub const DEFAULT_BASE_URL: &str = "https://api.elevenlabs.io";

pub const DEFAULT_STABILITY: f32 = 0.5;
pub const DEFAULT_SIMILARITY_BOOST: f32 = 0.75;
pub const DEFAULT_SPEED: f32 = 1.0;

const API_KEY_VARS: [&str; 3] = ["ELEVENLABS_API_KEY", "ELEVEN_API_KEY", "ELEVEN_LABS_API_KEY"];

#[derive(Clone)]
pub struct StreamConfig {
    /// Absence is only reported when a stream is first requested.
    pub api_key: Option<String>,
    pub default_voice_id: String,
    pub default_model_id: String,
    pub default_output_format: OutputFormat,
    pub local_playback: bool,
    /// Requested instead of the telephony encoding while local playback is on.
    pub local_playback_format: OutputFormat,
    pub stability: f32,
    pub similarity_boost: f32,
    pub speed: f32,
    /// Pace chunks sent to the host audio channel at their playback rate.
    pub realtime_pacing: bool,
    pub base_url: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_voice_id: DEFAULT_VOICE_ID.to_string(),
            default_model_id: DEFAULT_MODEL_ID.to_string(),
            default_output_format: DEFAULT_OUTPUT_FORMAT,
            local_playback: false,
            local_playback_format: DEFAULT_LOCAL_PLAYBACK_FORMAT,
            stability: DEFAULT_STABILITY,
            similarity_boost: DEFAULT_SIMILARITY_BOOST,
            speed: DEFAULT_SPEED,
            realtime_pacing: true,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

impl StreamConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Self {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded environment file");
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve every option through `lookup`, falling back to the built-in default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        Self {
            api_key: API_KEY_VARS.iter().find_map(|&name| get(name)),
            default_voice_id: get("ELEVENLABS_VOICE_ID").unwrap_or(defaults.default_voice_id),
            default_model_id: get("ELEVENLABS_MODEL_ID").unwrap_or(defaults.default_model_id),
            default_output_format: parse_or(
                "ELEVENLABS_OUTPUT_FORMAT",
                get("ELEVENLABS_OUTPUT_FORMAT"),
                defaults.default_output_format,
            ),
            local_playback: get("MR_TTS_PLAY_LOCAL").is_some_and(|v| is_truthy(&v)),
            local_playback_format: parse_or(
                "MR_TTS_LOCAL_FORMAT",
                get("MR_TTS_LOCAL_FORMAT"),
                defaults.local_playback_format,
            ),
            stability: parse_or(
                "ELEVENLABS_STABILITY_DEFAULT",
                get("ELEVENLABS_STABILITY_DEFAULT"),
                defaults.stability,
            ),
            similarity_boost: parse_or(
                "ELEVENLABS_SIMILARITY_BOOST_DEFAULT",
                get("ELEVENLABS_SIMILARITY_BOOST_DEFAULT"),
                defaults.similarity_boost,
            ),
            speed: parse_or(
                "ELEVENLABS_SPEECH_SPEED_DEFAULT",
                get("ELEVENLABS_SPEECH_SPEED_DEFAULT"),
                defaults.speed,
            ),
            realtime_pacing: get("MR_TTS_REALTIME_PACING")
                .map(|v| is_truthy(&v))
                .unwrap_or(defaults.realtime_pacing),
            base_url: get("ELEVENLABS_BASE_URL").unwrap_or(defaults.base_url),
        }
    }

    /// Key shortened for logs: first four and last four characters.
    pub fn redacted_api_key(&self) -> Option<String> {
        self.api_key.as_deref().map(redact)
    }
}

impl fmt::Debug for StreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConfig")
            .field("api_key", &self.redacted_api_key())
            .field("default_voice_id", &self.default_voice_id)
            .field("default_model_id", &self.default_model_id)
            .field("default_output_format", &self.default_output_format)
            .field("local_playback", &self.local_playback)
            .field("local_playback_format", &self.local_playback_format)
            .field("stability", &self.stability)
            .field("similarity_boost", &self.similarity_boost)
            .field("speed", &self.speed)
            .field("realtime_pacing", &self.realtime_pacing)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// `true`, `1`, `yes` and `on`, in any case.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

fn parse_or<T: FromStr + Copy>(name: &str, value: Option<String>, default: T) -> T {
    match value {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(variable = name, value = %raw, "Ignoring unparseable setting, using default");
            default
        }),
    }
}

fn redact(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
