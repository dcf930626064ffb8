use std::fmt;

use serde_json::Value;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad caller input, detected before any network call.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Missing API key, or the vendor rejected the one we sent.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// Network, timeout or vendor-side failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// Local audio only. Logged by callers, never propagated to the host.
    #[error("playback error: {0}")]
    Playback(String),
    /// A capability the host was expected to provide is missing or failed.
    #[error("host error: {0}")]
    Host(String),
}

/// Coarse classification callers can branch on without matching messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidRequest,
    Authentication,
    Transport,
    Playback,
    Host,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::Authentication => "AuthenticationError",
            ErrorKind::Transport => "TransportError",
            ErrorKind::Playback => "PlaybackError",
            ErrorKind::Host => "HostError",
        };
        f.write_str(name)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Playback(_) => ErrorKind::Playback,
            Error::Host(_) => ErrorKind::Host,
        }
    }

    /// Classify a non-success vendor response.
    ///
    /// ElevenLabs reports failures as `{"detail": {"status": .., "message": ..}}`
    /// or `{"detail": "..."}`; anything else is quoted as-is.
    pub(crate) fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let detail = vendor_message(body).unwrap_or_else(|| body.trim().to_string());
        let message = if detail.is_empty() {
            format!("ElevenLabs returned {status}")
        } else {
            format!("ElevenLabs returned {status}: {detail}")
        };

        match status {
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Error::Authentication(message)
            }
            _ => Error::Transport(message),
        }
    }
}

fn vendor_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    match value.get("detail")? {
        Value::String(message) => Some(message.clone()),
        detail => detail
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Error::from_status(status, "");
        }
        if err.is_timeout() {
            return Error::Transport(format!("request timed out: {err}"));
        }
        Error::Transport(err.to_string())
    }
}
