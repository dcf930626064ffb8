//! Text-to-speech streaming endpoint.
//!
//! See the [ElevenLabs docs](https://elevenlabs.io/docs/api-reference/text-to-speech/stream)

use super::*;
use crate::format::OutputFormat;
use bytes::Bytes;
use futures_util::{StreamExt, stream::BoxStream};

const VOICE_ID_PATH: &str = ":voice_id";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
    pub speed: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextToSpeechBody {
    pub text: String,
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_settings: Option<VoiceSettings>,
}

impl TextToSpeechBody {
    pub fn new(text: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model_id: model_id.into(),
            voice_settings: None,
        }
    }

    pub fn with_voice_settings(mut self, settings: VoiceSettings) -> Self {
        self.voice_settings = Some(settings);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct TextToSpeechQuery {
    params: QueryValues,
}

impl TextToSpeechQuery {
    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.params.push(("output_format", format.to_string()));
        self
    }
}

/// `POST /v1/text-to-speech/{voice_id}/stream`
///
/// The response body is handed back unread: each item is one network read.
#[derive(Debug, Clone)]
pub struct TextToSpeechStream {
    voice_id: String,
    body: TextToSpeechBody,
    query: Option<TextToSpeechQuery>,
}

impl TextToSpeechStream {
    pub fn new(voice_id: impl Into<String>, body: TextToSpeechBody) -> Self {
        Self {
            voice_id: voice_id.into(),
            body,
            query: None,
        }
    }

    pub fn with_query(mut self, query: TextToSpeechQuery) -> Self {
        self.query = Some(query);
        self
    }
}

impl ElevenLabsEndpoint for TextToSpeechStream {
    const PATH: &'static str = "/v1/text-to-speech/:voice_id/stream";

    const METHOD: Method = Method::POST;

    type ResponseBody = BoxStream<'static, Result<Bytes>>;

    fn query_params(&self) -> Option<QueryValues> {
        self.query.as_ref().map(|q| q.params.clone())
    }

    fn path_params(&self) -> Vec<(&'static str, &str)> {
        vec![(VOICE_ID_PATH, &self.voice_id)]
    }

    fn request_body(&self) -> Result<RequestBody> {
        let json = serde_json::to_value(&self.body)
            .map_err(|e| Error::InvalidRequest(format!("failed to encode request body: {e}")))?;
        Ok(RequestBody::Json(json))
    }

    async fn response_body(self, resp: Response) -> Result<Self::ResponseBody> {
        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::Transport(format!("audio stream interrupted: {e}"))));
        Ok(stream.boxed())
    }
}
