use crate::config::StreamConfig;
use crate::endpoints::tts::{TextToSpeechBody, TextToSpeechQuery, TextToSpeechStream};
use crate::endpoints::{ElevenLabsEndpoint, RequestBody};
use crate::error::{Error, Result};
use crate::stream::{ChunkStream, SpeechRequest, SpeechTransport};
use async_trait::async_trait;
use reqwest::{Method, header::CONTENT_TYPE};
use std::time::Duration;
use tracing::debug;

const XI_API_KEY_HEADER: &str = "xi-api-key";
const APPLICATION_JSON: &str = "application/json";

/// HTTP client tuning for the ElevenLabs connection
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// TCP + TLS handshake budget
    pub connect_timeout: Duration,
    /// How long an idle pooled connection is kept for the next request
    pub pool_idle_timeout: Duration,
    /// Disable Nagle so small audio reads are not delayed
    pub tcp_nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
            tcp_nodelay: true,
        }
    }
}

#[derive(Clone)]
pub struct ElevenLabsClient {
    inner: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl ElevenLabsClient {
    pub fn from_config(config: &StreamConfig) -> Result<Self> {
        Self::from_config_with(config, ClientConfig::default())
    }

    pub fn from_config_with(config: &StreamConfig, client_config: ClientConfig) -> Result<Self> {
        let mut client = Self::new_with_config(config.api_key.clone(), client_config)?;
        client.base_url = config.base_url.clone();
        Ok(client)
    }

    /// A missing key is accepted here and reported as
    /// [`Error::Authentication`] on the first request.
    pub fn new_with_config(api_key: Option<String>, config: ClientConfig) -> Result<Self> {
        // Install default crypto provider for rustls (ignore if already installed)
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls_config)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.pool_idle_timeout)
            .tcp_nodelay(config.tcp_nodelay)
            .build()
            .map_err(|e| Error::Transport(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            inner: client,
            api_key,
            base_url: crate::config::DEFAULT_BASE_URL.to_string(),
        })
    }

    pub async fn hit<T: ElevenLabsEndpoint>(&self, endpoint: T) -> Result<T::ResponseBody> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            Error::Authentication(
                "no ElevenLabs API key found; set ELEVENLABS_API_KEY, ELEVEN_API_KEY, or ELEVEN_LABS_API_KEY"
                    .into(),
            )
        })?;

        let mut builder = self
            .inner
            .request(T::METHOD, endpoint.url(&self.base_url)?)
            .header(XI_API_KEY_HEADER, api_key);

        if matches!(T::METHOD, Method::POST | Method::PATCH) {
            builder = match endpoint.request_body()? {
                RequestBody::Json(json) => {
                    builder.header(CONTENT_TYPE, APPLICATION_JSON).json(&json)
                }
                RequestBody::Empty => {
                    return Err(Error::InvalidRequest("request must have a body".into()));
                }
            };
        }

        let resp = builder.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::from_status(status, &body));
        }

        endpoint.response_body(resp).await
    }
}

#[async_trait]
impl SpeechTransport for ElevenLabsClient {
    async fn open(&self, request: &SpeechRequest) -> Result<ChunkStream> {
        let body = TextToSpeechBody::new(request.text.clone(), request.model_id.clone())
            .with_voice_settings(request.voice_settings);
        let endpoint = TextToSpeechStream::new(request.voice_id.clone(), body)
            .with_query(TextToSpeechQuery::default().with_output_format(request.output_format));

        debug!(
            voice_id = %request.voice_id,
            model_id = %request.model_id,
            output_format = %request.output_format,
            "Opening ElevenLabs stream"
        );
        self.hit(endpoint).await
    }
}
