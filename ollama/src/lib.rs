//! Minimal Ollama API client.
//!
//! This crate provides a focused client for a local Ollama server with:
//! - Connectivity checks via the model list
//! - Non-streaming and streaming generation
//! - Lenient NDJSON decoding for streamed responses

mod ndjson;

use tokio_stream::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

pub use ndjson::{decode_line, decode_ndjson, LineDecoder};

/// Default Ollama base URL.
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Default model name.
pub const DEFAULT_MODEL: &str = "llama2";

/// Errors that can occur when talking to Ollama.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error came from the transport (network failure or non-2xx status).
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Api { .. })
    }
}

/// A stream of decoded generate records.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<GenerateChunk, Error>> + Send>>;

/// Ollama API client.
#[derive(Clone)]
pub struct Ollama {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl Ollama {
    /// Create a client for the given server and model.
    ///
    /// Only a connect timeout is applied; streamed generations may run long.
    pub fn new(base_url: impl AsRef<str>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: normalize_base_url(base_url.as_ref()),
            model: model.into(),
        }
    }

    /// Create a client from `OLLAMA_BASE_URL` and `OLLAMA_MODEL`, falling back to defaults.
    pub fn from_env() -> Self {
        let base_url =
            std::env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let model = std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Self::new(base_url, model)
    }

    /// Use a preconfigured HTTP client (proxies, timeouts, TLS).
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Set the default model for this client.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// List the models installed on the server.
    ///
    /// Doubles as the connectivity check.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, Error> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        let response = ensure_success(response).await?;

        let tags: ApiTags = response
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))?;

        Ok(tags.models)
    }

    /// Send a generate request and return the whole response.
    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, Error> {
        let response = self.post_generate(&request, false).await?;

        response
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))
    }

    /// Send a generate request and stream the decoded records.
    ///
    /// A non-2xx status fails here, before any record is produced.
    pub async fn generate_stream(&self, request: GenerateRequest) -> Result<ChunkStream, Error> {
        let response = self.post_generate(&request, true).await?;
        Ok(Box::pin(decode_ndjson(response.bytes_stream())))
    }

    async fn post_generate(
        &self,
        request: &GenerateRequest,
        stream: bool,
    ) -> Result<reqwest::Response, Error> {
        let api_request = self.build_api_request(request, stream);
        tracing::debug!(model = %api_request.model, stream, "sending generate request");

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        ensure_success(response).await
    }

    fn build_api_request<'a>(&'a self, request: &'a GenerateRequest, stream: bool) -> ApiRequest<'a> {
        ApiRequest {
            model: request.model.as_deref().unwrap_or(&self.model),
            prompt: &request.prompt,
            stream,
            options: &request.options,
        }
    }
}

impl Default for Ollama {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL, DEFAULT_MODEL)
    }
}

fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, Error> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(Error::Api {
        status,
        message: body,
    })
}

// ============================================================================
// Public types
// ============================================================================

/// A generate request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    /// Overrides the client's model when set.
    pub model: Option<String>,
    pub prompt: String,
    pub options: GenerateOptions,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            model: None,
            prompt: prompt.into(),
            options: GenerateOptions::default(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }
}

/// Sampling options. Unset fields are left to the server's defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl GenerateOptions {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_top_k(mut self, top_k: u32) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// A complete (non-streamed) generate response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GenerateResponse {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub done: bool,
}

/// One record of a streamed generate response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GenerateChunk {
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub done: bool,
}

impl GenerateChunk {
    /// The record's text, if it carries any.
    pub fn token(&self) -> Option<&str> {
        self.response.as_deref().filter(|text| !text.is_empty())
    }
}

/// A model installed on the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified_at: Option<String>,
}

// ============================================================================
// Internal API types
// ============================================================================

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: &'a GenerateOptions,
}

#[derive(Debug, Deserialize)]
struct ApiTags {
    #[serde(default)]
    models: Vec<ModelInfo>,
}
