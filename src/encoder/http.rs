//! OpenAI-compatible embeddings endpoint backend.
//!
//! Talks to an inference server exposing `POST {base}/embeddings`. One server
//! is expected per accelerator: `EMBEDDINGS_API_BASE` holds a comma-separated
//! list of base URLs and the device ordinal picks one.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EncoderError;

use super::{Device, Encoder, EncoderConfig};

/// Environment variable holding the endpoint base URL(s).
pub const API_BASE_ENV: &str = "EMBEDDINGS_API_BASE";

/// Environment variable holding the bearer token.
pub const API_KEY_ENV: &str = "EMBEDDINGS_API_KEY";

/// Endpoint used when `EMBEDDINGS_API_BASE` is unset.
const DEFAULT_API_BASE: &str = "http://localhost:8080/v1";

/// Texts per HTTP request; larger batches are split.
const MAX_TEXTS_PER_REQUEST: usize = 128;

/// Request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 300;

/// Embeddings client for one endpoint.
pub struct HttpEncoder {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl HttpEncoder {
    /// Creates a client for the given endpoint.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Result<Self, EncoderError> {
        let base_url = base_url.into();
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| EncoderError::LoadFailed {
                encoder: "arctic".to_string(),
                device: base_url.clone(),
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        })
    }

    /// Creates a client for `device` using the endpoints from the environment.
    pub fn from_env(config: &EncoderConfig, device: Device) -> Result<Self, EncoderError> {
        let bases = std::env::var(API_BASE_ENV).unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
        let base_url = select_endpoint(&bases, device).ok_or_else(|| EncoderError::LoadFailed {
            encoder: config.encoder_type.clone(),
            device: device.to_string(),
            message: format!("{} is set but lists no endpoint", API_BASE_ENV),
        })?;
        let api_key = std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty());

        debug!(%device, endpoint = %base_url, model = %config.model, "Creating embeddings client");
        Self::new(base_url, api_key, config.model.clone())
    }

    /// Endpoint base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn execute_request(&self, input: &[String]) -> Result<Vec<Vec<f32>>, EncoderError> {
        let url = format!("{}/embeddings", self.base_url);
        let request = EmbeddingRequest {
            model: &self.model,
            input,
        };

        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let http_response = builder
            .send()
            .await
            .map_err(|e| EncoderError::RequestFailed(e.to_string()))?;

        let status = http_response.status();
        if !status.is_success() {
            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            let message = serde_json::from_str::<ApiErrorResponse>(&error_text)
                .map(|e| e.error.message)
                .unwrap_or(error_text);
            return Err(EncoderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let api_response: EmbeddingResponse = http_response.json().await.map_err(|e| {
            EncoderError::InvalidResponse(format!("Failed to parse API response: {}", e))
        })?;

        order_embeddings(api_response.data, input.len())
    }
}

#[async_trait]
impl Encoder for HttpEncoder {
    fn name(&self) -> &str {
        "arctic"
    }

    fn dimension(&self) -> Option<usize> {
        None
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EncoderError> {
        let mut rows = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(MAX_TEXTS_PER_REQUEST) {
            rows.extend(self.execute_request(chunk).await?);
        }
        Ok(rows)
    }
}

/// Picks the endpoint for a device from a comma-separated list.
fn select_endpoint(bases: &str, device: Device) -> Option<String> {
    let endpoints: Vec<&str> = bases
        .split(',')
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .collect();
    if endpoints.is_empty() {
        return None;
    }
    Some(endpoints[device.ordinal() % endpoints.len()].to_string())
}

/// Sorts response items by `index` and checks that every input got one.
fn order_embeddings(
    mut data: Vec<EmbeddingData>,
    expected: usize,
) -> Result<Vec<Vec<f32>>, EncoderError> {
    if data.len() != expected {
        return Err(EncoderError::InvalidResponse(format!(
            "expected {} embeddings, got {}",
            expected,
            data.len()
        )));
    }
    data.sort_by_key(|d| d.index);
    for (position, item) in data.iter().enumerate() {
        if item.index != position {
            return Err(EncoderError::InvalidResponse(format!(
                "missing embedding for input {}",
                position
            )));
        }
    }
    Ok(data.into_iter().map(|d| d.embedding).collect())
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}
