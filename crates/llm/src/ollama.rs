use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::{
    Embedder, GenerationError, Generator, non_empty, status_error, transport_error,
};

const PROVIDER: &str = "ollama";

/// Client for a local or remote Ollama server.  Implements both
/// [`Generator`] (`/api/generate`) and [`Embedder`] (`/api/embeddings`).
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    embedding_model: String,
    max_tokens: u32,
    timeout: Duration,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let timeout = Duration::from_secs(120);
        Self {
            client: build_client(timeout),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            embedding_model: "nomic-embed-text".to_string(),
            max_tokens: 1000,
            timeout,
        }
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.client = build_client(timeout);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn post(&self, path: &str, payload: serde_json::Value) -> Result<serde_json::Value, GenerationError> {
        let endpoint = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|err| transport_error(PROVIDER, self.timeout, err))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|err| transport_error(PROVIDER, self.timeout, err))?;
        if !status.is_success() {
            return Err(status_error(PROVIDER, status, &headers, &body));
        }

        serde_json::from_str(&body).map_err(|err| {
            GenerationError::InvalidResponse(format!("{PROVIDER} sent non-JSON body: {err}"))
        })
    }
}

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

#[async_trait]
impl Generator for OllamaClient {
    async fn generate(
        &self,
        prompt: &str,
        system_context: &str,
        temperature: f32,
    ) -> Result<String, GenerationError> {
        debug!(model = %self.model, prompt_len = prompt.len(), "ollama generate");
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "system": system_context,
            "stream": false,
            "options": {
                "temperature": temperature,
                "num_predict": self.max_tokens,
            }
        });

        let body = self.post("/api/generate", payload).await?;
        non_empty(PROVIDER, body.get("response").and_then(|value| value.as_str()))
    }
}

#[async_trait]
impl Embedder for OllamaClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, GenerationError> {
        let payload = json!({
            "model": self.embedding_model,
            "prompt": text,
        });

        let body = self.post("/api/embeddings", payload).await?;
        let vector = parse_embedding(&body)?;
        debug!(model = %self.embedding_model, dim = vector.len(), "ollama embed");
        Ok(vector)
    }
}

fn parse_embedding(body: &serde_json::Value) -> Result<Vec<f32>, GenerationError> {
    let values = body
        .get("embedding")
        .and_then(|value| value.as_array())
        .ok_or_else(|| {
            GenerationError::InvalidResponse(format!("{PROVIDER} response missing embedding"))
        })?;

    let vector = values
        .iter()
        .map(|value| value.as_f64().map(|v| v as f32))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| {
            GenerationError::InvalidResponse(format!("{PROVIDER} embedding has non-numeric entries"))
        })?;

    if vector.is_empty() {
        return Err(GenerationError::InvalidResponse(format!(
            "{PROVIDER} returned an empty embedding"
        )));
    }
    Ok(vector)
}
