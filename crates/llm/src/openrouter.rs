use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::{GenerationError, Generator, non_empty, status_error, transport_error};

const PROVIDER: &str = "openrouter";
const ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Chat-completions client for OpenRouter.  Generation only; embeddings stay
/// with Ollama or the offline embedder.
#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    timeout: Duration,
}

impl OpenRouterClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let timeout = Duration::from_secs(120);
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: 1000,
            timeout,
        }
    }

    /// Build from `OPENROUTER_API_KEY`.
    pub fn from_env(model: impl Into<String>) -> Result<Self, GenerationError> {
        match std::env::var("OPENROUTER_API_KEY") {
            Ok(key) if !key.trim().is_empty() => Ok(Self::new(key.trim(), model)),
            _ => Err(GenerationError::Unavailable {
                provider: PROVIDER.to_string(),
                reason: "OPENROUTER_API_KEY is not set".to_string(),
            }),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl Generator for OpenRouterClient {
    async fn generate(
        &self,
        prompt: &str,
        system_context: &str,
        temperature: f32,
    ) -> Result<String, GenerationError> {
        debug!(model = %self.model, prompt_len = prompt.len(), "openrouter generate");
        let mut messages = Vec::with_capacity(2);
        if !system_context.trim().is_empty() {
            messages.push(json!({"role": "system", "content": system_context}));
        }
        messages.push(json!({"role": "user", "content": prompt}));

        let payload = json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
            "max_tokens": self.max_tokens,
        });

        let response = self
            .client
            .post(ENDPOINT)
            .bearer_auth(&self.api_key)
            .header("X-Title", "saga")
            .json(&payload)
            .send()
            .await
            .map_err(|err| transport_error(PROVIDER, self.timeout, err))?;

        let status = response.status();
        let headers = response.headers().clone();
        let text = response
            .text()
            .await
            .map_err(|err| transport_error(PROVIDER, self.timeout, err))?;
        if !status.is_success() {
            return Err(status_error(PROVIDER, status, &headers, &text));
        }

        let body: serde_json::Value = serde_json::from_str(&text).map_err(|err| {
            GenerationError::InvalidResponse(format!("{PROVIDER} sent non-JSON body: {err}"))
        })?;
        non_empty(PROVIDER, completion_text(&body))
    }
}

fn completion_text(body: &serde_json::Value) -> Option<&str> {
    body.get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
}
