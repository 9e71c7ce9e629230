//! Model-facing capabilities for the saga pipeline.
//!
//! Everything upstream talks to language models through two narrow traits:
//! [`Generator`] (prompt → text) and [`Embedder`] (text → fixed-width
//! vector).  Concrete HTTP clients, the retry wrapper and the offline
//! embedder all implement those traits so callers never depend on a
//! provider directly.

pub mod embedder;
pub mod ollama;
pub mod openrouter;
pub mod retry;
pub mod scripted;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use embedder::HashingEmbedder;
pub use ollama::OllamaClient;
pub use openrouter::OpenRouterClient;
pub use retry::{RetryPolicy, Retrying};
pub use scripted::ScriptedGenerator;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failure of a Generator or Embedder call.
///
/// Providers must return one of these instead of an empty string.  Only
/// [`GenerationError::is_transient`] failures are worth retrying.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenerationError {
    #[error("{provider} rate limited the request (retry after {retry_after:?})")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("{provider} timed out after {after:?}")]
    Timeout { provider: String, after: Duration },

    #[error("{provider} unavailable: {reason}")]
    Unavailable { provider: String, reason: String },

    #[error("invalid model response: {0}")]
    InvalidResponse(String),
}

impl GenerationError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidResponse(_))
    }

    /// Short machine-readable label used in logs and interchange messages.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout { .. } => "timeout",
            Self::Unavailable { .. } => "unavailable",
            Self::InvalidResponse(_) => "invalid_response",
        }
    }
}

// ── Capabilities ──────────────────────────────────────────────────────────────

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        system_context: &str,
        temperature: f32,
    ) -> Result<String, GenerationError>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, GenerationError>;
}

#[async_trait]
impl<T: Generator + ?Sized> Generator for Arc<T> {
    async fn generate(
        &self,
        prompt: &str,
        system_context: &str,
        temperature: f32,
    ) -> Result<String, GenerationError> {
        (**self).generate(prompt, system_context, temperature).await
    }
}

#[async_trait]
impl<T: Embedder + ?Sized> Embedder for Arc<T> {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, GenerationError> {
        (**self).embed(text).await
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Provider {
    Ollama,
    OpenRouter,
}

impl Provider {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "ollama" => Some(Self::Ollama),
            "openrouter" => Some(Self::OpenRouter),
            _ => None,
        }
    }
}

/// Treat a blank completion as a provider failure.
pub(crate) fn non_empty(provider: &str, text: Option<&str>) -> Result<String, GenerationError> {
    match text.map(str::trim) {
        Some(text) if !text.is_empty() => Ok(text.to_string()),
        _ => Err(GenerationError::InvalidResponse(format!(
            "{provider} returned an empty completion"
        ))),
    }
}

/// Parse a `Retry-After` header given in whole seconds.
pub(crate) fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map an HTTP status + body to the error taxonomy.
pub(crate) fn status_error(
    provider: &str,
    status: reqwest::StatusCode,
    headers: &reqwest::header::HeaderMap,
    body: &str,
) -> GenerationError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        GenerationError::RateLimited {
            provider: provider.to_string(),
            retry_after: retry_after(headers),
        }
    } else if status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::GATEWAY_TIMEOUT
    {
        GenerationError::Timeout {
            provider: provider.to_string(),
            after: Duration::ZERO,
        }
    } else if status.is_server_error() {
        GenerationError::Unavailable {
            provider: provider.to_string(),
            reason: format!("{status}: {body}"),
        }
    } else {
        GenerationError::InvalidResponse(format!("{provider} error ({status}): {body}"))
    }
}

pub(crate) fn transport_error(
    provider: &str,
    timeout: Duration,
    error: reqwest::Error,
) -> GenerationError {
    if error.is_timeout() {
        GenerationError::Timeout {
            provider: provider.to_string(),
            after: timeout,
        }
    } else if error.is_decode() {
        GenerationError::InvalidResponse(format!("{provider} sent an undecodable body: {error}"))
    } else {
        GenerationError::Unavailable {
            provider: provider.to_string(),
            reason: error.to_string(),
        }
    }
}

// ── Structured output extraction ──────────────────────────────────────────────

/// Extract the first valid JSON value (object or array) from an LLM response.
///
/// Fenced ` ```json ` blocks win; otherwise the span from the first opening
/// bracket to the last matching closing bracket is tried.  Returns `None`
/// when nothing parses as `T`.
///
/// ```rust
/// use saga_llm::extract_json_output;
///
/// let raw = "Sure!\n```json\n[{\"kind\":\"plot\",\"content\":\"The bridge fell\"}]\n```";
/// let items: Vec<serde_json::Value> = extract_json_output(raw).unwrap();
/// assert_eq!(items.len(), 1);
/// ```
pub fn extract_json_output<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    // Strategy 1: fenced ```json ... ``` blocks.
    if let Some(fence_start) = response.find("```json") {
        let after_fence = &response[fence_start + "```json".len()..];
        if let Some(json_start) = after_fence.find(|c: char| !c.is_whitespace()) {
            let json_body = &after_fence[json_start..];
            if let Some(fence_end) = json_body.find("```") {
                let json_str = json_body[..fence_end].trim();
                if let Ok(val) = serde_json::from_str(json_str) {
                    return Some(val);
                }
            }
        }
    }

    // Strategy 2: bare JSON, whichever bracket kind opens first.
    let trimmed = response.trim();
    let start = trimmed.find(['{', '['])?;
    let close = if trimmed[start..].starts_with('{') { '}' } else { ']' };
    let end = trimmed.rfind(close)?;
    if end > start {
        if let Ok(val) = serde_json::from_str(&trimmed[start..=end]) {
            return Some(val);
        }
    }

    None
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Assertion {
        kind: String,
        content: String,
    }

    // ── extract_json_output ────────────────────────────────────────────────

    #[test]
    fn extract_fenced_array() {
        let raw = "Facts:\n```json\n[{\"kind\":\"character\",\"content\":\"Mara is left-handed\"}]\n```\nDone.";
        let out = extract_json_output::<Vec<Assertion>>(raw).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, "character");
        assert_eq!(out[0].content, "Mara is left-handed");
    }

    #[test]
    fn extract_bare_object_with_surrounding_text() {
        let raw = "verdict follows {\"kind\":\"plot\",\"content\":\"x\"} end";
        let out = extract_json_output::<Assertion>(raw).unwrap();
        assert_eq!(out.kind, "plot");
    }

    #[test]
    fn extract_bare_array_containing_objects() {
        let raw = r#"[{"kind":"world","content":"Iron burns the fae"},{"kind":"timeline","content":"Winter of year 3"}]"#;
        let out = extract_json_output::<Vec<Assertion>>(raw).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].kind, "timeline");
    }

    #[test]
    fn extract_fenced_takes_precedence_over_bare() {
        let raw = "Bare: {\"kind\":\"wrong\",\"content\":\"no\"}\n```json\n{\"kind\":\"right\",\"content\":\"yes\"}\n```\n";
        let out = extract_json_output::<Assertion>(raw).unwrap();
        assert_eq!(out.kind, "right");
    }

    #[test]
    fn extract_returns_none_for_plain_text() {
        assert!(extract_json_output::<Assertion>("no structure here").is_none());
        assert!(extract_json_output::<Assertion>("").is_none());
    }

    #[test]
    fn extract_two_bare_objects_returns_none() {
        let raw = r#"Here: {"kind":"a","content":"1"} and also {"kind":"b","content":"2"}"#;
        assert!(extract_json_output::<Assertion>(raw).is_none());
    }

    // ── error taxonomy ─────────────────────────────────────────────────────

    #[test]
    fn only_invalid_response_is_permanent() {
        let limited = GenerationError::RateLimited {
            provider: "ollama".into(),
            retry_after: None,
        };
        let timeout = GenerationError::Timeout {
            provider: "ollama".into(),
            after: Duration::from_secs(5),
        };
        let invalid = GenerationError::InvalidResponse("garbled".into());
        assert!(limited.is_transient());
        assert!(timeout.is_transient());
        assert!(!invalid.is_transient());
        assert_eq!(invalid.code(), "invalid_response");
    }

    #[test]
    fn status_error_classifies_rate_limits() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "7".parse().unwrap());
        let err = status_error("ollama", reqwest::StatusCode::TOO_MANY_REQUESTS, &headers, "");
        assert_eq!(
            err,
            GenerationError::RateLimited {
                provider: "ollama".into(),
                retry_after: Some(Duration::from_secs(7)),
            }
        );

        let err = status_error(
            "ollama",
            reqwest::StatusCode::BAD_REQUEST,
            &reqwest::header::HeaderMap::new(),
            "model not found",
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn blank_completion_is_invalid() {
        assert!(non_empty("ollama", Some("  \n")).is_err());
        assert!(non_empty("ollama", None).is_err());
        assert_eq!(non_empty("ollama", Some(" ok ")).unwrap(), "ok");
    }

    #[test]
    fn provider_labels() {
        assert_eq!(Provider::from_label("OpenRouter"), Some(Provider::OpenRouter));
        assert_eq!(Provider::from_label(" ollama "), Some(Provider::Ollama));
        assert_eq!(Provider::from_label("candle"), None);
    }
}
