use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

// ── Project ───────────────────────────────────────────────────────────────────

/// What the pipeline is asked to produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub title: String,
    pub genre: String,
    pub premise: String,
    /// Number of sequential units (chapters) expanded into the task graph.
    pub target_units: u32,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            title: "Untitled".to_string(),
            genre: "fantasy".to_string(),
            premise: String::new(),
            target_units: 12,
        }
    }
}

// ── Model access ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub ollama_model: String,
    pub openrouter_model: String,
    /// Model used by the Ollama embeddings endpoint.
    pub embedding_model: String,
    /// Base URL for the Ollama API.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub ollama_base_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    /// Attempts per Generator/Embedder call before a transient failure is
    /// surfaced to the scheduler.
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            ollama_model: "llama3.1:8b".to_string(),
            openrouter_model: "openai/gpt-4o-mini".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            ollama_base_url: "http://localhost:11434".to_string(),
            temperature: 0.7,
            max_tokens: 1000,
            request_timeout_secs: 120,
            retry_attempts: 3,
            retry_backoff_ms: 500,
        }
    }
}

// ── Memory: knowledge store + summarizer + validator ─────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// JSONL event log backing the knowledge store.  Empty keeps the store
    /// in memory only.
    pub event_log_path: String,
    /// Fixed embedding width.  `0` lets the first stored record decide.
    pub embedding_dim: usize,
    /// Fan-out `F`: atoms grouped into one parent summary.
    pub summary_fanout: usize,
    /// Raw units kept verbatim at the head of every assembled context.
    pub raw_window: usize,
    /// Context budget in characters.
    pub context_budget: usize,
    pub search_top_k: usize,
    /// Assertions whose best match scores at or above this are treated as
    /// already known rather than novel.
    pub known_fact_threshold: f32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            event_log_path: ".saga/facts.jsonl".to_string(),
            embedding_dim: 0,
            summary_fanout: 4,
            raw_window: 2,
            context_budget: 12_000,
            search_top_k: 5,
            known_fact_threshold: 0.92,
        }
    }
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Failures allowed in one repair chain before the task is left `failed`.
    pub max_retries: u32,
    /// Tasks per unit: `2` = write + validate, `3` adds a review pass.
    pub fanout_per_unit: u32,
    /// Upper bound on concurrently dispatched tasks.
    pub max_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            fanout_per_unit: 2,
            max_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub project: ProjectConfig,
    pub llm: LlmConfig,
    pub memory: MemoryConfig,
    pub scheduler: SchedulerConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("OLLAMA_BASE_URL") {
            if !value.is_empty() {
                config.llm.provider = "ollama".to_string();
                config.llm.ollama_base_url = value;
            }
        }

        if let Ok(level) = env::var("SAGA_LOG") {
            if !level.is_empty() {
                config.telemetry.log_level = level;
            }
        }

        if let Ok(model) = env::var("SAGA_MODEL") {
            if !model.is_empty() {
                if config.llm.provider.eq_ignore_ascii_case("openrouter") {
                    config.llm.openrouter_model = model;
                } else {
                    config.llm.ollama_model = model;
                }
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn active_model(&self) -> &str {
        if self.llm.provider.eq_ignore_ascii_case("openrouter") {
            &self.llm.openrouter_model
        } else {
            &self.llm.ollama_model
        }
    }

    /// Reject values that would make the pipeline ill-defined rather than
    /// merely slow.
    pub fn validate(&self) -> Result<()> {
        if self.memory.summary_fanout < 2 {
            bail!(
                "memory.summary_fanout must be at least 2 (got {})",
                self.memory.summary_fanout
            );
        }
        if self.memory.context_budget == 0 {
            bail!("memory.context_budget must be greater than 0");
        }
        if !matches!(self.scheduler.fanout_per_unit, 2 | 3) {
            bail!(
                "scheduler.fanout_per_unit must be 2 or 3 (got {})",
                self.scheduler.fanout_per_unit
            );
        }
        if self.scheduler.max_retries == 0 {
            bail!("scheduler.max_retries must be at least 1");
        }
        if self.scheduler.max_concurrency == 0 {
            bail!("scheduler.max_concurrency must be at least 1");
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            bail!("llm.temperature must be within 0.0..=2.0");
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
