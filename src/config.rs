//! Runtime configuration, assembled from `HEARTH_*` environment variables.
//!
//! Every knob has a default suitable for a local single-machine install, so
//! `hearth` starts with zero configuration against a llama-server on
//! localhost.

use std::path::PathBuf;

use crate::error::ConfigError;

/// Top-level runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the libSQL database file.
    pub database_path: PathBuf,
    /// Directory for rolling log files.
    pub log_dir: PathBuf,
    /// Number of concurrent task workers.
    pub worker_count: usize,
    /// Queue poll interval when no work is pending, in milliseconds.
    pub poll_interval_ms: u64,
    /// How many of the speaker's recent turns go into the model context.
    pub context_window: usize,
    pub llm: LlmConfig,
}

/// Inference backend settings (OpenAI-compatible chat endpoint).
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    /// Model context size in tokens.
    pub n_ctx: i64,
    /// Completion budget reserved out of `n_ctx`.
    pub max_tokens: i64,
    pub request_timeout_secs: u64,
}

impl LlmConfig {
    /// Token budget available for the assembled prompt context.
    pub fn context_budget(&self) -> i64 {
        (self.n_ctx - self.max_tokens).max(0)
    }
}

impl Config {
    /// Read configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_path: PathBuf::from(env_or("HEARTH_DB_PATH", "data/hearth.db")),
            log_dir: PathBuf::from(env_or("HEARTH_LOG_DIR", "logs")),
            worker_count: parse_env("HEARTH_WORKERS", 2)?,
            poll_interval_ms: parse_env("HEARTH_POLL_INTERVAL_MS", 1000)?,
            context_window: parse_env("HEARTH_CONTEXT_WINDOW", 7)?,
            llm: LlmConfig {
                base_url: env_or("HEARTH_LLM_URL", "http://localhost:8080"),
                model: env_or("HEARTH_LLM_MODEL", "local"),
                n_ctx: parse_env("HEARTH_LLM_CTX", 8192)?,
                max_tokens: parse_env("HEARTH_LLM_MAX_TOKENS", 1024)?,
                request_timeout_secs: parse_env("HEARTH_LLM_TIMEOUT_SECS", 120)?,
            },
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("could not parse {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}
