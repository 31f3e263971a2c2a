//! Layered configuration for the forma service.
//!
//! Settings are read from `forma.toml`, then overridden by `FORMA_*`
//! environment variables (a `.env` file is honored via dotenvy), then by
//! CLI flags. Every field has a sensible default so a bare `forma serve`
//! works against local capability endpoints.
//!
//! # Configuration file format
//!
//! ```toml
//! [server]
//! port = 8723
//! dev_mode = false
//!
//! [tasks]
//! max_iterations = 3
//! max_concurrent = 4
//! retention_secs = 3600
//!
//! [capabilities]
//! specification_url = "http://127.0.0.1:9101"
//! code_synthesis_url = "http://127.0.0.1:9102"
//! execution_url = "http://127.0.0.1:9103"
//! review_url = "http://127.0.0.1:9104"
//! timeout_secs = 120
//!
//! [output]
//! dir = "outputs"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "forma.toml";

/// Protocol server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS for local frontend development.
    #[serde(default)]
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            dev_mode: false,
        }
    }
}

/// Per-task policy defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Iteration budget when the client does not supply one.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Admission limit; tasks beyond it queue in Created state.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// How long terminal tasks stay pollable before the janitor sweeps them.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_concurrent: default_max_concurrent(),
            retention_secs: default_retention_secs(),
        }
    }
}

/// Endpoints and timeout for the four capability adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityConfig {
    #[serde(default = "default_specification_url")]
    pub specification_url: String,
    #[serde(default = "default_code_synthesis_url")]
    pub code_synthesis_url: String,
    #[serde(default = "default_execution_url")]
    pub execution_url: String,
    #[serde(default = "default_review_url")]
    pub review_url: String,
    /// Per-call timeout; a breach is an infrastructure fault, not a retry.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            specification_url: default_specification_url(),
            code_synthesis_url: default_code_synthesis_url(),
            execution_url: default_execution_url(),
            review_url: default_review_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Artifact output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory the execution capability writes artifacts into and the
    /// download endpoint serves from.
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormaConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub capabilities: CapabilityConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

fn default_port() -> u16 {
    8723
}

fn default_max_iterations() -> u32 {
    3
}

fn default_max_concurrent() -> usize {
    4
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_specification_url() -> String {
    "http://127.0.0.1:9101".to_string()
}

fn default_code_synthesis_url() -> String {
    "http://127.0.0.1:9102".to_string()
}

fn default_execution_url() -> String {
    "http://127.0.0.1:9103".to_string()
}

fn default_review_url() -> String {
    "http://127.0.0.1:9104".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}

impl FormaConfig {
    /// Load configuration: file (if present) → environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Invalid config file {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply `FORMA_*` environment overrides on top of file values.
    fn apply_env(&mut self) {
        if let Some(port) = env_parse("FORMA_PORT") {
            self.server.port = port;
        }
        if let Some(max) = env_parse("FORMA_MAX_ITERATIONS") {
            self.tasks.max_iterations = max;
        }
        if let Some(max) = env_parse("FORMA_MAX_CONCURRENT") {
            self.tasks.max_concurrent = max;
        }
        if let Some(secs) = env_parse("FORMA_RETENTION_SECS") {
            self.tasks.retention_secs = secs;
        }
        if let Some(secs) = env_parse("FORMA_CAPABILITY_TIMEOUT_SECS") {
            self.capabilities.timeout_secs = secs;
        }
        if let Ok(url) = std::env::var("FORMA_SPECIFICATION_URL") {
            self.capabilities.specification_url = url;
        }
        if let Ok(url) = std::env::var("FORMA_CODE_SYNTHESIS_URL") {
            self.capabilities.code_synthesis_url = url;
        }
        if let Ok(url) = std::env::var("FORMA_EXECUTION_URL") {
            self.capabilities.execution_url = url;
        }
        if let Ok(url) = std::env::var("FORMA_REVIEW_URL") {
            self.capabilities.review_url = url;
        }
        if let Ok(dir) = std::env::var("FORMA_OUTPUT_DIR") {
            self.output.dir = PathBuf::from(dir);
        }
    }

    /// Serialized form for `forma config show` / `forma config init`.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}
