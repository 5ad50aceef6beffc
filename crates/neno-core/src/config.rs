//! Runtime configuration for the neno runner.
//!
//! Loaded from a TOML file at startup; every field falls back to a
//! sensible default so a missing file still yields a working engine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::EngineCoreConfig;
use crate::error::{Error, Result};

/// Top-level runner configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Model identity and artifact locations.
    #[serde(default)]
    pub model: ModelConfig,

    /// Scheduler, KV cache, and speculation knobs.
    #[serde(default)]
    pub engine: EngineCoreConfig,

    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,
}

/// Model identity and artifact locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Name reported by the model listing endpoints.
    #[serde(default = "default_model_name")]
    pub name: String,

    /// Directory holding `tokenizer.json` (or `vocab.json` +
    /// `merges.txt`).
    #[serde(default)]
    pub tokenizer_dir: Option<PathBuf>,

    /// Unix socket of the model daemon serving the forward pass.
    #[serde(default = "default_daemon_socket")]
    pub daemon_socket: PathBuf,

    /// Optional daemon socket of a draft model for speculative decoding.
    #[serde(default)]
    pub draft_daemon_socket: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            tokenizer_dir: None,
            daemon_socket: default_daemon_socket(),
            draft_daemon_socket: None,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_cors_enabled")]
    pub cors_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: default_cors_enabled(),
        }
    }
}

impl RunnerConfig {
    /// Load configuration from a TOML file. A missing file yields the
    /// defaults; a malformed one is a configuration error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        let config: RunnerConfig =
            toml::from_str(&data).map_err(|e| Error::Config(e.to_string()))?;
        config.engine.validate()?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn default_model_name() -> String {
    "neno".to_string()
}

fn default_daemon_socket() -> PathBuf {
    PathBuf::from("/tmp/neno_model_daemon.sock")
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_cors_enabled() -> bool {
    true
}
