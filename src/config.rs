//! Pipeline configuration.
//!
//! Loaded from an optional JSON file with environment overrides for the
//! secrets, so deployments can keep keys out of the config file.

use std::path::{Path, PathBuf};

use serde::Deserialize;

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Oracle API key. Empty means classification is unavailable.
    pub openai_api_key: String,
    pub model: String,
    pub api_base: String,
    /// Shared secret for ingestion callers. Empty disables the check
    /// (local development).
    pub sync_api_key: String,
    /// Known agent roster, used by hosts to fan out calendar pulls.
    pub agents: Vec<String>,
    pub batch_size: usize,
    pub example_limit: u32,
    pub oracle_timeout_secs: u64,
    /// Override for the events database location.
    pub db_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            openai_api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            sync_api_key: String::new(),
            agents: Vec::new(),
            batch_size: crate::scheduler::DEFAULT_BATCH_SIZE,
            example_limit: crate::feedback::DEFAULT_EXAMPLE_LIMIT,
            oracle_timeout_secs: 120,
            db_path: None,
        }
    }
}

impl PipelineConfig {
    /// Read configuration from `path` if it exists, otherwise start from
    /// defaults. `OPENAI_API_KEY` and `SYNC_API_KEY` in the environment
    /// override the file in either case.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
            serde_json::from_str(&raw).map_err(ConfigError::Parse)?
        } else {
            Self::default()
        };

        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            if !key.is_empty() {
                config.openai_api_key = key;
            }
        }
        if let Ok(key) = std::env::var("SYNC_API_KEY") {
            if !key.is_empty() {
                config.sync_api_key = key;
            }
        }
        Ok(config)
    }

    /// Check a caller-supplied sync key against the configured secret.
    /// An empty configured secret accepts everything.
    pub fn verify_sync_key(&self, provided: Option<&str>) -> bool {
        if self.sync_api_key.is_empty() {
            return true;
        }
        provided == Some(self.sync_api_key.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(std::io::Error),
    #[error("Invalid config file: {0}")]
    Parse(serde_json::Error),
}
