use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `foreman.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
}

impl Config {
    /// Load config from `~/.foreman/foreman.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".foreman")
            .join("foreman.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Window in which duplicate (agent, type, source) dispatches are dropped.
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    /// Group window for coalescing `/agents/state` broadcasts.
    #[serde(default = "default_coalesce_ms")]
    pub state_coalesce_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dedup_window_secs: default_dedup_window_secs(),
            state_coalesce_ms: default_coalesce_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Embedding vector dimension; tables are created to match and never
    /// altered in place.
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            embedding_dim: default_embedding_dim(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    #[serde(default = "default_poll_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_batch")]
    pub max_parallel_jobs: usize,
    #[serde(default = "default_max_chunk")]
    pub max_chunk_chars: usize,
    #[serde(default = "default_overlap")]
    pub chunk_overlap_chars: usize,
    /// Line-window size for code files with no recognizable constructs.
    #[serde(default = "default_window_lines")]
    pub fallback_window_lines: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_secs(),
            max_parallel_jobs: default_batch(),
            max_chunk_chars: default_max_chunk(),
            chunk_overlap_chars: default_overlap(),
            fallback_window_lines: default_window_lines(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Generating comments older than this are swept to failed.
    #[serde(default = "default_stale_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_sweep_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_secs(),
            sweep_interval_secs: default_sweep_secs(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    7850
}

fn default_dedup_window_secs() -> u64 {
    10
}

fn default_coalesce_ms() -> u64 {
    50
}

fn default_db_path() -> String {
    "foreman.db".into()
}

fn default_embedding_dim() -> usize {
    384
}

fn default_poll_secs() -> u64 {
    5
}

fn default_batch() -> usize {
    3
}

fn default_max_chunk() -> usize {
    2000
}

fn default_overlap() -> usize {
    200
}

fn default_window_lines() -> usize {
    40
}

fn default_stale_secs() -> u64 {
    600
}

fn default_sweep_secs() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let cfg = Config::default();
        assert_eq!(cfg.broker.port, 7850);
        assert_eq!(cfg.store.embedding_dim, 384);
        assert_eq!(cfg.indexing.max_parallel_jobs, 3);
        assert_eq!(cfg.indexing.poll_interval_secs, 5);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [broker]
            port = 9000

            [indexing]
            max_parallel_jobs = 8
            "#,
        )
        .unwrap();
        assert_eq!(cfg.broker.port, 9000);
        assert_eq!(cfg.broker.host, "127.0.0.1");
        assert_eq!(cfg.indexing.max_parallel_jobs, 8);
        assert_eq!(cfg.indexing.max_chunk_chars, 2000);
    }

    #[test]
    fn load_missing_path_errors() {
        let err = Config::load_from("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
