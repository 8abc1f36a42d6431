use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ArborConfig {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub context: ContextConfig,
    pub retrieval: RetrievalConfig,
    pub completion: CompletionConfig,
    pub embedding: EmbeddingConfig,
    pub extraction: ExtractionConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the conversation tree.
    pub save_dir: String,
    /// SQLite database of the memory index.
    pub memory_db: String,
}

/// Knobs of the context fitter.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ContextConfig {
    pub context_size: usize,
    /// Share of `context_size` the fitted history may use.
    pub fit_ratio: f64,
    /// Messages above this share of `context_size` are ingested as documents.
    pub memorize_ratio: f64,
    /// A first message below this share of `context_size` is kept like an initial one.
    pub promote_ratio: f64,
    /// Actions whose messages are never memorized.
    pub excluded_actions: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_num_results: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CompletionConfig {
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub base_url: String,
    pub model: String,
    pub api_key_env: String,
    pub dimensions: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExtractionConfig {
    pub page_tokens: usize,
    pub overlap_tokens: usize,
    /// Upper bound on extractor calls per ingested document.
    pub max_rounds: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let dir = default_arbor_dir();
        Self {
            save_dir: dir.join("conversations").to_string_lossy().into_owned(),
            memory_db: dir.join("memory.db").to_string_lossy().into_owned(),
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_size: crate::tree::conversation::DEFAULT_CONTEXT_SIZE,
            fit_ratio: 0.8,
            memorize_ratio: 0.2,
            promote_ratio: 0.1,
            excluded_actions: vec!["return".into()],
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_num_results: 5,
        }
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            max_retries: 3,
            timeout_secs: 120,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            base_url: "https://api.openai.com/v1".into(),
            model: "text-embedding-3-small".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            dimensions: 1536,
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            page_tokens: 1000,
            overlap_tokens: 100,
            max_rounds: 64,
        }
    }
}

/// Returns `~/.arbor/`
pub fn default_arbor_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".arbor")
}

/// Returns the default config file path: `~/.arbor/config.toml`
pub fn default_config_path() -> PathBuf {
    default_arbor_dir().join("config.toml")
}

impl ArborConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            ArborConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (ARBOR_SAVE_DIR, ARBOR_MEMORY_DB, ARBOR_LOG_LEVEL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("ARBOR_SAVE_DIR") {
            self.storage.save_dir = val;
        }
        if let Ok(val) = std::env::var("ARBOR_MEMORY_DB") {
            self.storage.memory_db = val;
        }
        if let Ok(val) = std::env::var("ARBOR_LOG_LEVEL") {
            self.logging.log_level = val;
        }
    }

    pub fn resolved_save_dir(&self) -> PathBuf {
        expand_tilde(&self.storage.save_dir)
    }

    pub fn resolved_memory_db(&self) -> PathBuf {
        expand_tilde(&self.storage.memory_db)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
