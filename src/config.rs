use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::QualityTier;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            base_url: None,
            api_key_env: None,
            requests_per_minute: None,
            timeout_secs: 120,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_timeout_secs() -> u64 {
    120
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn base_url(&self) -> &str {
        if let Some(ref url) = self.base_url {
            return url;
        }
        match self.provider.as_str() {
            "openrouter" => "https://openrouter.ai/api/v1",
            "ollama" => "http://localhost:11434/v1",
            _ => "https://api.openai.com/v1",
        }
    }

    /// Environment variable to read the API key from, if the provider needs one.
    pub fn api_key_var(&self) -> Option<&str> {
        if let Some(ref var) = self.api_key_env {
            return if var.is_empty() { None } else { Some(var) };
        }
        match self.provider.as_str() {
            "openai" => Some("OPENAI_API_KEY"),
            "openrouter" => Some("OPENROUTER_API_KEY"),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub quality: QualityTier,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            quality: QualityTier::Normal,
            max_concurrency: 4,
            max_retries: 5,
            initial_backoff_secs: 15,
            max_backoff_secs: 120,
        }
    }
}

fn default_max_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    5
}
fn default_initial_backoff_secs() -> u64 {
    15
}
fn default_max_backoff_secs() -> u64 {
    120
}

impl AnalysisConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.initial_backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Empty means every file with a recognized language.
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            state_dir: default_state_dir(),
            include_globs: Vec::new(),
            exclude_globs: Vec::new(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_state_dir() -> PathBuf {
    PathBuf::from(".autodoc")
}
fn default_max_file_bytes() -> u64 {
    1 << 20
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Database file for the sqlite backend. Defaults to `<state_dir>/autodoc.sqlite`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
        }
    }
}

fn default_backend() -> String {
    "sqlite".to_string()
}

impl Config {
    pub fn sqlite_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.index.state_dir.join("autodoc.sqlite"))
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.analysis.max_concurrency == 0 {
        anyhow::bail!("analysis.max_concurrency must be >= 1");
    }
    if config.analysis.max_backoff_secs < config.analysis.initial_backoff_secs {
        anyhow::bail!("analysis.max_backoff_secs must be >= analysis.initial_backoff_secs");
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" | "openrouter" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled, openai, openrouter, or ollama.",
            other
        ),
    }
    if config.llm.is_enabled() && config.llm.model.as_deref().unwrap_or("").is_empty() {
        anyhow::bail!(
            "llm.model must be specified when provider is '{}'",
            config.llm.provider
        );
    }

    match config.store.backend.as_str() {
        "sqlite" | "memory" => {}
        other => anyhow::bail!(
            "Unknown store backend: '{}'. Must be sqlite or memory.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<Config> {
        let config: Config = toml::from_str(raw)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.llm.provider, "disabled");
        assert_eq!(config.analysis.quality, QualityTier::Normal);
        assert_eq!(config.analysis.max_concurrency, 4);
        assert_eq!(config.analysis.initial_backoff(), Duration::from_secs(15));
        assert_eq!(config.index.max_file_bytes, 1 << 20);
        assert_eq!(config.store.backend, "sqlite");
        assert_eq!(
            config.sqlite_path(),
            PathBuf::from(".autodoc").join("autodoc.sqlite")
        );
    }

    #[test]
    fn test_full_config() {
        let config = parse(
            r#"
[llm]
provider = "openrouter"
model = "anthropic/claude-sonnet-4-5"
requests_per_minute = 50

[analysis]
quality = "max"
max_concurrency = 8

[index]
root = "src"
exclude_globs = ["**/generated/**"]

[store]
backend = "memory"
"#,
        )
        .unwrap();
        assert_eq!(config.llm.base_url(), "https://openrouter.ai/api/v1");
        assert_eq!(config.llm.api_key_var(), Some("OPENROUTER_API_KEY"));
        assert_eq!(config.llm.requests_per_minute, Some(50));
        assert_eq!(config.analysis.quality, QualityTier::Max);
        assert_eq!(config.index.root, PathBuf::from("src"));
        assert_eq!(config.store.backend, "memory");
    }

    #[test]
    fn test_validation_failures() {
        assert!(parse("[analysis]\nmax_concurrency = 0").is_err());
        assert!(parse("[llm]\nprovider = \"openai\"").is_err());
        assert!(parse("[llm]\nprovider = \"carrier-pigeon\"\nmodel = \"m\"").is_err());
        assert!(parse("[store]\nbackend = \"postgres\"").is_err());
        assert!(parse("[analysis]\ninitial_backoff_secs = 60\nmax_backoff_secs = 10").is_err());
    }

    #[test]
    fn test_ollama_needs_no_key() {
        let config = parse("[llm]\nprovider = \"ollama\"\nmodel = \"llama3\"").unwrap();
        assert_eq!(config.llm.api_key_var(), None);
        assert_eq!(config.llm.base_url(), "http://localhost:11434/v1");
    }
}
