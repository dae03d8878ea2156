//! Application configuration for SiteKB.
//!
//! User config lives at `~/.sitekb/sitekb.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SiteKbError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "sitekb.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".sitekb";

// ---------------------------------------------------------------------------
// Config structs (matching sitekb.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Crawl policies.
    #[serde(default)]
    pub crawl_policies: CrawlPoliciesConfig,

    /// Embedding provider and index build settings.
    #[serde(default)]
    pub embedding: EmbeddingSettings,

    /// Answer-generation provider settings.
    #[serde(default)]
    pub generation: GenerationSettings,

    /// Retrieval and context assembly settings.
    #[serde(default)]
    pub retrieval: RetrievalSettings,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Default knowledge base directory.
    #[serde(default = "default_kb_dir")]
    pub kb_dir: String,

    /// Maximum pages accepted by discovery.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,

    /// Maximum concurrent HTTP requests.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// Maximum BFS depth from the root URL.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Overall timeout for a discovery or extraction run.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            kb_dir: default_kb_dir(),
            max_pages: default_max_pages(),
            concurrency: default_concurrency(),
            max_depth: default_max_depth(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_kb_dir() -> String {
    "~/.sitekb/kb".into()
}
fn default_max_pages() -> usize {
    200
}
fn default_concurrency() -> u32 {
    16
}
fn default_max_depth() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    300
}

/// `[crawl_policies]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlPoliciesConfig {
    /// URL include patterns (regex, searched anywhere in the URL).
    #[serde(default)]
    pub include_patterns: Vec<String>,

    /// URL exclude patterns.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    /// Whether to respect robots.txt `Disallow` rules.
    #[serde(default = "default_true")]
    pub respect_robots_txt: bool,

    /// Minimum ms each worker waits before a request.
    #[serde(default)]
    pub rate_limit_ms: u64,

    /// Per-request timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Extracted pages shorter than this are dropped.
    #[serde(default = "default_min_content_chars")]
    pub min_content_chars: usize,
}

impl Default for CrawlPoliciesConfig {
    fn default() -> Self {
        Self {
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            respect_robots_txt: true,
            rate_limit_ms: 0,
            request_timeout_secs: default_request_timeout(),
            min_content_chars: default_min_content_chars(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_request_timeout() -> u64 {
    20
}
fn default_min_content_chars() -> usize {
    200
}

/// `[embedding]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    /// OpenAI-compatible API base (the `/embeddings` path is appended).
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_embedding_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff; doubles on each retry.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default = "default_embedding_timeout")]
    pub request_timeout_secs: u64,

    /// Text sent per record is truncated to this many chars.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,

    /// Published generations kept on disk after a commit.
    #[serde(default = "default_keep_generations")]
    pub keep_generations: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            base_url: default_embedding_base_url(),
            model: default_embedding_model(),
            api_key_env: default_embedding_key_env(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            request_timeout_secs: default_embedding_timeout(),
            max_input_chars: default_max_input_chars(),
            keep_generations: default_keep_generations(),
        }
    }
}

fn default_embedding_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_embedding_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_attempts() -> u32 {
    4
}
fn default_backoff_ms() -> u64 {
    500
}
fn default_embedding_timeout() -> u64 {
    60
}
fn default_max_input_chars() -> usize {
    8000
}
fn default_keep_generations() -> usize {
    2
}

/// `[generation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSettings {
    #[serde(default = "default_generation_model")]
    pub model: String,

    #[serde(default = "default_generation_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default)]
    pub temperature: f32,

    #[serde(default = "default_generation_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            model: default_generation_model(),
            api_key_env: default_generation_key_env(),
            max_tokens: default_max_tokens(),
            temperature: 0.0,
            request_timeout_secs: default_generation_timeout(),
        }
    }
}

fn default_generation_model() -> String {
    "claude-3-5-sonnet-20241022".into()
}
fn default_generation_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}
fn default_max_tokens() -> u32 {
    2000
}
fn default_generation_timeout() -> u64 {
    120
}

/// `[retrieval]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalSettings {
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Hard cap on the assembled context length.
    #[serde(default = "default_context_budget")]
    pub context_budget_chars: usize,

    /// Cap on each record's share of the context.
    #[serde(default = "default_per_record_chars")]
    pub per_record_chars: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            context_budget_chars: default_context_budget(),
            per_record_chars: default_per_record_chars(),
        }
    }
}

fn default_top_k() -> usize {
    6
}
fn default_context_budget() -> usize {
    12_000
}
fn default_per_record_chars() -> usize {
    3_000
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime crawl configuration, shared by discovery and extraction.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Maximum URLs accepted by discovery.
    pub max_pages: usize,
    /// Maximum concurrent HTTP requests.
    pub concurrency: u32,
    /// Maximum BFS depth from the root URL.
    pub max_depth: u32,
    /// URL include patterns.
    pub include_patterns: Vec<String>,
    /// URL exclude patterns.
    pub exclude_patterns: Vec<String>,
    /// Delay in ms each worker waits before a request.
    pub rate_limit_ms: u64,
    /// Whether to respect robots.txt.
    pub respect_robots_txt: bool,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Overall run timeout in seconds.
    pub timeout_secs: u64,
    /// Minimum extracted content length in chars.
    pub min_content_chars: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for CrawlConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_pages: config.defaults.max_pages,
            concurrency: config.defaults.concurrency,
            max_depth: config.defaults.max_depth,
            include_patterns: config.crawl_policies.include_patterns.clone(),
            exclude_patterns: config.crawl_policies.exclude_patterns.clone(),
            rate_limit_ms: config.crawl_policies.rate_limit_ms,
            respect_robots_txt: config.crawl_policies.respect_robots_txt,
            request_timeout_secs: config.crawl_policies.request_timeout_secs,
            timeout_secs: config.defaults.timeout_secs,
            min_content_chars: config.crawl_policies.min_content_chars,
        }
    }
}

/// Runtime index build configuration.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub request_timeout_secs: u64,
    pub max_input_chars: usize,
    pub keep_generations: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for IndexConfig {
    fn from(config: &AppConfig) -> Self {
        let e = &config.embedding;
        Self {
            batch_size: e.batch_size.max(1),
            max_attempts: e.max_attempts.max(1),
            backoff_ms: e.backoff_ms,
            request_timeout_secs: e.request_timeout_secs,
            max_input_chars: e.max_input_chars,
            keep_generations: e.keep_generations.max(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.sitekb/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| SiteKbError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.sitekb/sitekb.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| SiteKbError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| SiteKbError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| SiteKbError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| SiteKbError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| SiteKbError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read a non-empty API key from the named env var.
pub fn read_api_key(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val.trim().to_string()),
        _ => Err(SiteKbError::config(format!(
            "API key not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("kb_dir"));
        assert!(toml_str.contains("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.defaults.concurrency, 16);
        assert_eq!(parsed.embedding.api_key_env, "OPENAI_API_KEY");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[defaults]
max_pages = 50

[crawl_policies]
include_patterns = ["blog", "guide"]
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.defaults.max_pages, 50);
        assert_eq!(config.defaults.max_depth, 3);
        assert_eq!(config.crawl_policies.include_patterns.len(), 2);
        assert!(config.crawl_policies.respect_robots_txt);
        assert_eq!(config.retrieval.top_k, 6);
    }

    #[test]
    fn crawl_config_from_app_config() {
        let crawl = CrawlConfig::from(&AppConfig::default());
        assert_eq!(crawl.max_pages, 200);
        assert_eq!(crawl.concurrency, 16);
        assert_eq!(crawl.min_content_chars, 200);
    }

    #[test]
    fn index_config_clamps_zeroes() {
        let mut app = AppConfig::default();
        app.embedding.batch_size = 0;
        app.embedding.max_attempts = 0;
        let index = IndexConfig::from(&app);
        assert_eq!(index.batch_size, 1);
        assert_eq!(index.max_attempts, 1);
    }

    #[test]
    fn api_key_missing() {
        // Use a unique env var name to avoid interfering with other tests
        let result = read_api_key("SITEKB_TEST_NONEXISTENT_KEY_12345");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }

    #[test]
    fn expand_home_leaves_absolute_paths() {
        assert_eq!(expand_home("/tmp/kb"), PathBuf::from("/tmp/kb"));
    }
}
