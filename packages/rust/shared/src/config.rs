//! Application configuration for Worldforge.
//!
//! User config lives at `~/.worldforge/worldforge.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WorldforgeError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "worldforge.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".worldforge";

// ---------------------------------------------------------------------------
// Config structs (matching worldforge.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Structured extractor settings.
    #[serde(default)]
    pub extractor: ExtractorConfig,

    /// Blob uploader settings.
    #[serde(default)]
    pub uploader: UploaderConfig,

    /// Batch pipeline tuning.
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Path to the rulebook/world database.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Category assigned to ingested rulebooks.
    #[serde(default = "default_category")]
    pub category: String,

    /// Genre assigned to assembled worlds.
    #[serde(default = "default_genre")]
    pub genre: String,

    /// `public` or `private`.
    #[serde(default = "default_visibility")]
    pub visibility: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            category: default_category(),
            genre: default_genre(),
            visibility: default_visibility(),
        }
    }
}

fn default_database_path() -> String {
    "~/.worldforge/worldforge.db".into()
}
fn default_category() -> String {
    "core_rules".into()
}
fn default_genre() -> String {
    "fantasy".into()
}
fn default_visibility() -> String {
    "private".into()
}

/// `[extractor]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL of the OpenAI-compatible API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model used for structured extraction.
    #[serde(default = "default_model")]
    pub model: String,

    /// HTTP client timeout.
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            model: default_model(),
            timeout_secs: default_http_timeout(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_model() -> String {
    "moonshotai/kimi-k2.5".into()
}
fn default_http_timeout() -> u64 {
    90
}

/// How uploaded files are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploaderMode {
    /// Content-addressed files under `blob_dir`.
    #[default]
    Local,
    /// POST to a remote blob endpoint.
    Http,
}

/// `[uploader]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploaderConfig {
    #[serde(default)]
    pub mode: UploaderMode,

    /// Directory for the local blob store.
    #[serde(default = "default_blob_dir")]
    pub blob_dir: String,

    /// Upload endpoint for `http` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Env var holding the bearer token for `http` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            mode: UploaderMode::default(),
            blob_dir: default_blob_dir(),
            endpoint: None,
            api_key_env: None,
        }
    }
}

fn default_blob_dir() -> String {
    "~/.worldforge/blobs".into()
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Attempts per external call (upload, extraction).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff unit; attempt `n` waits `n * base_delay_ms` before the next.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for a single upload or extraction call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Items processed concurrently within one batch. 1 keeps submission order.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Create the batch world even when no item succeeded.
    #[serde(default = "default_true")]
    pub assemble_empty_world: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            call_timeout_secs: default_call_timeout_secs(),
            workers: default_workers(),
            assemble_empty_world: true,
        }
    }
}

impl PipelineConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_call_timeout_secs() -> u64 {
    120
}
fn default_workers() -> usize {
    1
}
fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.worldforge/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| WorldforgeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.worldforge/worldforge.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| WorldforgeError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        WorldforgeError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| WorldforgeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| WorldforgeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| WorldforgeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Reject values the pipeline cannot run with.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.pipeline.max_attempts == 0 {
        return Err(WorldforgeError::config("pipeline.max_attempts must be at least 1"));
    }
    if config.pipeline.workers == 0 {
        return Err(WorldforgeError::config("pipeline.workers must be at least 1"));
    }
    if config.uploader.mode == UploaderMode::Http && config.uploader.endpoint.is_none() {
        return Err(WorldforgeError::config(
            "uploader.endpoint is required when uploader.mode = \"http\"",
        ));
    }
    config
        .defaults
        .visibility
        .parse::<crate::types::Visibility>()
        .map_err(WorldforgeError::config)?;
    Ok(())
}

/// Check that the extractor API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.extractor.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(WorldforgeError::config(format!(
            "extractor API key not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| WorldforgeError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}
