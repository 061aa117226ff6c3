//! Application configuration for Treeward.
//!
//! User config lives at `~/.treeward/treeward.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TreewardError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "treeward.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".treeward";

// ---------------------------------------------------------------------------
// Config structs (matching treeward.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Embedding model settings.
    #[serde(default)]
    pub embeddings: EmbeddingConfig,

    /// Technique matching settings.
    #[serde(default)]
    pub matching: MatchingConfig,

    /// Filesystem locations.
    #[serde(default)]
    pub paths: PathsConfig,

    /// External agent bridge settings.
    #[serde(default)]
    pub agents: AgentsConfig,

    /// Progress event emission.
    #[serde(default)]
    pub progress: ProgressConfig,
}

/// Which embedding backend produces vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Offline deterministic feature-hashing embedder.
    #[default]
    Hashing,
    /// Ollama `/api/embed` endpoint.
    Ollama,
    /// OpenAI-compatible `/v1/embeddings` endpoint.
    OpenAi,
}

/// `[embeddings]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Backend provider.
    #[serde(default)]
    pub provider: EmbeddingProvider,

    /// Model identifier. Stored in every graph built with it.
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Vector length. Required for HTTP providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension: Option<usize>,

    /// Base URL for HTTP providers.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Texts per request when embedding in batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::default(),
            model: default_embedding_model(),
            dimension: None,
            endpoint: default_endpoint(),
            api_key_env: default_api_key_env(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_embedding_model() -> String {
    "hashing-384".into()
}
fn default_endpoint() -> String {
    "http://localhost:11434".into()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_batch_size() -> usize {
    32
}

/// Dimension used by the hashing provider when none is configured.
pub const DEFAULT_HASHING_DIMENSION: usize = 384;

/// `[matching]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Whether the mapping stage runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum similarity a technique match must reach.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,

    /// Candidate techniques per attack step.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_similarity: default_min_similarity(),
            top_k: default_top_k(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_min_similarity() -> f32 {
    0.3
}
fn default_top_k() -> usize {
    2
}

/// `[paths]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding workflow checkpoints.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Directory holding cached technique graphs.
    #[serde(default = "default_graph_dir")]
    pub graph_dir: String,

    /// Threat-intelligence (STIX) bundle the graph is built from.
    #[serde(default = "default_bundle")]
    pub bundle: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            graph_dir: default_graph_dir(),
            bundle: default_bundle(),
        }
    }
}

fn default_state_dir() -> String {
    "~/.treeward/state".into()
}
fn default_graph_dir() -> String {
    "~/.treeward/graphs".into()
}
fn default_bundle() -> String {
    "~/.treeward/data/enterprise-attack.json".into()
}

impl PathsConfig {
    /// Resolved checkpoint directory.
    pub fn state_dir(&self) -> PathBuf {
        expand_home(&self.state_dir)
    }

    /// Resolved graph cache directory.
    pub fn graph_dir(&self) -> PathBuf {
        expand_home(&self.graph_dir)
    }

    /// Resolved bundle path.
    pub fn bundle(&self) -> PathBuf {
        expand_home(&self.bundle)
    }

    /// Graph file for a given embedding model. One file per model so that
    /// switching models does not clobber another model's cache.
    pub fn graph_file(&self, embedding_model: &str) -> PathBuf {
        let sanitized: String = embedding_model
            .chars()
            .map(|c| if c == '/' || c == '\\' || c == ':' { '_' } else { c })
            .collect();
        self.graph_dir()
            .join(format!("technique_graph_{sanitized}.json"))
    }
}

/// `[agents]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Bridge command (e.g., "python3", "bun").
    #[serde(default = "default_bridge_cmd")]
    pub bridge_cmd: String,

    /// Arguments passed before the bridge script.
    #[serde(default)]
    pub bridge_args: Vec<String>,

    /// Bridge script path.
    #[serde(default = "default_bridge_script")]
    pub bridge_script: String,

    /// Working directory for the bridge subprocess. Defaults to the cwd.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    /// Language model the agents should use.
    #[serde(default = "default_agent_model")]
    pub model: String,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            bridge_cmd: default_bridge_cmd(),
            bridge_args: Vec::new(),
            bridge_script: default_bridge_script(),
            working_dir: None,
            model: default_agent_model(),
        }
    }
}

fn default_bridge_cmd() -> String {
    "python3".into()
}
fn default_bridge_script() -> String {
    "agents/bridge.py".into()
}
fn default_agent_model() -> String {
    "anthropic.claude-sonnet".into()
}

/// `[progress]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Emit `PROGRESS:` event lines on stdout for an observing process.
    #[serde(default)]
    pub enabled: bool,
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

/// Get the path to the config directory (`~/.treeward/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| TreewardError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.treeward/treeward.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| TreewardError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| TreewardError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| TreewardError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| TreewardError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| TreewardError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the embedding provider is usable before any model is loaded.
pub fn validate_embeddings(config: &EmbeddingConfig) -> Result<()> {
    if config.batch_size == 0 {
        return Err(TreewardError::config("embeddings.batch_size must be at least 1"));
    }

    match config.provider {
        EmbeddingProvider::Hashing => {
            if config.dimension == Some(0) {
                return Err(TreewardError::config("embeddings.dimension must be at least 1"));
            }
            Ok(())
        }
        EmbeddingProvider::Ollama | EmbeddingProvider::OpenAi => {
            match config.dimension {
                Some(d) if d > 0 => {}
                _ => {
                    return Err(TreewardError::config(format!(
                        "embeddings.dimension is required for the {:?} provider",
                        config.provider
                    )));
                }
            }
            if config.provider == EmbeddingProvider::OpenAi {
                let var_name = &config.api_key_env;
                match std::env::var(var_name) {
                    Ok(val) if !val.is_empty() => {}
                    _ => {
                        return Err(TreewardError::config(format!(
                            "embedding API key not found. Set the {var_name} environment variable."
                        )));
                    }
                }
            }
            Ok(())
        }
    }
}
