use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 3000;

/// Top-level config (atlas.toml + ATLAS_* env overrides).
///
/// The recognised key set is closed: anything the assistant needs at runtime
/// is either here or hard-coded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtlasConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: ServerConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub directions: DirectionsConfig,
    /// Base URL of the browser UI, used to build notification click-through
    /// links (`<app_url>/threads/<id>`). Links are omitted when unset.
    #[serde(default)]
    pub app_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// tracing filter level: fatal..trace.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API key for the chat + embeddings provider.
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// Bound on the agent tool-call loop.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

/// Push notification target. Both fields absent means notifications are
/// silently dropped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushConfig {
    pub endpoint: Option<String>,
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectionsConfig {
    /// Enables the `directions` tool and the `departure-check` skill.
    pub api_key: Option<String>,
}

impl AtlasConfig {
    /// Load config: explicit path > ATLAS_CONFIG env > ./atlas.toml,
    /// then ATLAS_* environment overrides (double underscore nesting,
    /// e.g. `ATLAS_LLM__API_KEY`).
    pub fn load(path: Option<&str>) -> Result<Self> {
        let path = path
            .map(String::from)
            .or_else(|| std::env::var("ATLAS_CONFIG").ok())
            .unwrap_or_else(|| "atlas.toml".to_string());

        let config: AtlasConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("ATLAS_").split("__"))
            .extract()
            .map_err(|e| Error::validation(format!("config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(Error::validation("database.path must not be empty"));
        }
        if self.llm.api_key.trim().is_empty() {
            return Err(Error::validation("llm.api_key must not be empty"));
        }
        Ok(())
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_max_iterations() -> u32 {
    25
}
