//! Configuration management for SchemaFlow
//!
//! Project-level settings for the retry policy, stream deadline, checkpoint
//! storage, the HTTP server and the agent endpoint.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::Result;

const CONFIG_DIR: &str = ".schemaflow";
const CONFIG_FILE: &str = "config.toml";

/// Project-level SchemaFlow configuration
///
/// Loaded from `.schemaflow/config.toml` in the project root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub agent: AgentEndpointConfig,
}

/// Stage retry policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failures a stage may accumulate and still be re-attempted
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Whether a stage with `failures` recorded failures may run again
    pub fn allows_retry(&self, failures: u32) -> bool {
        failures <= self.max_retries
    }
}

/// Stream delivery settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Wall-clock budget for one streamed run
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl StreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Checkpoint storage settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the per-thread checkpoint logs (relative to project root)
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
}

/// HTTP server settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Remote agent endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEndpointConfig {
    /// Base URL; each agent is reached at `{base_url}/agents/{name}`
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Environment variable containing the bearer token
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

// Default value providers
fn default_max_retries() -> u32 {
    3
}

fn default_timeout_ms() -> u64 {
    // Long model calls: allow up to 10 minutes per run
    600_000
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".schemaflow/checkpoints")
}

fn default_port() -> u16 {
    7171
}

fn default_base_url() -> String {
    "http://localhost:8787".to_string()
}

fn default_api_key_env() -> String {
    "SCHEMAFLOW_AGENT_TOKEN".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl WorkflowConfig {
    /// Path of the config file under a project root
    pub fn path(root: &Path) -> PathBuf {
        root.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Load configuration from `.schemaflow/config.toml` or use defaults
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let config_path = Self::path(root);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| {
            crate::FlowError::Config(format!("Failed to parse config file: {}", e))
        })
    }

    /// Write default configuration to `.schemaflow/config.toml`
    pub fn write_default(root: &Path) -> Result<PathBuf> {
        let config_dir = root.join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join(CONFIG_FILE);
        let content = toml::to_string_pretty(&Self::default()).map_err(|e| {
            crate::FlowError::Config(format!("Failed to serialize config: {}", e))
        })?;
        std::fs::write(&config_path, content)?;
        Ok(config_path)
    }

    /// Checkpoint directory resolved against the project root
    pub fn checkpoint_dir(&self, root: &Path) -> PathBuf {
        if self.storage.checkpoint_dir.is_absolute() {
            self.storage.checkpoint_dir.clone()
        } else {
            root.join(&self.storage.checkpoint_dir)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: default_checkpoint_dir(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for AgentEndpointConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}
