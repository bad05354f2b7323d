use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from kaf-monitor.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MonitorConfig {
    pub consumer: ConsumerConfig,
    pub brokers: BrokersConfig,
    pub node: NodeConfig,
    pub poll: PollConfig,
}

/// How the remote consumer client is invoked.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub command: String,
    /// Name matched when killing the client on stop.
    pub process_name: String,
    pub start_offset: String,
    pub record_limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokersConfig {
    pub addresses: Vec<String>,
}

/// The node the consumer runs on. No `host` means the local machine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    pub host: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub ssh_command: String,
    pub ssh_options: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub timeout_secs: u64,
}

// --- Default implementations ---

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            command: "kaf".to_string(),
            process_name: "kaf".to_string(),
            start_offset: "newest".to_string(),
            record_limit: None,
        }
    }
}

impl Default for BrokersConfig {
    fn default() -> Self {
        Self {
            addresses: vec!["localhost:9092".to_string()],
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "consumer-0".to_string(),
            host: None,
            user: None,
            port: None,
            ssh_command: "ssh".to_string(),
            ssh_options: vec!["-o".to_string(), "BatchMode=yes".to_string()],
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 200,
            timeout_secs: 60,
        }
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl MonitorConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}
