use rill_core::{RecordConfig, Result, RillError, StateRegistryConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server_name: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub record: RecordConfig,
    #[serde(default)]
    pub state: StateRegistryConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

fn default_bind_addr() -> String {
    "0.0.0.0:6020".to_string()
}

/// Cache backend configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,
    pub redis: Option<RedisConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

impl RedisConfig {
    pub fn namespace_or_default(&self) -> &str {
        self.namespace
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or("rill")
    }
}

/// Durable storage backend configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    pub sqlite: Option<SqliteConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Other nodes expected at startup; the registries wait for their full state.
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,
}

fn default_topics() -> Vec<String> {
    vec!["subscriptions".to_string(), "presence".to_string()]
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            topics: default_topics(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("RILL").separator("__"))
            .build()
            .map_err(|e| RillError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| RillError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_name.trim().is_empty() {
            return Err(RillError::Config("server_name cannot be empty".to_string()));
        }
        if self.cache.backend == CacheBackend::Redis && self.cache.redis.is_none() {
            return Err(RillError::Config(
                "redis configuration is required for redis cache backend".to_string(),
            ));
        }
        if self.storage.backend == StorageBackend::Sqlite && self.storage.sqlite.is_none() {
            return Err(RillError::Config(
                "sqlite configuration is required for sqlite storage backend".to_string(),
            ));
        }
        // Surface a bad exclusion pattern at startup rather than on first write.
        self.record.storage_exclusion()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let file = write_config("server_name: node-a\n");
        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();

        assert_eq!(config.server_name, "node-a");
        assert_eq!(config.bind_addr, "0.0.0.0:6020");
        assert_eq!(config.cache.backend, CacheBackend::Memory);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.state.check_sum_buffer_ms, 100);
        assert_eq!(config.state.state_reconciliation_timeout_ms, 500);
        assert_eq!(config.cluster.topics, default_topics());
        assert!(config.cluster.peers.is_empty());
    }

    #[test]
    fn test_full_config() {
        let file = write_config(
            r#"
server_name: node-a
bind_addr: 127.0.0.1:7000
cache:
  backend: redis
  redis:
    url: redis://127.0.0.1/
storage:
  backend: sqlite
  sqlite:
    path: /var/lib/rill/records.db
record:
  storage_exclusion: "^tmp/"
state:
  check_sum_buffer_ms: 20
  state_reconciliation_timeout_ms: 200
cluster:
  peers: [node-b, node-c]
  topics: [presence]
"#,
        );
        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();

        assert_eq!(config.cache.backend, CacheBackend::Redis);
        assert_eq!(
            config.cache.redis.as_ref().unwrap().namespace_or_default(),
            "rill"
        );
        assert_eq!(
            config.storage.sqlite.unwrap().path,
            PathBuf::from("/var/lib/rill/records.db")
        );
        assert_eq!(config.record.storage_exclusion.as_deref(), Some("^tmp/"));
        assert_eq!(config.state.check_sum_buffer_ms, 20);
        assert_eq!(config.cluster.peers, vec!["node-b", "node-c"]);
        assert_eq!(config.cluster.topics, vec!["presence"]);
    }

    #[test]
    fn test_backend_without_settings_is_rejected() {
        let file = write_config("server_name: node-a\nstorage:\n  backend: sqlite\n");
        let err = Config::from_file(file.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, RillError::Config(_)));

        let file = write_config("server_name: node-a\nrecord:\n  storage_exclusion: \"(\"\n");
        assert!(Config::from_file(file.path().to_str().unwrap()).is_err());
    }
}
