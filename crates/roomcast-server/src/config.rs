//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (ROOMCAST_HOST, ROOMCAST_PORT)
//! - TOML configuration file

use anyhow::{Context, Result};
use roomcast_core::{
    ClusterConfig, CoordinatorConfig, FileStorage, MemoryStorage, PartitionConfig, Storage,
    DEFAULT_CAPACITY,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Coordinator configuration.
    #[serde(default)]
    pub coordinator: CoordinatorSection,

    /// Partition configuration.
    #[serde(default)]
    pub partition: PartitionSection,

    /// Durable storage configuration.
    #[serde(default)]
    pub storage: StorageSection,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSection {
    /// Connections a partition is filled to before a new one is allocated.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

/// Partition configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionSection {
    /// Drop empty rooms after this many idle seconds. Unset keeps rooms.
    #[serde(default)]
    pub room_idle_ttl_secs: Option<u64>,

    /// Seconds between idle-room sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Commands buffered per partition mailbox.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

/// Storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Kept in process memory.
    Memory,
    /// One file per key under `path`.
    File,
}

/// Durable storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// Backend to use.
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,

    /// Directory for the file backend. `~` is expanded.
    #[serde(default = "default_storage_path")]
    pub path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("ROOMCAST_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("ROOMCAST_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_mailbox_capacity() -> usize {
    1024
}

fn default_backend() -> StorageBackend {
    StorageBackend::Memory
}

fn default_storage_path() -> String {
    "~/.local/share/roomcast".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            coordinator: CoordinatorSection::default(),
            partition: PartitionSection::default(),
            storage: StorageSection::default(),
            limits: LimitsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

impl Default for PartitionSection {
    fn default() -> Self {
        Self {
            room_idle_ttl_secs: None,
            sweep_interval_secs: default_sweep_interval(),
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_storage_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "roomcast.toml",
            "/etc/roomcast/roomcast.toml",
            "~/.config/roomcast/roomcast.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.coordinator.capacity > 0, "coordinator.capacity must be positive");
        anyhow::ensure!(
            self.partition.sweep_interval_secs > 0,
            "partition.sweep_interval_secs must be positive"
        );
        anyhow::ensure!(
            self.partition.mailbox_capacity > 0,
            "partition.mailbox_capacity must be positive"
        );
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Coordinator and partition settings.
    #[must_use]
    pub fn cluster(&self) -> ClusterConfig {
        ClusterConfig {
            coordinator: CoordinatorConfig {
                capacity: self.coordinator.capacity,
            },
            partition: PartitionConfig {
                room_idle_ttl: self.partition.room_idle_ttl_secs.map(Duration::from_secs),
                sweep_interval: Duration::from_secs(self.partition.sweep_interval_secs),
                mailbox_capacity: self.partition.mailbox_capacity,
            },
        }
    }

    /// Open the configured storage backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the file backend's directory cannot be created.
    pub async fn open_storage(&self) -> Result<Arc<dyn Storage>> {
        match self.storage.backend {
            StorageBackend::Memory => Ok(Arc::new(MemoryStorage::new())),
            StorageBackend::File => {
                let path = PathBuf::from(shellexpand::tilde(&self.storage.path).as_ref());
                let storage = FileStorage::open(&path)
                    .await
                    .with_context(|| format!("Failed to open storage at {}", path.display()))?;
                Ok(Arc::new(storage))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.coordinator.capacity, 1000);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert!(config.partition.room_idle_ttl_secs.is_none());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config {
            host: "127.0.0.1".into(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [coordinator]
            capacity = 250

            [partition]
            room_idle_ttl_secs = 600

            [storage]
            backend = "file"
            path = "/var/lib/roomcast"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.storage.backend, StorageBackend::File);

        let cluster = config.cluster();
        assert_eq!(cluster.coordinator.capacity, 250);
        assert_eq!(cluster.partition.room_idle_ttl, Some(Duration::from_secs(600)));
        assert_eq!(cluster.partition.sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roomcast.toml");
        std::fs::write(&path, "[coordinator]\ncapacity = 0\n").unwrap();

        assert!(Config::from_file(&path).is_err());
    }

    #[tokio::test]
    async fn test_open_file_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            storage: StorageSection {
                backend: StorageBackend::File,
                path: dir.path().join("state").display().to_string(),
            },
            ..Config::default()
        };

        let storage = config.open_storage().await.unwrap();
        storage.put("k", bytes::Bytes::from_static(b"v")).await.unwrap();
        assert!(dir.path().join("state").join("k.bin").exists());
    }
}
