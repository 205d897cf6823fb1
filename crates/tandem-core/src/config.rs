//! Replication configuration
//!
//! Loaded from TOML with every field optional; `TANDEM_*` environment
//! variables override the file. Priority: environment > file > defaults.

use crate::cluster::DEFAULT_CLUSTER_NAME;
use crate::protocol::{DEFAULT_BACKUP_PORT, DEFAULT_MASTER_PORT};
use crate::retry::RetryConfig;
use crate::server::ServerConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration of one cluster member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Id of this machine, unique in the cluster
    pub machine_id: i32,

    /// Store directory
    pub store_dir: PathBuf,

    /// Address the master server binds
    pub master_addr: SocketAddr,

    /// `host:port` published to the cluster; derived from `master_addr` when unset
    pub advertised_server: Option<String>,

    /// Serve online backups
    pub backup_enabled: bool,

    /// Address the backup server binds
    pub backup_addr: SocketAddr,

    /// Cluster name, the root of the membership tree
    pub cluster_name: String,

    /// Static membership file used instead of a coordination service
    pub membership_file: Option<PathBuf>,

    /// Coordination session timeout in milliseconds
    pub session_timeout_ms: u64,

    /// Time a lock request waits on the master in milliseconds
    pub lock_timeout_ms: u64,

    /// Size of id ranges handed out by the master
    pub id_grab_size: u64,

    /// Worker threads per server
    pub workers: usize,

    /// Idle connection timeout in seconds
    pub idle_timeout_secs: u64,

    /// Pooled channels per remote master
    pub max_channels: usize,

    /// Wait for a free pooled channel in milliseconds
    pub checkout_timeout_ms: u64,

    /// Attempts to resolve the master before giving up
    pub master_resolution_attempts: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        Self {
            machine_id: 1,
            store_dir: PathBuf::from("./data"),
            master_addr: SocketAddr::new(any, DEFAULT_MASTER_PORT),
            advertised_server: None,
            backup_enabled: true,
            backup_addr: SocketAddr::new(any, DEFAULT_BACKUP_PORT),
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            membership_file: None,
            session_timeout_ms: 5_000,
            lock_timeout_ms: 20_000,
            id_grab_size: 1_000,
            workers: 20,
            idle_timeout_secs: 300,
            max_channels: 20,
            checkout_timeout_ms: 20_000,
            master_resolution_attempts: 5,
        }
    }
}

impl ReplicationConfig {
    /// Configuration for `machine_id` storing into `store_dir`
    pub fn new(machine_id: i32, store_dir: impl Into<PathBuf>) -> Self {
        Self {
            machine_id,
            store_dir: store_dir.into(),
            ..Default::default()
        }
    }

    /// Set the master bind address
    pub fn with_master_addr(mut self, addr: SocketAddr) -> Self {
        self.master_addr = addr;
        self
    }

    /// Set the backup bind address, enabling backups
    pub fn with_backup_addr(mut self, addr: SocketAddr) -> Self {
        self.backup_enabled = true;
        self.backup_addr = addr;
        self
    }

    /// Disable the backup server
    pub fn without_backup(mut self) -> Self {
        self.backup_enabled = false;
        self
    }

    /// Set the cluster name
    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = name.into();
        self
    }

    /// Use a static membership file
    pub fn with_membership_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.membership_file = Some(path.into());
        self
    }

    /// Set the published server address
    pub fn with_advertised_server(mut self, server: impl Into<String>) -> Self {
        self.advertised_server = Some(server.into());
        self
    }

    /// Load from a TOML file, apply environment overrides and validate
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env()?;
        config.validate()?;
        tracing::info!("Loaded replication configuration from {}", path.display());
        Ok(config)
    }

    /// Parse TOML without environment overrides
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(format!("invalid configuration: {}", e)))
    }

    /// Apply `TANDEM_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `TANDEM_*` overrides read through `lookup`
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .parse()
                .map_err(|_| Error::config(format!("invalid value '{}' for {}", value, key)))
        }

        if let Some(value) = lookup("TANDEM_MACHINE_ID") {
            self.machine_id = parse("TANDEM_MACHINE_ID", &value)?;
        }
        if let Some(value) = lookup("TANDEM_STORE_DIR") {
            self.store_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("TANDEM_MASTER_ADDR") {
            self.master_addr = parse("TANDEM_MASTER_ADDR", &value)?;
        }
        if let Some(value) = lookup("TANDEM_ADVERTISED_SERVER") {
            self.advertised_server = Some(value);
        }
        if let Some(value) = lookup("TANDEM_BACKUP_ENABLED") {
            self.backup_enabled = parse("TANDEM_BACKUP_ENABLED", &value)?;
        }
        if let Some(value) = lookup("TANDEM_BACKUP_ADDR") {
            self.backup_addr = parse("TANDEM_BACKUP_ADDR", &value)?;
        }
        if let Some(value) = lookup("TANDEM_CLUSTER_NAME") {
            self.cluster_name = value;
        }
        if let Some(value) = lookup("TANDEM_MEMBERSHIP_FILE") {
            self.membership_file = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("TANDEM_LOCK_TIMEOUT_MS") {
            self.lock_timeout_ms = parse("TANDEM_LOCK_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("TANDEM_WORKERS") {
            self.workers = parse("TANDEM_WORKERS", &value)?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.machine_id < 0 {
            return Err(Error::config("machine_id must not be negative"));
        }
        if self.cluster_name.is_empty() || self.cluster_name.contains('/') {
            return Err(Error::config(format!(
                "invalid cluster_name '{}'",
                self.cluster_name
            )));
        }
        if self.backup_enabled && self.backup_addr == self.master_addr {
            return Err(Error::config("backup_addr must differ from master_addr"));
        }
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.max_channels == 0 {
            return Err(Error::config("max_channels must be at least 1"));
        }
        if self.id_grab_size == 0 {
            return Err(Error::config("id_grab_size must be at least 1"));
        }
        if self.session_timeout_ms == 0 {
            return Err(Error::config("session_timeout_ms must be positive"));
        }
        if self.master_resolution_attempts == 0 {
            return Err(Error::config("master_resolution_attempts must be at least 1"));
        }
        if let Some(server) = &self.advertised_server {
            let valid = server
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !valid {
                return Err(Error::config(format!(
                    "advertised_server '{}' is not host:port",
                    server
                )));
            }
        }
        Ok(())
    }

    /// Address published to the cluster
    pub fn advertised(&self) -> String {
        match &self.advertised_server {
            Some(server) => server.clone(),
            None if self.master_addr.ip().is_unspecified() => {
                format!("127.0.0.1:{}", self.master_addr.port())
            }
            None => self.master_addr.to_string(),
        }
    }

    /// Coordination session timeout
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// Lock wait on the master
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Channel checkout wait
    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }

    /// Server tuning derived from this configuration
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            workers: self.workers,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }

    /// Backoff used while resolving the master
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.master_resolution_attempts,
            ..RetryConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = ReplicationConfig::default();
        assert_eq!(config.master_addr.port(), 6361);
        assert_eq!(config.backup_addr.port(), 6362);
        assert_eq!(config.cluster_name, "tandem");
        assert!(config.validate().is_ok());
        assert_eq!(config.advertised(), "127.0.0.1:6361");
    }

    #[test]
    fn test_partial_toml() {
        let config = ReplicationConfig::from_toml(
            r#"
            machine_id = 3
            store_dir = "/var/lib/tandem"
            master_addr = "10.0.0.3:7000"
            backup_enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.machine_id, 3);
        assert_eq!(config.store_dir, PathBuf::from("/var/lib/tandem"));
        assert_eq!(config.advertised(), "10.0.0.3:7000");
        assert!(!config.backup_enabled);
        assert_eq!(config.workers, 20);
    }

    #[test]
    fn test_unknown_values_rejected() {
        assert!(ReplicationConfig::from_toml("machine_id = \"one\"").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TANDEM_MACHINE_ID", "7"),
            ("TANDEM_CLUSTER_NAME", "prod"),
            ("TANDEM_BACKUP_ENABLED", "false"),
        ]
        .into_iter()
        .collect();
        let mut config = ReplicationConfig::default();
        config
            .apply_env_from(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.machine_id, 7);
        assert_eq!(config.cluster_name, "prod");
        assert!(!config.backup_enabled);

        let err = config
            .apply_env_from(|key| (key == "TANDEM_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validation() {
        let base = ReplicationConfig::new(1, "/tmp/x");
        assert!(base.clone().with_cluster_name("a/b").validate().is_err());
        assert!(base.clone().with_advertised_server("nohost").validate().is_err());
        assert!(base.clone().with_advertised_server("db1:6361").validate().is_ok());

        let clash = base.clone().with_backup_addr(base.master_addr);
        assert!(clash.validate().is_err());
        assert!(clash.without_backup().validate().is_ok());

        let mut negative = base;
        negative.machine_id = -1;
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tandem.toml");
        std::fs::write(&path, "machine_id = 2\nworkers = 4\n").unwrap();
        let config = ReplicationConfig::from_file(&path).unwrap();
        assert_eq!(config.machine_id, 2);
        assert_eq!(config.server_config().workers, 4);
        assert!(ReplicationConfig::from_file(dir.path().join("missing.toml")).is_err());
    }
}
