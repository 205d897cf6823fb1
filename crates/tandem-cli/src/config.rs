//! Configuration loading for commands

use anyhow::{Context, Result};
use std::path::Path;
use tandem_core::ReplicationConfig;

/// Load the replication configuration
///
/// Reads `path` when given; otherwise starts from the defaults. Environment
/// overrides apply either way.
pub fn load(path: Option<&Path>) -> Result<ReplicationConfig> {
    match path {
        Some(path) => ReplicationConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => {
            let mut config = ReplicationConfig::default();
            config.apply_env()?;
            config.validate()?;
            Ok(config)
        }
    }
}

/// Split `host:port`
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16)> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .with_context(|| format!("'{}' is not host:port", endpoint))?;
    let port = port
        .parse()
        .with_context(|| format!("invalid port in '{}'", endpoint))?;
    Ok((host.to_string(), port))
}
