//! Cluster members and master election

use crate::protocol::DEFAULT_BACKUP_PORT;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Role a machine declares in its membership node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Serving as master
    Master,
    /// Replicating from a master
    Slave,
    /// Not yet decided
    #[default]
    Unknown,
}

/// A cluster member as published in the coordination service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    /// Unique machine id
    pub machine_id: i32,
    /// `host:port` of the master protocol endpoint
    pub server: String,
    /// Backup port; 0 means the default
    #[serde(default)]
    pub backup_port: u16,
    /// Last transaction committed to the main store
    #[serde(default)]
    pub last_committed_tx: u64,
    /// Declared role
    #[serde(default)]
    pub role: Role,
}

impl Machine {
    /// Machine `machine_id` reachable at `server`
    pub fn new(machine_id: i32, server: impl Into<String>) -> Self {
        Self {
            machine_id,
            server: server.into(),
            backup_port: 0,
            last_committed_tx: 0,
            role: Role::Unknown,
        }
    }

    /// Set the declared role
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Set the last committed transaction
    pub fn with_last_committed_tx(mut self, tx_id: u64) -> Self {
        self.last_committed_tx = tx_id;
        self
    }

    /// Set the backup port
    pub fn with_backup_port(mut self, port: u16) -> Self {
        self.backup_port = port;
        self
    }

    /// Split `server` into host and port
    pub fn host_and_port(&self) -> Result<(String, u16)> {
        let (host, port) = self
            .server
            .rsplit_once(':')
            .ok_or_else(|| Error::config(format!("server '{}' has no port", self.server)))?;
        let port = port
            .parse()
            .map_err(|_| Error::config(format!("server '{}' has an invalid port", self.server)))?;
        Ok((host.to_string(), port))
    }

    /// Backup port, falling back to the default
    pub fn effective_backup_port(&self) -> u16 {
        if self.backup_port == 0 {
            DEFAULT_BACKUP_PORT
        } else {
            self.backup_port
        }
    }
}

/// Pick the master among `machines`
///
/// Machines declaring the master role win, lowest id first. Otherwise the
/// machine with the highest last committed transaction wins, ties going to
/// the lowest id.
pub fn elect_master(machines: &[Machine]) -> Option<&Machine> {
    let declared = machines
        .iter()
        .filter(|m| m.role == Role::Master)
        .min_by_key(|m| m.machine_id);
    declared.or_else(|| {
        machines
            .iter()
            .max_by(|a, b| {
                a.last_committed_tx
                    .cmp(&b.last_committed_tx)
                    .then_with(|| b.machine_id.cmp(&a.machine_id))
            })
    })
}
