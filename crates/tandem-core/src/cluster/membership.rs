//! Read-only membership loaded from a file
//!
//! Lets tooling answer "who is master" for a cluster described in TOML,
//! without a live coordination service:
//!
//! ```toml
//! cluster_name = "tandem"
//!
//! [store_id]
//! creation_time = 1700000000000
//! random_id = 42
//! store_version = 1
//!
//! [[machines]]
//! machine_id = 1
//! server = "db1:6361"
//! role = "master"
//! ```

use crate::cluster::coordinator::{Coordinator, InMemoryCoordinator, SessionState};
use crate::cluster::machine::Machine;
use crate::store_id::StoreId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default cluster name
pub const DEFAULT_CLUSTER_NAME: &str = "tandem";

/// Contents of a membership file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    /// Cluster name
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    /// Store every member replicates
    pub store_id: StoreId,
    /// Members
    #[serde(default)]
    pub machines: Vec<Machine>,
}

fn default_cluster_name() -> String {
    DEFAULT_CLUSTER_NAME.to_string()
}

impl Membership {
    /// Parse TOML
    pub fn from_toml(content: &str) -> Result<Self> {
        let membership: Membership = toml::from_str(content)
            .map_err(|e| Error::config(format!("invalid membership: {}", e)))?;
        let mut ids: Vec<i32> = membership.machines.iter().map(|m| m.machine_id).collect();
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::config("duplicate machine id in membership"));
        }
        Ok(membership)
    }

    /// Read and parse a membership file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }
}

/// Coordinator answering reads from a fixed [`Membership`]
pub struct StaticCoordinator {
    inner: InMemoryCoordinator,
}

impl StaticCoordinator {
    /// Publish `membership` the way live members would
    pub fn new(membership: &Membership) -> Result<Self> {
        let inner = InMemoryCoordinator::new();
        inner.set_data(
            &format!("/{}", membership.cluster_name),
            &membership.store_id.serialize(),
        )?;
        let root = membership.store_id.root_path();
        for machine in &membership.machines {
            inner.set_data(
                &format!("{}/{}", root, machine.machine_id),
                &serde_json::to_vec(machine)?,
            )?;
        }
        Ok(Self { inner })
    }

    /// Load a membership file
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::new(&Membership::load(path)?)
    }

    fn read_only(path: &str) -> Error {
        Error::config(format!("static membership is read-only (write to {})", path))
    }
}

impl Coordinator for StaticCoordinator {
    fn state(&self) -> SessionState {
        SessionState::SyncConnected
    }

    fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get_data(path)
    }

    fn set_data(&self, path: &str, _data: &[u8]) -> Result<()> {
        Err(Self::read_only(path))
    }

    fn children(&self, path: &str) -> Result<Vec<String>> {
        self.inner.children(path)
    }

    fn create_ephemeral(&self, path: &str, _data: &[u8]) -> Result<()> {
        Err(Self::read_only(path))
    }

    fn delete(&self, path: &str) -> Result<()> {
        Err(Self::read_only(path))
    }

    fn sync(&self, _path: &str) -> Result<()> {
        Ok(())
    }
}
