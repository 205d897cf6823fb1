//! Coordination service boundary

use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;

/// Session state of a coordination client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected and synchronized
    SyncConnected,
    /// Temporarily disconnected
    Disconnected,
    /// Session lost; ephemeral nodes are gone
    Expired,
}

/// Hierarchical key/value store with ephemeral nodes
///
/// Paths are absolute, `/`-separated, without a trailing slash.
pub trait Coordinator: Send + Sync {
    /// Current session state
    fn state(&self) -> SessionState;

    /// Data of a node, `None` if it does not exist
    fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Create or overwrite a persistent node
    fn set_data(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Names of the direct children of a node, sorted
    fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Create a node that disappears with the session
    fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Remove a node; removing a missing node is not an error
    fn delete(&self, path: &str) -> Result<()>;

    /// Wait until this client's view of `path` is up to date
    fn sync(&self, path: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    ephemeral: bool,
}

/// Coordinator living in this process
///
/// Shared by every cluster client of a single-process cluster and by tests,
/// which drive its session state with [`disconnect`](Self::disconnect),
/// [`reconnect`](Self::reconnect) and [`expire`](Self::expire).
#[derive(Debug)]
pub struct InMemoryCoordinator {
    nodes: RwLock<BTreeMap<String, Node>>,
    state: Mutex<SessionState>,
}

impl InMemoryCoordinator {
    /// Connected coordinator with no nodes
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            state: Mutex::new(SessionState::SyncConnected),
        }
    }

    /// Drop the connection; calls fail until reconnected
    pub fn disconnect(&self) {
        *self.state.lock() = SessionState::Disconnected;
    }

    /// Restore the connection
    pub fn reconnect(&self) {
        *self.state.lock() = SessionState::SyncConnected;
    }

    /// Expire the session, deleting every ephemeral node
    pub fn expire(&self) {
        *self.state.lock() = SessionState::Expired;
        self.nodes.write().retain(|_, node| !node.ephemeral);
    }

    fn connected(&self) -> Result<()> {
        match *self.state.lock() {
            SessionState::SyncConnected => Ok(()),
            state => Err(Error::CoordinationUnavailable(format!(
                "coordination session is {:?}",
                state
            ))),
        }
    }
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

fn check_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) {
        return Err(Error::config(format!("invalid coordination path '{}'", path)));
    }
    Ok(())
}

impl Coordinator for InMemoryCoordinator {
    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.connected()?;
        check_path(path)?;
        Ok(self.nodes.read().get(path).map(|node| node.data.clone()))
    }

    fn set_data(&self, path: &str, data: &[u8]) -> Result<()> {
        self.connected()?;
        check_path(path)?;
        let mut nodes = self.nodes.write();
        let node = nodes.entry(path.to_string()).or_insert(Node {
            data: Vec::new(),
            ephemeral: false,
        });
        node.data = data.to_vec();
        Ok(())
    }

    fn children(&self, path: &str) -> Result<Vec<String>> {
        self.connected()?;
        check_path(path)?;
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        // Intermediate nodes exist implicitly.
        let nodes = self.nodes.read();
        let mut names: Vec<String> = nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| key[prefix.len()..].split('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        names.dedup();
        Ok(names)
    }

    fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<()> {
        self.connected()?;
        check_path(path)?;
        let mut nodes = self.nodes.write();
        if nodes.contains_key(path) {
            return Err(Error::config(format!("node {} already exists", path)));
        }
        nodes.insert(
            path.to_string(),
            Node {
                data: data.to_vec(),
                ephemeral: true,
            },
        );
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.connected()?;
        check_path(path)?;
        self.nodes.write().remove(path);
        Ok(())
    }

    fn sync(&self, path: &str) -> Result<()> {
        self.connected()?;
        check_path(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_children_are_direct_only() {
        let coordinator = InMemoryCoordinator::new();
        coordinator.set_data("/tandem", b"id").unwrap();
        coordinator.create_ephemeral("/1_2/1", b"a").unwrap();
        coordinator.create_ephemeral("/1_2/2", b"b").unwrap();
        coordinator.set_data("/1_2/2/deeper", b"c").unwrap();
        coordinator.set_data("/1_20", b"other root").unwrap();

        assert_eq!(coordinator.children("/1_2").unwrap(), vec!["1", "2"]);
        assert_eq!(coordinator.children("/").unwrap(), vec!["1_2", "1_20", "tandem"]);
    }

    #[test]
    fn test_expire_drops_ephemeral_nodes() {
        let coordinator = InMemoryCoordinator::new();
        coordinator.set_data("/tandem", b"id").unwrap();
        coordinator.create_ephemeral("/root/1", b"a").unwrap();
        coordinator.expire();
        assert!(coordinator.get_data("/tandem").is_err());
        coordinator.reconnect();
        assert!(coordinator.get_data("/root/1").unwrap().is_none());
        assert_eq!(coordinator.get_data("/tandem").unwrap(), Some(b"id".to_vec()));
    }

    #[test]
    fn test_disconnected_calls_fail() {
        let coordinator = InMemoryCoordinator::new();
        coordinator.disconnect();
        let err = coordinator.children("/").unwrap_err();
        assert!(err.is_retryable());
    }
}
