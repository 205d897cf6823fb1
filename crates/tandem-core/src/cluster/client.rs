//! Cluster membership client

use crate::cluster::coordinator::{Coordinator, SessionState};
use crate::cluster::machine::{Machine, elect_master};
use crate::store_id::StoreId;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Interval between session state checks while waiting for a connection
pub const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default coordination session timeout
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Answers membership questions from the coordination service
///
/// The cluster node `/<cluster_name>` holds the serialized [`StoreId`];
/// members publish ephemeral nodes `/<creation>_<random>/<machine_id>`
/// holding [`Machine`] JSON.
pub struct ClusterClient {
    coordinator: Arc<dyn Coordinator>,
    cluster_name: String,
    session_timeout: Duration,
    root: Mutex<Option<String>>,
}

impl ClusterClient {
    /// Client for `cluster_name`
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        cluster_name: impl Into<String>,
        session_timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            cluster_name: cluster_name.into(),
            session_timeout,
            root: Mutex::new(None),
        }
    }

    /// Cluster name
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Block until the session is synchronized
    ///
    /// Polls every 100 ms for at most the session timeout.
    pub fn wait_for_sync_connected(&self) -> Result<()> {
        let start = Instant::now();
        loop {
            let state = self.coordinator.state();
            if state == SessionState::SyncConnected {
                return Ok(());
            }
            if start.elapsed() >= self.session_timeout {
                return Err(Error::CoordinationUnavailable(format!(
                    "no synchronized session within {:?} (state {:?})",
                    self.session_timeout, state
                )));
            }
            std::thread::sleep(SYNC_POLL_INTERVAL);
        }
    }

    /// Store id the cluster was created for, `None` if it does not exist
    pub fn cluster_store_id(&self) -> Result<Option<StoreId>> {
        self.wait_for_sync_connected()?;
        match self
            .coordinator
            .get_data(&format!("/{}", self.cluster_name))?
        {
            Some(bytes) => Ok(Some(StoreId::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Root path of the member nodes, `None` if the cluster does not exist
    ///
    /// Waits for a synchronized session even when the root is cached, so
    /// every membership query rides out a short disconnection.
    pub fn root(&self) -> Result<Option<String>> {
        self.wait_for_sync_connected()?;
        if let Some(root) = self.root.lock().clone() {
            return Ok(Some(root));
        }
        let root = self.cluster_store_id()?.map(|id| id.root_path());
        if let Some(root) = &root {
            *self.root.lock() = Some(root.clone());
        }
        Ok(root)
    }

    /// Create the cluster node for `store_id` unless it already exists
    ///
    /// Fails with [`Error::StoreIdMismatch`] if the cluster exists for
    /// another store.
    pub fn create_cluster(&self, store_id: &StoreId) -> Result<String> {
        match self.cluster_store_id()? {
            Some(existing) if existing != *store_id => {
                return Err(Error::StoreIdMismatch {
                    expected: existing.to_string(),
                    actual: store_id.to_string(),
                });
            }
            Some(_) => {}
            None => {
                self.coordinator
                    .set_data(&format!("/{}", self.cluster_name), &store_id.serialize())?;
                tracing::info!("Created cluster {} for store {}", self.cluster_name, store_id);
            }
        }
        let root = store_id.root_path();
        *self.root.lock() = Some(root.clone());
        Ok(root)
    }

    /// Every registered machine, ordered by id
    pub fn machines(&self) -> Result<Vec<Machine>> {
        let Some(root) = self.root()? else {
            return Ok(Vec::new());
        };
        self.coordinator.sync(&root)?;
        let mut machines = Vec::new();
        for child in self.coordinator.children(&root)? {
            // A member may leave between listing and reading.
            let Some(data) = self.coordinator.get_data(&format!("{}/{}", root, child))? else {
                continue;
            };
            let machine: Machine = serde_json::from_slice(&data)?;
            machines.push(machine);
        }
        machines.sort_by_key(|m| m.machine_id);
        Ok(machines)
    }

    /// The current master, `None` if there is no cluster or no member
    pub fn master(&self) -> Result<Option<Machine>> {
        let machines = self.machines()?;
        Ok(elect_master(&machines).cloned())
    }

    /// Connect to the current master through `factory`
    pub fn master_client<M, F>(&self, factory: F) -> Result<(M, Machine)>
    where
        F: FnOnce(&Machine) -> Result<M>,
    {
        let master = self
            .master()?
            .ok_or_else(|| Error::MasterNotFound(format!("cluster {}", self.cluster_name)))?;
        let client = factory(&master)?;
        Ok((client, master))
    }

    /// Every member except the master
    pub fn connected_slaves(&self) -> Result<Vec<Machine>> {
        let machines = self.machines()?;
        let master_id = elect_master(&machines).map(|m| m.machine_id);
        Ok(machines
            .into_iter()
            .filter(|m| Some(m.machine_id) != master_id)
            .collect())
    }

    /// Backup port of `machine_id`, falling back to the default
    pub fn backup_port(&self, machine_id: i32) -> Result<u16> {
        self.machines()?
            .iter()
            .find(|m| m.machine_id == machine_id)
            .map(Machine::effective_backup_port)
            .ok_or_else(|| {
                Error::CoordinationUnavailable(format!(
                    "machine {} is not registered in cluster {}",
                    machine_id, self.cluster_name
                ))
            })
    }

    /// Publish `machine` as a member for the lifetime of the session
    pub fn register(&self, machine: &Machine) -> Result<()> {
        let root = self.root()?.ok_or_else(|| {
            Error::CoordinationUnavailable(format!("cluster {} does not exist", self.cluster_name))
        })?;
        let path = format!("{}/{}", root, machine.machine_id);
        self.coordinator.delete(&path)?;
        self.coordinator
            .create_ephemeral(&path, &serde_json::to_vec(machine)?)?;
        tracing::info!(
            "Registered machine {} ({:?}) at {}",
            machine.machine_id,
            machine.role,
            machine.server
        );
        Ok(())
    }

    /// Remove `machine_id` from the membership
    pub fn unregister(&self, machine_id: i32) -> Result<()> {
        if let Some(root) = self.root()? {
            self.coordinator.delete(&format!("{}/{}", root, machine_id))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::coordinator::InMemoryCoordinator;
    use crate::cluster::machine::Role;
    use crate::protocol::DEFAULT_BACKUP_PORT;

    fn cluster() -> (Arc<InMemoryCoordinator>, ClusterClient) {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let client = ClusterClient::new(coordinator.clone(), "test", Duration::from_millis(300));
        (coordinator, client)
    }

    #[test]
    fn test_missing_cluster_has_no_master() {
        let (_coordinator, client) = cluster();
        assert!(client.root().unwrap().is_none());
        assert!(client.master().unwrap().is_none());
        let err = client.master_client(|_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::MasterNotFound(_)));
    }

    #[test]
    fn test_master_and_slaves() {
        let (_coordinator, client) = cluster();
        let store_id = StoreId::new(10, 20, 1);
        assert_eq!(client.create_cluster(&store_id).unwrap(), "/10_20");

        client
            .register(&Machine::new(1, "a:6361").with_role(Role::Master))
            .unwrap();
        client
            .register(&Machine::new(2, "b:6361").with_backup_port(7000))
            .unwrap();
        client.register(&Machine::new(3, "c:6361")).unwrap();

        assert_eq!(client.master().unwrap().unwrap().machine_id, 1);
        let slaves: Vec<i32> = client
            .connected_slaves()
            .unwrap()
            .iter()
            .map(|m| m.machine_id)
            .collect();
        assert_eq!(slaves, vec![2, 3]);
        assert_eq!(client.backup_port(2).unwrap(), 7000);
        assert_eq!(client.backup_port(3).unwrap(), DEFAULT_BACKUP_PORT);
        assert!(client.backup_port(9).is_err());

        let (server, master) = client.master_client(|m| Ok(m.server.clone())).unwrap();
        assert_eq!(server, "a:6361");
        assert_eq!(master.machine_id, 1);
    }

    #[test]
    fn test_cluster_for_other_store_rejected() {
        let (_coordinator, client) = cluster();
        client.create_cluster(&StoreId::new(1, 1, 1)).unwrap();
        let err = client.create_cluster(&StoreId::new(2, 2, 1)).unwrap_err();
        assert!(matches!(err, Error::StoreIdMismatch { .. }));
    }

    #[test]
    fn test_wait_for_sync_connected_times_out() {
        let (coordinator, client) = cluster();
        coordinator.disconnect();
        let started = Instant::now();
        let err = client.wait_for_sync_connected().unwrap_err();
        assert!(matches!(err, Error::CoordinationUnavailable(_)));
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn test_wait_for_sync_connected_recovers() {
        let (coordinator, client) = cluster();
        coordinator.disconnect();
        let reconnect = {
            let coordinator = coordinator.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(120));
                coordinator.reconnect();
            })
        };
        client.wait_for_sync_connected().unwrap();
        reconnect.join().unwrap();
    }

    #[test]
    fn test_master_query_waits_out_disconnection() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let client = ClusterClient::new(coordinator.clone(), "test", Duration::from_secs(2));
        client.create_cluster(&StoreId::new(3, 4, 1)).unwrap();
        client
            .register(&Machine::new(1, "a:6361").with_role(Role::Master))
            .unwrap();
        assert_eq!(client.master().unwrap().unwrap().machine_id, 1);

        // The root is cached now; the next query must still wait for the session.
        coordinator.disconnect();
        let reconnect = {
            let coordinator = coordinator.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(250));
                coordinator.reconnect();
            })
        };
        let started = Instant::now();
        assert_eq!(client.master().unwrap().unwrap().machine_id, 1);
        assert!(started.elapsed() >= Duration::from_millis(200));
        reconnect.join().unwrap();

        coordinator.disconnect();
        let err = ClusterClient::new(coordinator.clone(), "test", Duration::from_millis(150))
            .backup_port(1)
            .unwrap_err();
        assert!(matches!(err, Error::CoordinationUnavailable(_)));
    }
}
