//! Master resolution for slaves
//!
//! A [`MasterBroker`] keeps a client to the current master and reissues a
//! call against a freshly resolved master when the old one stepped down or
//! became unreachable. Branch errors are returned immediately.

use crate::cluster::{ClusterClient, Machine};
use crate::master::{Master, MasterClient};
use crate::retry::{RetryConfig, retry, retry_with_stats};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Builds a master client for a resolved machine
pub type MasterConnector = Box<dyn Fn(&Machine) -> Result<Arc<dyn Master>> + Send + Sync>;

/// Resolves and caches the current master
pub struct MasterBroker {
    cluster: Arc<ClusterClient>,
    connector: MasterConnector,
    retry: RetryConfig,
    current: Mutex<Option<(Arc<dyn Master>, Machine)>>,
    resolutions: AtomicU64,
}

impl MasterBroker {
    /// Broker connecting through `connector`
    pub fn new(cluster: Arc<ClusterClient>, retry: RetryConfig, connector: MasterConnector) -> Self {
        Self {
            cluster,
            connector,
            retry,
            current: Mutex::new(None),
            resolutions: AtomicU64::new(0),
        }
    }

    /// Broker connecting to masters over TCP
    pub fn tcp(cluster: Arc<ClusterClient>, retry: RetryConfig) -> Self {
        Self::new(
            cluster,
            retry,
            Box::new(|machine: &Machine| -> Result<Arc<dyn Master>> {
                let (host, port) = machine.host_and_port()?;
                let client = MasterClient::connect(host, port, machine.machine_id);
                Ok(Arc::new(client) as Arc<dyn Master>)
            }),
        )
    }

    /// Number of times the master was resolved
    pub fn resolutions(&self) -> u64 {
        self.resolutions.load(Ordering::Relaxed)
    }

    /// Current master, resolving it if needed
    ///
    /// Resolution is retried with backoff while no master can be found or
    /// the coordination service is unavailable.
    pub fn master(&self) -> Result<(Arc<dyn Master>, Machine)> {
        if let Some((master, machine)) = self.current.lock().as_ref() {
            return Ok((master.clone(), machine.clone()));
        }

        let (master, machine) = retry(&self.retry, "master resolution", |_| {
            self.cluster
                .master_client(|machine| (self.connector)(machine))
        })?;
        self.resolutions.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "Resolved master to machine {} at {}",
            machine.machine_id,
            machine.server
        );
        *self.current.lock() = Some((master.clone(), machine.clone()));
        Ok((master, machine))
    }

    /// Forget the cached master
    pub fn invalidate(&self) {
        if let Some((_, machine)) = self.current.lock().take() {
            tracing::info!("Dropping master machine {}", machine.machine_id);
        }
    }

    /// Run `operation` against the master, re-resolving on
    /// [`Error::NotMaster`] and communication failures
    pub fn call<T, F>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut(&dyn Master) -> Result<T>,
    {
        // A failed resolution already went through its own retries.
        let resolved = Cell::new(true);
        let (result, stats) = retry_with_stats(
            &self.retry,
            "master call",
            |e| resolved.get() && e.requires_master_resolution(),
            |_| {
                let (master, machine) = self.master().inspect_err(|_| resolved.set(false))?;
                operation(master.as_ref()).inspect_err(|e| {
                    if matches!(e, Error::BranchedData(_)) {
                        tracing::error!(
                            "Branched data detected against master {}: {}",
                            machine.machine_id,
                            e
                        );
                    } else if e.requires_master_resolution() {
                        tracing::warn!(
                            "Call to master {} failed, resolving again: {}",
                            machine.machine_id,
                            e
                        );
                        self.invalidate();
                    }
                })
            },
        );
        if stats.attempts > 1 {
            tracing::debug!(
                "Master call finished after {} attempts in {:?}",
                stats.attempts,
                stats.elapsed
            );
        }
        result
    }
}
