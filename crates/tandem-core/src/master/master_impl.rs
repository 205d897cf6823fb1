//! The master side of replication
//!
//! Owns the authoritative logs, the cluster-wide lock table, id ranges and
//! relationship type ids. Every response to a context-bearing call carries
//! the transactions the caller has not applied yet.

use crate::context::SlaveContext;
use crate::database::Database;
use crate::master::{
    IdAllocation, IdAllocator, IdType, LockManager, LockMode, LockResult, Master, ResourceId,
    TxExtractor, TxKey,
};
use crate::response::{ResourceReleaser, Response, TransactionStream};
use crate::store_copy::{StoreWriter, rotate_logs_and_stream_store_files, transactions_after};
use crate::store_id::StoreId;
use crate::verifier::tx_checksum;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Default time a lock request waits before giving up
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(20);

/// Counters exposed by a running master
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterStats {
    /// Transactions committed
    pub commits: u64,
    /// Lock requests served
    pub lock_requests: u64,
    /// Lock requests not granted
    pub locks_denied: u64,
    /// Pull requests served
    pub pulls: u64,
    /// Known slave sessions
    pub sessions: usize,
    /// Open slave transactions
    pub open_transactions: usize,
    /// Responses whose streams are still being read
    pub open_responses: u64,
}

#[derive(Debug, Default)]
struct TxState {
    committed: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct RelationshipTypes {
    by_name: HashMap<String, i32>,
    next: i32,
}

#[derive(Debug, Default)]
struct Counters {
    commits: AtomicU64,
    lock_requests: AtomicU64,
    locks_denied: AtomicU64,
    pulls: AtomicU64,
}

/// Master over a local [`Database`]
pub struct MasterImpl {
    machine_id: i32,
    database: Arc<Database>,
    locks: LockManager,
    ids: IdAllocator,
    relationship_types: Mutex<RelationshipTypes>,
    sessions: Mutex<HashMap<i32, i64>>,
    transactions: Mutex<HashMap<TxKey, Arc<Mutex<TxState>>>>,
    is_master: AtomicBool,
    counters: Counters,
    open_responses: Arc<AtomicU64>,
}

impl MasterImpl {
    /// Master with id `machine_id` serving `database`
    pub fn new(machine_id: i32, database: Arc<Database>) -> Self {
        Self {
            machine_id,
            database,
            locks: LockManager::new(DEFAULT_LOCK_TIMEOUT),
            ids: IdAllocator::default(),
            relationship_types: Mutex::new(RelationshipTypes::default()),
            sessions: Mutex::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            is_master: AtomicBool::new(true),
            counters: Counters::default(),
            open_responses: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Set how long lock requests wait
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.locks = LockManager::new(timeout);
        self
    }

    /// Set the size of id ranges
    pub fn with_id_grab_size(mut self, grab_size: u64) -> Self {
        self.ids = IdAllocator::new(grab_size);
        self
    }

    /// Machine id of this master
    pub fn machine_id(&self) -> i32 {
        self.machine_id
    }

    /// The served database
    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    /// Whether this instance still acts as master
    pub fn is_master(&self) -> bool {
        self.is_master.load(Ordering::SeqCst)
    }

    /// Stop acting as master; later calls fail with [`Error::NotMaster`]
    pub fn demote(&self) {
        if self.is_master.swap(false, Ordering::SeqCst) {
            tracing::warn!("Machine {} is no longer master", self.machine_id);
        }
    }

    /// Forget a slave session, rolling back its open transactions
    pub fn end_session(&self, machine_id: i32) {
        if let Some(session_id) = self.sessions.lock().remove(&machine_id) {
            self.roll_back_session(machine_id, session_id);
        }
    }

    /// Current counters
    pub fn stats(&self) -> MasterStats {
        MasterStats {
            commits: self.counters.commits.load(Ordering::Relaxed),
            lock_requests: self.counters.lock_requests.load(Ordering::Relaxed),
            locks_denied: self.counters.locks_denied.load(Ordering::Relaxed),
            pulls: self.counters.pulls.load(Ordering::Relaxed),
            sessions: self.sessions.lock().len(),
            open_transactions: self.transactions.lock().len(),
            open_responses: self.open_responses.load(Ordering::SeqCst),
        }
    }

    fn ensure_master(&self) -> Result<()> {
        if self.is_master() {
            Ok(())
        } else {
            Err(Error::NotMaster(format!(
                "machine {} is not master",
                self.machine_id
            )))
        }
    }

    /// Register the caller's session; false when it was not known before
    fn check_session(&self, context: &SlaveContext) -> bool {
        if context.is_anonymous() {
            return true;
        }
        let previous = self
            .sessions
            .lock()
            .insert(context.machine_id, context.session_id);
        match previous {
            Some(session) if session == context.session_id => true,
            Some(session) => {
                tracing::info!(
                    "Machine {} started session {}, rolling back session {}",
                    context.machine_id,
                    context.session_id,
                    session
                );
                self.roll_back_session(context.machine_id, session);
                false
            }
            None => {
                tracing::info!(
                    "New session {} from machine {}",
                    context.session_id,
                    context.machine_id
                );
                false
            }
        }
    }

    fn roll_back_session(&self, machine_id: i32, session_id: i64) {
        let stale: Vec<TxKey> = {
            let mut transactions = self.transactions.lock();
            let stale: Vec<TxKey> = transactions
                .keys()
                .filter(|key| key.machine_id == machine_id && key.session_id == session_id)
                .copied()
                .collect();
            for key in &stale {
                transactions.remove(key);
            }
            stale
        };
        for key in stale {
            self.locks.release_all(key);
        }
    }

    /// Wrap `value` with every transaction the caller lacks
    ///
    /// An unknown session gets everything retained, since its applied vector
    /// cannot be trusted.
    fn pack_response<T>(&self, context: &SlaveContext, value: T, known: bool) -> Result<Response<T>> {
        let streams = if known {
            transactions_after(&self.database, context)?
        } else {
            transactions_after(&self.database, &SlaveContext::anonymous(Vec::new()))?
        };
        Ok(self.respond(value, streams))
    }

    fn respond<T>(&self, value: T, streams: Vec<TransactionStream>) -> Response<T> {
        if streams.is_empty() {
            return Response::without_streams(value, self.database.store_id());
        }
        let open = self.open_responses.clone();
        open.fetch_add(1, Ordering::SeqCst);
        let releaser = ResourceReleaser::new(move || {
            open.fetch_sub(1, Ordering::SeqCst);
        });
        Response::new(value, self.database.store_id(), streams, releaser)
    }

    fn acquire(
        &self,
        context: &SlaveContext,
        resources: Vec<ResourceId>,
        mode: LockMode,
    ) -> Result<Response<LockResult>> {
        self.ensure_master()?;
        let known = self.check_session(context);
        let key = TxKey::from(context);
        if !self.transactions.lock().contains_key(&key) {
            return Err(Error::transaction(format!(
                "lock requested outside a transaction by {}",
                context
            )));
        }
        self.counters.lock_requests.fetch_add(1, Ordering::Relaxed);
        let result = self.locks.acquire(key, &resources, mode);
        if !result.is_granted() {
            self.counters.locks_denied.fetch_add(1, Ordering::Relaxed);
        }
        self.pack_response(context, result, known)
    }
}

impl Master for MasterImpl {
    fn allocate_ids(&self, id_type: IdType) -> Result<Response<IdAllocation>> {
        self.ensure_master()?;
        let allocation = self.ids.allocate(id_type);
        tracing::debug!("Allocated {:?} ids {:?}", id_type, allocation.ids());
        Ok(Response::without_streams(allocation, self.database.store_id()))
    }

    fn create_relationship_type(&self, context: &SlaveContext, name: &str) -> Result<Response<i32>> {
        self.ensure_master()?;
        let known = self.check_session(context);
        let id = {
            let mut types = self.relationship_types.lock();
            match types.by_name.get(name) {
                Some(id) => *id,
                None => {
                    let id = types.next;
                    types.next += 1;
                    types.by_name.insert(name.to_string(), id);
                    tracing::info!("Created relationship type {} with id {}", name, id);
                    id
                }
            }
        };
        self.pack_response(context, id, known)
    }

    fn initialize_tx(&self, context: &SlaveContext) -> Result<Response<()>> {
        self.ensure_master()?;
        let known = self.check_session(context);
        self.transactions
            .lock()
            .entry(TxKey::from(context))
            .or_default();
        self.pack_response(context, (), known)
    }

    fn acquire_node_write_lock(
        &self,
        context: &SlaveContext,
        nodes: &[u64],
    ) -> Result<Response<LockResult>> {
        let resources = nodes.iter().map(|id| ResourceId::Node(*id)).collect();
        self.acquire(context, resources, LockMode::Write)
    }

    fn acquire_node_read_lock(
        &self,
        context: &SlaveContext,
        nodes: &[u64],
    ) -> Result<Response<LockResult>> {
        let resources = nodes.iter().map(|id| ResourceId::Node(*id)).collect();
        self.acquire(context, resources, LockMode::Read)
    }

    fn acquire_relationship_write_lock(
        &self,
        context: &SlaveContext,
        relationships: &[u64],
    ) -> Result<Response<LockResult>> {
        let resources = relationships
            .iter()
            .map(|id| ResourceId::Relationship(*id))
            .collect();
        self.acquire(context, resources, LockMode::Write)
    }

    fn acquire_relationship_read_lock(
        &self,
        context: &SlaveContext,
        relationships: &[u64],
    ) -> Result<Response<LockResult>> {
        let resources = relationships
            .iter()
            .map(|id| ResourceId::Relationship(*id))
            .collect();
        self.acquire(context, resources, LockMode::Read)
    }

    fn commit_single_resource_transaction(
        &self,
        context: &SlaveContext,
        resource: &str,
        extractor: &mut dyn TxExtractor,
    ) -> Result<Response<u64>> {
        self.ensure_master()?;
        let known = self.check_session(context);
        let data_source = self.database.data_source(resource)?.clone();

        let state = self
            .transactions
            .lock()
            .get(&TxKey::from(context))
            .cloned()
            .ok_or_else(|| {
                Error::transaction(format!("commit without initialize_tx by {}", context))
            })?;
        // Only this transaction waits on the append; a concurrent retry then
        // finds the id already recorded.
        let mut state = state.lock();
        let tx_id = match state.committed.get(resource) {
            Some(tx_id) => {
                tracing::debug!("{} already committed tx {} to {}", context, tx_id, resource);
                *tx_id
            }
            None => {
                let mut data = Vec::new();
                extractor.extract(&mut data)?;
                let tx = data_source
                    .log()
                    .commit_next(self.machine_id, data, tx_checksum)?;
                state.committed.insert(resource.to_string(), tx.tx_id);
                self.counters.commits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Committed tx {} to {} for {}", tx.tx_id, resource, context);
                tx.tx_id
            }
        };
        drop(state);
        self.pack_response(context, tx_id, known)
    }

    fn finish_transaction(&self, context: &SlaveContext, success: bool) -> Result<Response<()>> {
        self.ensure_master()?;
        let known = self.check_session(context);
        let key = TxKey::from(context);
        let finished = self.transactions.lock().remove(&key);
        let released = self.locks.release_all(key);
        match finished {
            Some(state) => tracing::debug!(
                "Finished {} (success: {}, commits: {}, locks released: {})",
                context,
                success,
                state.lock().committed.len(),
                released
            ),
            None => tracing::debug!("Finish for unknown transaction {}", context),
        }
        self.pack_response(context, (), known)
    }

    fn pull_updates(&self, context: &SlaveContext) -> Result<Response<()>> {
        self.ensure_master()?;
        let known = self.check_session(context);
        self.counters.pulls.fetch_add(1, Ordering::Relaxed);
        self.pack_response(context, (), known)
    }

    fn get_master_id_for_committed_tx(
        &self,
        tx_id: u64,
        store_id: &StoreId,
    ) -> Result<Response<(i32, u64)>> {
        let local = self.database.store_id();
        if *store_id != local {
            return Err(Error::StoreIdMismatch {
                expected: local.to_string(),
                actual: store_id.to_string(),
            });
        }
        let recorded = self
            .database
            .main_data_source()
            .master_for_committed_tx(tx_id)?
            .ok_or_else(|| Error::transaction(format!("tx {} is not committed here", tx_id)))?;
        Ok(Response::without_streams(recorded, local))
    }

    fn copy_store(
        &self,
        context: &SlaveContext,
        writer: &mut dyn StoreWriter,
    ) -> Result<Response<()>> {
        self.ensure_master()?;
        tracing::info!("Copying store for {}", context);
        let snapshot = rotate_logs_and_stream_store_files(&self.database, writer)?;
        writer.done()?;
        self.pack_response(&snapshot, (), true)
    }

    fn copy_transactions(
        &self,
        context: &SlaveContext,
        data_source: &str,
        start: u64,
        end: u64,
    ) -> Result<Response<()>> {
        self.ensure_master()?;
        tracing::debug!(
            "Copying txs {}..={} of {} for {}",
            start,
            end,
            data_source,
            context
        );
        let ds = self.database.data_source(data_source)?;
        let txs = ds.log().extract(start, end)?;
        Ok(self.respond((), vec![TransactionStream::from_log(ds.name(), txs)]))
    }

    fn acquire_index_write_lock(
        &self,
        context: &SlaveContext,
        index: &str,
        key: &str,
    ) -> Result<Response<LockResult>> {
        let resource = ResourceId::IndexEntry {
            index: index.to_string(),
            key: key.to_string(),
        };
        self.acquire(context, vec![resource], LockMode::Write)
    }

    fn acquire_index_read_lock(
        &self,
        context: &SlaveContext,
        index: &str,
        key: &str,
    ) -> Result<Response<LockResult>> {
        let resource = ResourceId::IndexEntry {
            index: index.to_string(),
            key: key.to_string(),
        };
        self.acquire(context, vec![resource], LockMode::Read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LastAppliedTx;
    use crate::log::CommittedTransaction;
    use crate::master::{LockStatus, TxData};

    fn master() -> (tempfile::TempDir, MasterImpl) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(dir.path()).unwrap());
        let master = MasterImpl::new(1, db).with_lock_timeout(Duration::from_millis(50));
        (dir, master)
    }

    fn context(event: i32, graph_tx: u64) -> SlaveContext {
        SlaveContext::new(
            100,
            2,
            event,
            vec![
                LastAppliedTx::new("graph", graph_tx),
                LastAppliedTx::new("index", 0),
            ],
            -1,
            0,
        )
    }

    fn commit(master: &MasterImpl, ctx: &SlaveContext, data: &[u8]) -> u64 {
        master.initialize_tx(ctx).unwrap().close();
        master
            .commit_single_resource_transaction(ctx, "graph", &mut TxData(data))
            .unwrap()
            .into_value()
    }

    fn collect(response: Response<impl Sized>) -> Vec<(String, u64)> {
        let mut seen = Vec::new();
        response
            .apply(|name, tx| {
                seen.push((name.to_string(), tx.tx_id));
                Ok(())
            })
            .unwrap();
        seen
    }

    #[test]
    fn test_commit_assigns_ids_and_checksums() {
        let (_dir, master) = master();
        assert_eq!(commit(&master, &context(1, 0), b"first"), 1);
        assert_eq!(commit(&master, &context(2, 1), b"second"), 2);

        let (master_id, checksum) = master
            .get_master_id_for_committed_tx(2, &master.database().store_id())
            .unwrap()
            .into_value();
        assert_eq!(master_id, 1);
        assert_eq!(checksum, tx_checksum(2, b"second"));
        assert_eq!(master.stats().commits, 2);
    }

    #[test]
    fn test_commit_requires_initialize() {
        let (_dir, master) = master();
        let ctx = context(1, 0);
        let err = master
            .commit_single_resource_transaction(&ctx, "graph", &mut TxData(b"x"))
            .unwrap_err();
        assert!(matches!(err, Error::Transaction(_)));
    }

    #[test]
    fn test_commit_retry_is_idempotent() {
        let (_dir, master) = master();
        let ctx = context(1, 0);
        assert_eq!(commit(&master, &ctx, b"once"), 1);
        let again = master
            .commit_single_resource_transaction(&ctx, "graph", &mut TxData(b"once"))
            .unwrap()
            .into_value();
        assert_eq!(again, 1);
        assert_eq!(master.database().main_data_source().last_committed_tx(), 1);
    }

    #[test]
    fn test_responses_carry_missing_transactions() {
        let (_dir, master) = master();
        commit(&master, &context(1, 0), b"a");
        commit(&master, &context(2, 1), b"b");
        commit(&master, &context(3, 2), b"c");

        let response = master.pull_updates(&context(4, 1)).unwrap();
        assert_eq!(master.stats().open_responses, 1);
        assert_eq!(
            collect(response),
            vec![("graph".to_string(), 2), ("graph".to_string(), 3)]
        );
        assert_eq!(master.stats().open_responses, 0);

        let up_to_date = master.pull_updates(&context(5, 3)).unwrap();
        assert!(up_to_date.streams().is_empty());
    }

    #[test]
    fn test_unknown_session_gets_superset() {
        let (_dir, master) = master();
        for (i, data) in [b"a", b"b", b"c"].iter().enumerate() {
            let tx = CommittedTransaction::new(i as u64 + 1, 1, i as u64, data.to_vec());
            master.database().main_data_source().apply(&tx).unwrap();
        }
        let stranger = SlaveContext::new(7, 9, 1, vec![LastAppliedTx::new("graph", 3)], -1, 0);
        let ids: Vec<u64> = collect(master.pull_updates(&stranger).unwrap())
            .into_iter()
            .map(|(_, id)| id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let known = collect(master.pull_updates(&stranger).unwrap());
        assert!(known.is_empty());
    }

    #[test]
    fn test_new_session_rolls_back_old_transactions() {
        let (_dir, master) = master();
        let old = context(1, 0);
        master.initialize_tx(&old).unwrap().close();
        let granted = master
            .acquire_node_write_lock(&old, &[1, 2])
            .unwrap()
            .into_value();
        assert!(granted.is_granted());

        let restarted = SlaveContext::new(200, 2, 1, Vec::new(), -1, 0);
        master.initialize_tx(&restarted).unwrap().close();
        let relocked = master
            .acquire_node_write_lock(&restarted, &[1])
            .unwrap()
            .into_value();
        assert!(relocked.is_granted());
        assert_eq!(master.stats().open_transactions, 1);
    }

    #[test]
    fn test_locks_released_on_finish() {
        let (_dir, master) = master();
        let first = context(1, 0);
        let second = context(2, 0);
        master.initialize_tx(&first).unwrap().close();
        master.initialize_tx(&second).unwrap().close();

        let held = master
            .acquire_index_write_lock(&first, "users", "alice")
            .unwrap()
            .into_value();
        assert!(held.is_granted());
        let denied = master
            .acquire_index_read_lock(&second, "users", "alice")
            .unwrap()
            .into_value();
        assert_eq!(denied.status, LockStatus::NotLocked);

        master.finish_transaction(&first, true).unwrap().close();
        let granted = master
            .acquire_index_read_lock(&second, "users", "alice")
            .unwrap()
            .into_value();
        assert!(granted.is_granted());
        assert_eq!(master.stats().locks_denied, 1);
    }

    #[test]
    fn test_relationship_types_are_interned() {
        let (_dir, master) = master();
        let ctx = context(1, 0);
        let knows = master.create_relationship_type(&ctx, "KNOWS").unwrap().into_value();
        let likes = master.create_relationship_type(&ctx, "LIKES").unwrap().into_value();
        let again = master.create_relationship_type(&ctx, "KNOWS").unwrap().into_value();
        assert_eq!(knows, again);
        assert_ne!(knows, likes);
    }

    #[test]
    fn test_demoted_master_refuses() {
        let (_dir, master) = master();
        master.demote();
        let err = master.pull_updates(&context(1, 0)).unwrap_err();
        assert!(matches!(err, Error::NotMaster(_)));
        assert!(err.requires_master_resolution());
    }

    #[test]
    fn test_store_id_checked() {
        let (_dir, master) = master();
        let err = master
            .get_master_id_for_committed_tx(1, &StoreId::new(1, 2, 1))
            .unwrap_err();
        assert!(matches!(err, Error::StoreIdMismatch { .. }));
    }

    #[test]
    fn test_copy_transactions_is_inclusive() {
        let (_dir, master) = master();
        for i in 0..5 {
            commit(&master, &context(i + 1, i as u64), b"tx");
        }
        let ids: Vec<u64> = collect(
            master
                .copy_transactions(&SlaveContext::EMPTY, "graph", 2, 4)
                .unwrap(),
        )
        .into_iter()
        .map(|(_, id)| id)
        .collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn test_slow_commit_does_not_block_other_slaves() {
        let (_dir, master) = master();
        let master = Arc::new(master);
        let writer = context(1, 0);
        master.initialize_tx(&writer).unwrap().close();

        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
        let committing = {
            let master = master.clone();
            let writer = writer.clone();
            std::thread::spawn(move || {
                let mut slow = |out: &mut dyn crate::buffer::LogBuffer| {
                    started_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    out.put_bytes(b"slow")
                };
                master
                    .commit_single_resource_transaction(&writer, "graph", &mut slow)
                    .unwrap()
                    .into_value()
            })
        };
        started_rx.recv().unwrap();

        // Another slave starts, locks and finishes while the commit is in flight.
        let other = SlaveContext::new(7, 3, 1, Vec::new(), -1, 0);
        master.initialize_tx(&other).unwrap().close();
        let lock = master.acquire_node_write_lock(&other, &[9]).unwrap().into_value();
        assert_eq!(lock.status, LockStatus::Locked);
        master.finish_transaction(&other, true).unwrap().close();

        release_tx.send(()).unwrap();
        assert_eq!(committing.join().unwrap(), 1);
        let retried = master
            .commit_single_resource_transaction(&writer, "graph", &mut TxData(b"again"))
            .unwrap()
            .into_value();
        assert_eq!(retried, 1);
        assert_eq!(master.stats().commits, 1);
    }
}
