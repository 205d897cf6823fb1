//! Slave side of replication
//!
//! A [`SlaveSession`] stamps the context sent with every master call and
//! applies the transactions piggybacked on responses.

use crate::context::SlaveContext;
use crate::database::Database;
use crate::log::CommittedTransaction;
use crate::master::Master;
use crate::response::Response;
use crate::store_copy::ToFileStoreWriter;
use crate::store_id::STORE_ID_FILE;
use crate::verifier::{BranchDetectingTxVerifier, TxChecksumVerifier};
use crate::{Error, Result};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

/// Replication state of one slave process
pub struct SlaveSession {
    session_id: i64,
    machine_id: i32,
    events: AtomicI32,
    database: Arc<Database>,
    verifier: BranchDetectingTxVerifier,
}

impl SlaveSession {
    /// Start a session; the session id is the current time in milliseconds
    pub fn new(machine_id: i32, database: Arc<Database>) -> Self {
        Self::with_session_id(chrono::Utc::now().timestamp_millis(), machine_id, database)
    }

    /// Start a session with an explicit id
    pub fn with_session_id(session_id: i64, machine_id: i32, database: Arc<Database>) -> Self {
        let verifier = BranchDetectingTxVerifier::new(database.main_data_source().clone());
        Self {
            session_id,
            machine_id,
            events: AtomicI32::new(0),
            database,
            verifier,
        }
    }

    /// Session id
    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    /// Machine id
    pub fn machine_id(&self) -> i32 {
        self.machine_id
    }

    /// Local database
    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    /// Context for calls outside a transaction, such as pulling updates
    pub fn context(&self) -> Result<SlaveContext> {
        self.stamp(self.events.load(Ordering::SeqCst))
    }

    /// Context identifying a new top-level transaction
    ///
    /// Reuse the returned context when retrying calls of that transaction.
    pub fn begin_transaction(&self) -> Result<SlaveContext> {
        self.stamp(self.events.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn stamp(&self, event_identifier: i32) -> Result<SlaveContext> {
        let main = self.database.main_data_source();
        let last = main.last_committed_tx();
        let (master_id, checksum) = if last == 0 {
            (-1, 0)
        } else {
            main.master_for_committed_tx(last)?.unwrap_or((-1, 0))
        };
        Ok(SlaveContext::new(
            self.session_id,
            self.machine_id,
            event_identifier,
            self.database.last_applied(),
            master_id,
            checksum,
        ))
    }

    /// Apply every transaction carried by `response` and return its value
    pub fn apply<T>(&self, response: Response<T>) -> Result<T> {
        apply_response(&self.database, &self.verifier, response)
    }

    /// Pull and apply whatever the master has that this slave lacks
    pub fn pull_updates(&self, master: &dyn Master) -> Result<()> {
        let context = self.context()?;
        self.apply(master.pull_updates(&context)?)
    }

    /// Fail with [`Error::BranchedData`] if the master recorded the local tip
    /// differently
    pub fn check_consistency_with_master(&self, master: &dyn Master) -> Result<()> {
        let last = self.database.main_data_source().last_committed_tx();
        if last == 0 {
            return Ok(());
        }
        let (master_id, checksum) = master
            .get_master_id_for_committed_tx(last, &self.database.store_id())?
            .into_value();
        self.verifier.assert_match(last, master_id, checksum)?;
        tracing::info!(
            "Store of machine {} consistent with master at tx {}",
            self.machine_id,
            last
        );
        Ok(())
    }
}

/// Initialize `store_dir` with a copy of the master's store
///
/// `store_dir` must not hold a store yet. Transactions the master committed
/// while the copy ran are applied before returning.
pub fn copy_store_from_master(master: &dyn Master, store_dir: &Path) -> Result<Database> {
    if store_dir.join(STORE_ID_FILE).exists() {
        return Err(Error::config(format!(
            "{} already holds a store",
            store_dir.display()
        )));
    }
    let mut writer = ToFileStoreWriter::new(store_dir)?;
    let response = master.copy_store(&SlaveContext::EMPTY, &mut writer)?;
    let database = Database::open(store_dir)?;
    let verifier = BranchDetectingTxVerifier::new(database.main_data_source().clone());
    apply_response(&database, &verifier, response)?;
    tracing::info!(
        "Copied store from master into {}: {} files, {} bytes",
        store_dir.display(),
        writer.files_written(),
        writer.bytes_written()
    );
    Ok(database)
}

/// Apply the transactions carried by `response` to `database`
///
/// Transactions at or below the local tip are verified against the local
/// log and skipped; the next one is appended; anything further ahead is a
/// gap and fails. `verifier` covers the main data source.
pub fn apply_response<T>(
    database: &Database,
    verifier: &BranchDetectingTxVerifier,
    response: Response<T>,
) -> Result<T> {
    let local = database.store_id();
    if response.store_id() != local {
        let remote = response.store_id();
        response.close();
        return Err(Error::StoreIdMismatch {
            expected: local.to_string(),
            actual: remote.to_string(),
        });
    }
    response.apply(|name, tx| apply_one(database, verifier, name, tx))
}

fn apply_one(
    database: &Database,
    verifier: &BranchDetectingTxVerifier,
    data_source_name: &str,
    tx: CommittedTransaction,
) -> Result<()> {
    let ds = database.data_source(data_source_name)?;
    let tip = ds.last_committed_tx();
    if tx.tx_id <= tip {
        if ds.name() == database.main_data_source().name() {
            verifier.assert_match(tx.tx_id, tx.master_id, tx.checksum)?;
        } else {
            BranchDetectingTxVerifier::new(ds.clone())
                .assert_match(tx.tx_id, tx.master_id, tx.checksum)?;
        }
        return Ok(());
    }
    if tx.tx_id != tip + 1 {
        return Err(Error::transaction(format!(
            "{}: gap between local tx {} and received tx {}",
            data_source_name, tip, tx.tx_id
        )));
    }
    ds.apply(&tx)?;
    tracing::trace!("Applied tx {} to {}", tx.tx_id, data_source_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::TransactionStream;
    use crate::verifier::tx_checksum;

    fn tx(id: u64, master_id: i32) -> CommittedTransaction {
        let data = vec![id as u8; 8];
        CommittedTransaction::new(id, master_id, tx_checksum(id, &data), data)
    }

    fn session() -> (tempfile::TempDir, SlaveSession) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(dir.path()).unwrap());
        (dir, SlaveSession::with_session_id(42, 3, db))
    }

    fn response(session: &SlaveSession, txs: Vec<CommittedTransaction>) -> Response<()> {
        Response::new(
            (),
            session.database().store_id(),
            vec![TransactionStream::from_vec("graph", txs)],
            crate::response::ResourceReleaser::noop(),
        )
    }

    #[test]
    fn test_context_reflects_tip() {
        let (_dir, session) = session();
        let empty = session.context().unwrap();
        assert_eq!(empty.master_id, -1);
        assert_eq!(empty.last_applied("graph"), Some(0));

        session.apply(response(&session, vec![tx(1, 7), tx(2, 7)])).unwrap();
        let ctx = session.begin_transaction().unwrap();
        assert_eq!(ctx.session_id, 42);
        assert_eq!(ctx.event_identifier, 1);
        assert_eq!(ctx.master_id, 7);
        assert_eq!(ctx.checksum, tx(2, 7).checksum);
        assert_eq!(ctx.last_applied("graph"), Some(2));
    }

    #[test]
    fn test_superset_is_skipped_after_verification() {
        let (_dir, session) = session();
        session.apply(response(&session, vec![tx(1, 1), tx(2, 1)])).unwrap();
        session
            .apply(response(&session, vec![tx(1, 1), tx(2, 1), tx(3, 1)]))
            .unwrap();
        assert_eq!(session.database().main_data_source().last_committed_tx(), 3);
    }

    #[test]
    fn test_diverged_superset_is_a_branch() {
        let (_dir, session) = session();
        session.apply(response(&session, vec![tx(1, 1)])).unwrap();
        let err = session
            .apply(response(&session, vec![tx(1, 2), tx(2, 2)]))
            .unwrap_err();
        assert!(matches!(err, Error::BranchedData(_)));
        assert_eq!(session.database().main_data_source().last_committed_tx(), 1);
    }

    #[test]
    fn test_gap_is_rejected() {
        let (_dir, session) = session();
        let err = session.apply(response(&session, vec![tx(2, 1)])).unwrap_err();
        assert!(matches!(err, Error::Transaction(_)));
    }

    #[test]
    fn test_foreign_store_is_rejected() {
        let (_dir, session) = session();
        let foreign = Response::without_streams((), crate::store_id::StoreId::new(1, 1, 1));
        let err = session.apply(foreign).unwrap_err();
        assert!(matches!(err, Error::StoreIdMismatch { .. }));
    }

    #[test]
    fn test_copy_store_then_pull() {
        let master_dir = tempfile::tempdir().unwrap();
        let master_db = Arc::new(Database::open(master_dir.path()).unwrap());
        for id in 1..=3 {
            master_db.main_data_source().apply(&tx(id, 1)).unwrap();
        }
        let master = crate::master::MasterImpl::new(1, master_db.clone());

        let slave_dir = tempfile::tempdir().unwrap();
        let db = copy_store_from_master(&master, slave_dir.path()).unwrap();
        assert_eq!(db.store_id(), master_db.store_id());
        assert_eq!(db.main_data_source().last_committed_tx(), 3);

        master_db.main_data_source().apply(&tx(4, 1)).unwrap();
        let session = SlaveSession::with_session_id(1, 2, Arc::new(db));
        session.pull_updates(&master).unwrap();
        session.check_consistency_with_master(&master).unwrap();
        assert_eq!(session.database().main_data_source().last_committed_tx(), 4);

        assert!(matches!(
            copy_store_from_master(&master, slave_dir.path()),
            Err(Error::Config(_))
        ));
    }
}
