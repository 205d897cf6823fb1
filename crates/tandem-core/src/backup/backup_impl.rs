//! Backup served from a local database

use crate::backup::Backup;
use crate::context::SlaveContext;
use crate::database::{DEFAULT_DATA_SOURCE_NAME, Database};
use crate::response::{ResourceReleaser, Response, TransactionStream};
use crate::store_copy::{StoreWriter, rotate_logs_and_stream_store_files, transactions_after};
use crate::verifier::{BranchDetectingTxVerifier, TxChecksumVerifier};
use crate::Result;
use std::sync::Arc;

/// [`Backup`] over a running [`Database`]
pub struct BackupImpl {
    database: Arc<Database>,
    rotate_before_incremental: bool,
}

impl BackupImpl {
    /// Backup source for `database`
    pub fn new(database: Arc<Database>) -> Self {
        Self {
            database,
            // Active segments cannot be read while held open for writing there.
            rotate_before_incremental: cfg!(windows),
        }
    }

    /// Rotate logs before extracting an incremental backup
    pub fn with_rotate_before_incremental(mut self, rotate: bool) -> Self {
        self.rotate_before_incremental = rotate;
        self
    }

    /// The database being backed up
    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    fn respond<T>(&self, value: T, streams: Vec<TransactionStream>) -> Response<T> {
        if streams.is_empty() {
            Response::without_streams(value, self.database.store_id())
        } else {
            Response::new(value, self.database.store_id(), streams, ResourceReleaser::noop())
        }
    }

    /// Check the caller's claim about its last main-store transaction
    fn verify_tip(&self, context: &SlaveContext) -> Result<()> {
        if context.master_id < 0 {
            return Ok(());
        }
        match context.last_applied(DEFAULT_DATA_SOURCE_NAME) {
            Some(tx_id) if tx_id > 0 => {
                BranchDetectingTxVerifier::new(self.database.main_data_source().clone())
                    .assert_match(tx_id, context.master_id, context.checksum)
            }
            _ => Ok(()),
        }
    }
}

impl Backup for BackupImpl {
    fn full_backup(&self, writer: &mut dyn StoreWriter) -> Result<Response<SlaveContext>> {
        tracing::info!("Full backup of {}", self.database.store_dir().display());
        let snapshot = rotate_logs_and_stream_store_files(&self.database, writer)?;
        writer.done()?;
        let streams = transactions_after(&self.database, &snapshot)?;
        Ok(self.respond(snapshot, streams))
    }

    fn incremental_backup(&self, context: &SlaveContext) -> Result<Response<()>> {
        if self.rotate_before_incremental {
            self.database.rotate_logs()?;
        }
        tracing::info!("Incremental backup after {}", context);
        self.verify_tip(context)?;
        let streams = transactions_after(&self.database, context)?;
        Ok(self.respond((), streams))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LastAppliedTx;
    use crate::log::CommittedTransaction;
    use std::io::Read;

    #[derive(Default)]
    struct Names {
        files: Vec<String>,
        done: bool,
    }

    impl StoreWriter for Names {
        fn write(&mut self, path: &str, data: &mut dyn Read, len: u64) -> Result<u64> {
            std::io::copy(&mut data.take(len), &mut std::io::sink())?;
            self.files.push(path.to_string());
            Ok(len)
        }

        fn done(&mut self) -> Result<()> {
            self.done = true;
            Ok(())
        }
    }

    fn database(txs: u64) -> (tempfile::TempDir, Arc<Database>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(dir.path()).unwrap());
        commit(&db, 1..=txs);
        (dir, db)
    }

    fn commit(db: &Database, ids: std::ops::RangeInclusive<u64>) {
        for id in ids {
            db.main_data_source()
                .apply(&CommittedTransaction::new(id, 1, id, vec![id as u8; 16]))
                .unwrap();
        }
    }

    fn ids<T>(response: Response<T>) -> Vec<u64> {
        let mut seen = Vec::new();
        response
            .apply(|_, tx| {
                seen.push(tx.tx_id);
                Ok(())
            })
            .unwrap();
        seen
    }

    #[test]
    fn test_full_backup_ships_closed_files() {
        let (_dir, db) = database(10);
        let backup = BackupImpl::new(db);
        let mut writer = Names::default();
        let response = backup.full_backup(&mut writer).unwrap();
        assert!(writer.done);
        assert_eq!(response.value().last_applied("graph"), Some(10));
        assert!(writer.files.contains(&"store_id".to_string()));
        assert!(writer.files.contains(&"graph.log.v0".to_string()));
        assert!(ids(response).is_empty());
    }

    #[test]
    fn test_incremental_backup_is_minimal() {
        let (_dir, db) = database(100);
        let backup = BackupImpl::new(db.clone());
        backup.full_backup(&mut Names::default()).unwrap().close();

        commit(&db, 101..=105);
        let context = SlaveContext::anonymous(vec![
            LastAppliedTx::new("graph", 100),
            LastAppliedTx::new("index", 0),
        ]);
        assert_eq!(
            ids(backup.incremental_backup(&context).unwrap()),
            vec![101, 102, 103, 104, 105]
        );
    }

    #[test]
    fn test_incremental_backup_with_rotation() {
        let (_dir, db) = database(3);
        let backup = BackupImpl::new(db.clone()).with_rotate_before_incremental(true);
        let version = db.main_data_source().log().current_version();
        let context = SlaveContext::anonymous(vec![LastAppliedTx::new("graph", 1)]);
        assert_eq!(ids(backup.incremental_backup(&context).unwrap()), vec![2, 3]);
        assert_eq!(db.main_data_source().log().current_version(), version + 1);
    }

    #[test]
    fn test_incremental_backup_checks_claimed_tip() {
        let (_dir, db) = database(5);
        let backup = BackupImpl::new(db.clone());
        let (master_id, checksum) = db.main_data_source().master_for_committed_tx(5).unwrap().unwrap();
        let claim = |master_id, checksum| SlaveContext {
            master_id,
            checksum,
            ..SlaveContext::anonymous(vec![LastAppliedTx::new("graph", 5)])
        };

        assert!(ids(backup.incremental_backup(&claim(master_id, checksum)).unwrap()).is_empty());
        let err = backup
            .incremental_backup(&claim(master_id + 1, checksum))
            .unwrap_err();
        assert!(matches!(err, crate::Error::BranchedData(_)));
        let err = backup
            .incremental_backup(&claim(master_id, checksum ^ 1))
            .unwrap_err();
        assert!(matches!(err, crate::Error::BranchedData(_)));
    }

    #[test]
    fn test_up_to_date_backup_is_empty() {
        let (_dir, db) = database(3);
        let backup = BackupImpl::new(db.clone());
        let context = SlaveContext::anonymous(db.last_applied());
        let response = backup.incremental_backup(&context).unwrap();
        assert!(response.streams().is_empty());
        assert_eq!(response.store_id(), db.store_id());
    }
}
