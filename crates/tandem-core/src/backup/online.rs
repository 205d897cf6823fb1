//! Backups into a local directory
//!
//! The destination is a regular store directory. After a full backup it can
//! be opened as a [`Database`]; every incremental backup then brings it up to
//! date with the source, verifying that the two histories have not forked.

use crate::backup::{Backup, BackupClient};
use crate::context::{LastAppliedTx, SlaveContext};
use crate::database::Database;
use crate::response::Response;
use crate::slave::apply_response;
use crate::store_copy::ToFileStoreWriter;
use crate::store_id::STORE_ID_FILE;
use crate::verifier::BranchDetectingTxVerifier;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a backup run did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupOutcome {
    /// Store files received
    pub files: usize,
    /// Bytes of store files received
    pub bytes: u64,
    /// Transactions applied from the response streams
    pub transactions: u64,
    /// Applied vector of the destination afterwards
    pub last_applied: Vec<LastAppliedTx>,
    /// Wall time
    pub elapsed: Duration,
}

/// Runs backups from a [`Backup`] source into directories
pub struct OnlineBackup {
    source: Arc<dyn Backup>,
}

impl OnlineBackup {
    /// Backups from `source`
    pub fn new(source: Arc<dyn Backup>) -> Self {
        Self { source }
    }

    /// Backups from the backup server at `host:port`
    pub fn connect(host: impl Into<String>, port: u16) -> Self {
        Self::new(Arc::new(BackupClient::connect(host, port)))
    }

    /// Copy the whole source store into `target`
    ///
    /// `target` must be missing or empty.
    pub fn full(&self, target: &Path) -> Result<BackupOutcome> {
        if target.exists() && std::fs::read_dir(target)?.next().is_some() {
            return Err(Error::config(format!(
                "backup target {} is not empty",
                target.display()
            )));
        }
        let started = Instant::now();
        let mut writer = ToFileStoreWriter::new(target)?;
        let response = self.source.full_backup(&mut writer)?;

        let database = Database::open(target)?;
        let transactions = apply(&database, response)?;
        let outcome = BackupOutcome {
            files: writer.files_written(),
            bytes: writer.bytes_written(),
            transactions,
            last_applied: database.last_applied(),
            elapsed: started.elapsed(),
        };
        tracing::info!(
            "Full backup into {} done: {} files, {} bytes, {} transactions",
            target.display(),
            outcome.files,
            outcome.bytes,
            outcome.transactions
        );
        Ok(outcome)
    }

    /// Bring the backup in `target` up to date
    pub fn incremental(&self, target: &Path) -> Result<BackupOutcome> {
        if !target.join(STORE_ID_FILE).is_file() {
            return Err(Error::config(format!(
                "{} holds no backup, run a full backup first",
                target.display()
            )));
        }
        let started = Instant::now();
        let database = Database::open(target)?;
        let context = backup_context(&database)?;
        let response = self.source.incremental_backup(&context)?;
        let transactions = apply(&database, response)?;
        let outcome = BackupOutcome {
            files: 0,
            bytes: 0,
            transactions,
            last_applied: database.last_applied(),
            elapsed: started.elapsed(),
        };
        tracing::info!(
            "Incremental backup into {} done: {} transactions",
            target.display(),
            transactions
        );
        Ok(outcome)
    }
}

/// Applied vector of `database` plus the master and checksum of its last
/// main-store transaction, which the source verifies before answering
fn backup_context(database: &Database) -> Result<SlaveContext> {
    let main = database.main_data_source();
    let tip = main.last_committed_tx();
    let (master_id, checksum) = if tip == 0 {
        (-1, 0)
    } else {
        main.master_for_committed_tx(tip)?.unwrap_or((-1, 0))
    };
    Ok(SlaveContext {
        master_id,
        checksum,
        ..SlaveContext::anonymous(database.last_applied())
    })
}

fn apply<T>(database: &Database, response: Response<T>) -> Result<u64> {
    let before = total_applied(database);
    let verifier = BranchDetectingTxVerifier::new(database.main_data_source().clone());
    apply_response(database, &verifier, response)?;
    Ok(total_applied(database) - before)
}

fn total_applied(database: &Database) -> u64 {
    database.data_sources().map(|ds| ds.last_committed_tx()).sum()
}
