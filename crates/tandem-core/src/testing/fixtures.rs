//! Stores, masters and slaves in temporary directories

use super::context::TestContext;
use crate::Result;
use crate::database::Database;
use crate::log::CommittedTransaction;
use crate::master::{Master, MasterImpl};
use crate::slave::{SlaveSession, copy_store_from_master};
use crate::verifier::tx_checksum;
use std::ops::RangeInclusive;
use std::sync::Arc;

/// A fresh database in a temporary directory
pub fn setup_test_database() -> Result<(Arc<Database>, TestContext)> {
    let ctx = TestContext::new();
    let database = Database::open(ctx.dir("store"))?;
    Ok((Arc::new(database), ctx))
}

/// A master over a fresh database
pub fn setup_test_master(machine_id: i32) -> Result<(Arc<MasterImpl>, TestContext)> {
    let (database, ctx) = setup_test_database()?;
    Ok((Arc::new(MasterImpl::new(machine_id, database)), ctx))
}

/// A slave bootstrapped from `master` into `ctx`
///
/// The store is copied into the subdirectory `slave-<machine_id>`.
pub fn setup_test_slave(
    master: &dyn Master,
    machine_id: i32,
    ctx: &TestContext,
) -> Result<SlaveSession> {
    let store_dir = ctx.dir(&format!("slave-{}", machine_id));
    let database = copy_store_from_master(master, &store_dir)?;
    Ok(SlaveSession::new(machine_id, Arc::new(database)))
}

/// Append transactions `ids` to the main data source as if committed by
/// `master_id`
pub fn commit_test_transactions(
    database: &Database,
    ids: RangeInclusive<u64>,
    master_id: i32,
) -> Result<()> {
    for id in ids {
        let data = format!("tx-{}-by-{}", id, master_id).into_bytes();
        let tx = CommittedTransaction::new(id, master_id, tx_checksum(id, &data), data);
        database.main_data_source().apply(&tx)?;
    }
    Ok(())
}
