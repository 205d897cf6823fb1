//! Online backup
//!
//! A running store serves backups over its own protocol. A full backup ships
//! every closed store file plus the transactions committed while the copy
//! ran; an incremental backup ships only the transactions a previous backup
//! lacks.

pub mod backup_impl;
pub mod client;
pub mod handler;
pub mod online;

pub use backup_impl::BackupImpl;
pub use client::BackupClient;
pub use handler::BackupServer;
pub use online::{BackupOutcome, OnlineBackup};

use crate::Result;
use crate::context::SlaveContext;
use crate::response::Response;
use crate::store_copy::StoreWriter;

/// Backup contract
pub trait Backup: Send + Sync {
    /// Stream the whole store into `writer`
    ///
    /// The response value is the applied vector of the copied files; the
    /// response carries the transactions committed after they were closed.
    fn full_backup(&self, writer: &mut dyn StoreWriter) -> Result<Response<SlaveContext>>;

    /// Transactions committed after what `context` has applied
    ///
    /// When `context` names a master for its last main-store transaction,
    /// that transaction is checked against the source first and a mismatch
    /// fails with [`Error::BranchedData`](crate::Error::BranchedData).
    fn incremental_backup(&self, context: &SlaveContext) -> Result<Response<()>>;
}
