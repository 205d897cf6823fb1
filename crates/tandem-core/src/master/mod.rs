//! Master RPC contract
//!
//! Every cross-machine operation a slave can invoke. Each call carries the
//! caller's [`SlaveContext`] (where it has one) and returns a [`Response`]
//! that may piggyback transactions the caller has not seen yet.
//!
//! Implementations:
//! - [`MasterImpl`]: the real master, over a local [`Database`](crate::database::Database)
//! - [`MasterClient`]: forwards every call over a [`Transport`](crate::transport::Transport)
//! - [`MasterServer`]: decodes requests and dispatches them to a `MasterImpl`

pub mod client;
pub mod handler;
pub mod ids;
pub mod lock_manager;
pub mod master_impl;

pub use client::MasterClient;
pub use handler::MasterServer;
pub use ids::IdAllocator;
pub use lock_manager::{LockManager, LockMode, ResourceId, TxKey};
pub use master_impl::{MasterImpl, MasterStats};

use crate::Result;
use crate::buffer::LogBuffer;
use crate::context::SlaveContext;
use crate::response::Response;
use crate::store_copy::StoreWriter;
use crate::store_id::StoreId;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Kinds of entity ids the master hands out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdType {
    /// Node records
    Node,
    /// Relationship records
    Relationship,
    /// Property records
    Property,
    /// Property key records
    PropertyIndex,
    /// Dynamic string blocks
    StringBlock,
    /// Dynamic array blocks
    ArrayBlock,
    /// Relationship type records
    RelationshipType,
}

/// A range of ids reserved for the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdAllocation {
    /// First id of the range
    pub start: u64,
    /// Number of ids in the range
    pub length: u64,
    /// Highest id the master considers in use after this allocation
    pub highest_id_in_use: u64,
    /// Number of ids recycled so far
    pub defrag_count: u64,
}

impl IdAllocation {
    /// The reserved ids
    pub fn ids(&self) -> Range<u64> {
        self.start..self.start + self.length
    }
}

/// Outcome of a lock request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockStatus {
    /// Every requested lock was granted
    Locked,
    /// Nothing was granted
    NotLocked,
    /// Nothing was granted; waiting would have deadlocked
    DeadLocked,
}

/// Result of a lock request; never a partial grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockResult {
    /// Status
    pub status: LockStatus,
    /// Reason when not granted
    pub message: Option<String>,
}

impl LockResult {
    /// All locks granted
    pub fn locked() -> Self {
        Self {
            status: LockStatus::Locked,
            message: None,
        }
    }

    /// Nothing granted
    pub fn not_locked(message: impl Into<String>) -> Self {
        Self {
            status: LockStatus::NotLocked,
            message: Some(message.into()),
        }
    }

    /// Nothing granted because of a deadlock
    pub fn dead_locked(message: impl Into<String>) -> Self {
        Self {
            status: LockStatus::DeadLocked,
            message: Some(message.into()),
        }
    }

    /// True when every lock was granted
    pub fn is_granted(&self) -> bool {
        self.status == LockStatus::Locked
    }
}

/// Produces the log bytes of a transaction on demand
///
/// The master invokes it while committing; remote clients stream it straight
/// into the request message. It is never materialized by the caller first.
pub trait TxExtractor {
    /// Write the transaction's log bytes into `buffer`
    fn extract(&mut self, buffer: &mut dyn LogBuffer) -> Result<()>;
}

impl<F> TxExtractor for F
where
    F: FnMut(&mut dyn LogBuffer) -> Result<()>,
{
    fn extract(&mut self, buffer: &mut dyn LogBuffer) -> Result<()> {
        self(buffer)
    }
}

/// Extractor over transaction bytes already at hand
pub struct TxData<'a>(pub &'a [u8]);

impl TxExtractor for TxData<'_> {
    fn extract(&mut self, buffer: &mut dyn LogBuffer) -> Result<()> {
        buffer.put_bytes(self.0)
    }
}

/// The operations a slave may invoke on the master
pub trait Master: Send + Sync {
    /// Reserve a range of ids of one kind
    fn allocate_ids(&self, id_type: IdType) -> Result<Response<IdAllocation>>;

    /// Intern a relationship type name, returning its id
    fn create_relationship_type(
        &self,
        context: &SlaveContext,
        name: &str,
    ) -> Result<Response<i32>>;

    /// Start a transaction identified by `context`
    fn initialize_tx(&self, context: &SlaveContext) -> Result<Response<()>>;

    /// Lock nodes exclusively, all or nothing
    fn acquire_node_write_lock(
        &self,
        context: &SlaveContext,
        nodes: &[u64],
    ) -> Result<Response<LockResult>>;

    /// Lock nodes shared, all or nothing
    fn acquire_node_read_lock(
        &self,
        context: &SlaveContext,
        nodes: &[u64],
    ) -> Result<Response<LockResult>>;

    /// Lock relationships exclusively, all or nothing
    fn acquire_relationship_write_lock(
        &self,
        context: &SlaveContext,
        relationships: &[u64],
    ) -> Result<Response<LockResult>>;

    /// Lock relationships shared, all or nothing
    fn acquire_relationship_read_lock(
        &self,
        context: &SlaveContext,
        relationships: &[u64],
    ) -> Result<Response<LockResult>>;

    /// Commit a transaction touching the data source `resource`
    ///
    /// Requires a prior `initialize_tx`. Returns the committed tx id; a retry
    /// with the same context returns the same id without committing twice.
    fn commit_single_resource_transaction(
        &self,
        context: &SlaveContext,
        resource: &str,
        extractor: &mut dyn TxExtractor,
    ) -> Result<Response<u64>>;

    /// End the transaction, releasing its locks
    fn finish_transaction(&self, context: &SlaveContext, success: bool) -> Result<Response<()>>;

    /// Fetch whatever the caller has not applied yet
    fn pull_updates(&self, context: &SlaveContext) -> Result<Response<()>>;

    /// `(master_id, checksum)` of a committed main-store transaction
    fn get_master_id_for_committed_tx(
        &self,
        tx_id: u64,
        store_id: &StoreId,
    ) -> Result<Response<(i32, u64)>>;

    /// Copy every store file to `writer`; the response carries what was
    /// committed during the copy
    fn copy_store(
        &self,
        context: &SlaveContext,
        writer: &mut dyn StoreWriter,
    ) -> Result<Response<()>>;

    /// Transactions `start..=end` of one data source
    fn copy_transactions(
        &self,
        context: &SlaveContext,
        data_source: &str,
        start: u64,
        end: u64,
    ) -> Result<Response<()>>;

    /// Lock an index entry exclusively
    fn acquire_index_write_lock(
        &self,
        context: &SlaveContext,
        index: &str,
        key: &str,
    ) -> Result<Response<LockResult>>;

    /// Lock an index entry shared
    fn acquire_index_read_lock(
        &self,
        context: &SlaveContext,
        index: &str,
        key: &str,
    ) -> Result<Response<LockResult>>;
}
