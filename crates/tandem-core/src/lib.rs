//! Tandem Core - replication for an embedded graph database
//!
//! This crate implements master/slave log shipping between cluster members:
//! - Block framing of messages into 256-byte chunks over any byte stream
//! - A master RPC contract whose responses piggyback missing transactions
//! - Branch detection comparing `(master id, checksum)` of committed transactions
//! - Cluster membership through a coordination service
//! - Online full and incremental backup
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │   Slave session / Master broker / Backup     │
//! │  (context stamping, apply, re-resolution)    │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │        Master contract / Cluster client       │
//! │   (locks, ids, commits, store copy, roles)   │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │        Protocol / Transport / Server         │
//! │  (request layout, channel pool, worker pool) │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │         Log buffers / Transaction logs        │
//! │  (block framing, direct-mapped log writes)   │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backup;
pub mod broker;
pub mod buffer;
pub mod cluster;
pub mod config;
pub mod context;
pub mod database;
pub mod error;
pub mod log;
pub mod master;
pub mod protocol;
pub mod response;
pub mod retry;
pub mod server;
pub mod slave;
pub mod store_copy;
pub mod store_id;
pub mod testing;
pub mod transport;
pub mod verifier;

pub use backup::{Backup, BackupClient, BackupImpl, BackupServer, OnlineBackup};
pub use broker::MasterBroker;
pub use cluster::{ClusterClient, Machine};
pub use config::ReplicationConfig;
pub use context::{LastAppliedTx, SlaveContext};
pub use database::Database;
pub use error::{Error, Outcome, RemoteError, RemoteErrorKind, Result};
pub use master::{Master, MasterClient, MasterImpl, MasterServer};
pub use response::Response;
pub use slave::SlaveSession;
pub use store_id::StoreId;
