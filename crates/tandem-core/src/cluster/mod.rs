//! Cluster membership
//!
//! Members publish themselves in a coordination service; a [`ClusterClient`]
//! reads that membership to find the master, the slaves and their backup
//! ports.

pub mod client;
pub mod coordinator;
pub mod machine;
pub mod membership;

pub use client::{ClusterClient, DEFAULT_SESSION_TIMEOUT};
pub use coordinator::{Coordinator, InMemoryCoordinator, SessionState};
pub use machine::{Machine, Role, elect_master};
pub use membership::{DEFAULT_CLUSTER_NAME, Membership, StaticCoordinator};
