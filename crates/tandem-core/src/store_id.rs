//! Database instance identity

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// File holding the serialized store id inside a store directory
pub const STORE_ID_FILE: &str = "store_id";

/// Current store format version
pub const CURRENT_STORE_VERSION: i64 = 1;

/// Serialized size in bytes
pub const STORE_ID_SIZE: usize = 24;

/// Immutable identity of a database instance
///
/// Two instances with different store ids are never replicas of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreId {
    /// Creation time (Unix millis)
    pub creation_time: i64,
    /// Random id chosen at creation
    pub random_id: i64,
    /// Store format version
    pub store_version: i64,
}

impl StoreId {
    /// Create a store id from explicit parts
    pub fn new(creation_time: i64, random_id: i64, store_version: i64) -> Self {
        Self {
            creation_time,
            random_id,
            store_version,
        }
    }

    /// Create a fresh identity for a new store
    pub fn generate() -> Self {
        Self::new(
            chrono::Utc::now().timestamp_millis(),
            rand::random::<i64>(),
            CURRENT_STORE_VERSION,
        )
    }

    /// Encode as 24 big-endian bytes
    pub fn serialize(&self) -> [u8; STORE_ID_SIZE] {
        let mut out = [0u8; STORE_ID_SIZE];
        out[0..8].copy_from_slice(&self.creation_time.to_be_bytes());
        out[8..16].copy_from_slice(&self.random_id.to_be_bytes());
        out[16..24].copy_from_slice(&self.store_version.to_be_bytes());
        out
    }

    /// Decode from the 24-byte form
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != STORE_ID_SIZE {
            return Err(Error::serialization(format!(
                "store id must be {} bytes, got {}",
                STORE_ID_SIZE,
                bytes.len()
            )));
        }
        let field = |range: std::ops::Range<usize>| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[range]);
            i64::from_be_bytes(buf)
        };
        Ok(Self::new(field(0..8), field(8..16), field(16..24)))
    }

    /// Coordination-service root path of the cluster serving this store
    pub fn root_path(&self) -> String {
        format!("/{}_{}", self.creation_time, self.random_id)
    }

    /// Load the store id from a store directory, creating one if absent
    pub fn load_or_create(store_dir: &Path) -> Result<Self> {
        let path = store_dir.join(STORE_ID_FILE);
        if path.exists() {
            let bytes = std::fs::read(&path)?;
            return Self::deserialize(&bytes);
        }
        let id = Self::generate();
        id.persist(store_dir)?;
        tracing::info!("Created store {} in {}", id, store_dir.display());
        Ok(id)
    }

    /// Write the store id into a store directory
    pub fn persist(&self, store_dir: &Path) -> Result<()> {
        std::fs::write(store_dir.join(STORE_ID_FILE), self.serialize())?;
        Ok(())
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StoreId[time:{}, id:{}, version:{}]",
            self.creation_time, self.random_id, self.store_version
        )
    }
}
