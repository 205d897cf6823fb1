//! Local store: identity plus one transaction log per data source
//!
//! Record-level store files are opaque here. Anything in the store directory
//! that is not an active log segment is considered part of the store and is
//! shipped as-is by store copy and backup.

use crate::context::LastAppliedTx;
use crate::log::{CommittedTransaction, TransactionLog};
use crate::store_id::{STORE_ID_FILE, StoreId};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name of the main graph store data source
pub const DEFAULT_DATA_SOURCE_NAME: &str = "graph";

/// Name of the auxiliary index data source
pub const INDEX_DATA_SOURCE_NAME: &str = "index";

/// A named logical log
pub struct DataSource {
    name: String,
    log: TransactionLog,
}

impl DataSource {
    /// Open the data source `name` in `dir`
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            log: TransactionLog::open(dir, name)?,
        })
    }

    /// Data source name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transaction log
    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    /// Highest committed transaction id
    pub fn last_committed_tx(&self) -> u64 {
        self.log.last_committed_tx()
    }

    /// `(master_id, checksum)` recorded for a committed transaction
    pub fn master_for_committed_tx(&self, tx_id: u64) -> Result<Option<(i32, u64)>> {
        self.log.master_for_committed_tx(tx_id)
    }

    /// Apply a transaction received from a master
    pub fn apply(&self, tx: &CommittedTransaction) -> Result<()> {
        self.log.append(tx)
    }
}

/// A file belonging to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFile {
    /// Path relative to the store directory
    pub name: String,
    /// Absolute path
    pub path: PathBuf,
    /// Size at listing time
    pub len: u64,
}

/// Local database instance
pub struct Database {
    store_dir: PathBuf,
    store_id: StoreId,
    data_sources: BTreeMap<String, Arc<DataSource>>,
}

impl Database {
    /// Open a store with the main graph and index data sources
    pub fn open(store_dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(
            store_dir,
            &[DEFAULT_DATA_SOURCE_NAME, INDEX_DATA_SOURCE_NAME],
        )
    }

    /// Open a store with an explicit set of data sources
    pub fn open_with(store_dir: impl AsRef<Path>, names: &[&str]) -> Result<Self> {
        let store_dir = store_dir.as_ref().to_path_buf();
        if !names.contains(&DEFAULT_DATA_SOURCE_NAME) {
            return Err(Error::config(format!(
                "data source '{}' is required",
                DEFAULT_DATA_SOURCE_NAME
            )));
        }
        std::fs::create_dir_all(&store_dir)?;
        let store_id = StoreId::load_or_create(&store_dir)?;

        let mut data_sources = BTreeMap::new();
        for name in names {
            data_sources.insert(
                name.to_string(),
                Arc::new(DataSource::open(&store_dir, name)?),
            );
        }

        Ok(Self {
            store_dir,
            store_id,
            data_sources,
        })
    }

    /// Store directory
    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    /// Store identity
    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    /// Look up a data source
    pub fn data_source(&self, name: &str) -> Result<&Arc<DataSource>> {
        self.data_sources
            .get(name)
            .ok_or_else(|| Error::transaction(format!("unknown data source '{}'", name)))
    }

    /// The main graph store data source
    pub fn main_data_source(&self) -> &Arc<DataSource> {
        &self.data_sources[DEFAULT_DATA_SOURCE_NAME]
    }

    /// All data sources, ordered by name
    pub fn data_sources(&self) -> impl Iterator<Item = &Arc<DataSource>> {
        self.data_sources.values()
    }

    /// Applied transaction vector of this store
    pub fn last_applied(&self) -> Vec<LastAppliedTx> {
        self.data_sources
            .values()
            .map(|ds| LastAppliedTx::new(ds.name(), ds.last_committed_tx()))
            .collect()
    }

    /// Rotate every log, returning the vector at rotation time
    pub fn rotate_logs(&self) -> Result<Vec<LastAppliedTx>> {
        let mut snapshot = Vec::with_capacity(self.data_sources.len());
        for ds in self.data_sources.values() {
            let last = ds.log().rotate()?;
            snapshot.push(LastAppliedTx::new(ds.name(), last));
        }
        Ok(snapshot)
    }

    /// Every store file except the active log segments, sorted by name
    ///
    /// The store id file is listed first so a copy is identifiable as soon as
    /// it starts arriving.
    pub fn store_files(&self) -> Result<Vec<StoreFile>> {
        let active: Vec<String> = self
            .data_sources
            .values()
            .map(|ds| ds.log().active_segment_name())
            .collect();

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.store_dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if active.contains(&name) {
                continue;
            }
            files.push(StoreFile {
                name,
                path: entry.path(),
                len: metadata.len(),
            });
        }
        files.sort_by(|a, b| {
            (a.name != STORE_ID_FILE, &a.name).cmp(&(b.name != STORE_ID_FILE, &b.name))
        });
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_default_data_sources() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let names: Vec<_> = db.data_sources().map(|ds| ds.name().to_string()).collect();
        assert_eq!(names, vec!["graph", "index"]);
        assert_eq!(
            db.last_applied(),
            vec![LastAppliedTx::new("graph", 0), LastAppliedTx::new("index", 0)]
        );
    }

    #[test]
    fn test_store_id_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = Database::open(dir.path()).unwrap().store_id();
        assert_eq!(Database::open(dir.path()).unwrap().store_id(), id);
    }

    #[test]
    fn test_store_files_exclude_active_segments() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("nodestore.db"), b"nodes").unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.main_data_source()
            .apply(&CommittedTransaction::new(1, 1, 7, b"x".to_vec()))
            .unwrap();
        db.rotate_logs().unwrap();

        let names: Vec<_> = db
            .store_files()
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(
            names,
            vec!["store_id", "graph.log.v0", "index.log.v0", "nodestore.db"]
        );
    }

    #[test]
    fn test_main_data_source_is_required() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Database::open_with(dir.path(), &["index"]).is_err());
    }
}
