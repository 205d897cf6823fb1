//! Slave replication cursor

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Last transaction a caller has applied for one data source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastAppliedTx {
    /// Data source name
    pub data_source_name: String,
    /// Highest applied transaction id
    pub tx_id: u64,
}

impl LastAppliedTx {
    /// Create an entry
    pub fn new(data_source_name: impl Into<String>, tx_id: u64) -> Self {
        Self {
            data_source_name: data_source_name.into(),
            tx_id,
        }
    }
}

/// A slave's replication cursor and request identity
///
/// Identity is `(session_id, machine_id, event_identifier)`; the applied
/// vector and the last known `(master_id, checksum)` are informational and do
/// not take part in equality or hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveContext {
    /// Startup timestamp of the slave process
    pub session_id: i64,
    /// Machine id of the slave
    pub machine_id: i32,
    /// Top-level transaction counter on the slave
    pub event_identifier: i32,
    /// Per data source applied transaction ids
    pub last_applied_transactions: Vec<LastAppliedTx>,
    /// Master that committed the last applied main-store transaction
    pub master_id: i32,
    /// Checksum of the last applied main-store transaction
    pub checksum: u64,
}

impl SlaveContext {
    /// Context with no identity and no history
    pub const EMPTY: SlaveContext = SlaveContext {
        session_id: -1,
        machine_id: -1,
        event_identifier: -1,
        last_applied_transactions: Vec::new(),
        master_id: -1,
        checksum: 0,
    };

    /// Create a context
    pub fn new(
        session_id: i64,
        machine_id: i32,
        event_identifier: i32,
        last_applied_transactions: Vec<LastAppliedTx>,
        master_id: i32,
        checksum: u64,
    ) -> Self {
        Self {
            session_id,
            machine_id,
            event_identifier,
            last_applied_transactions,
            master_id,
            checksum,
        }
    }

    /// Stateless context carrying only an applied vector
    pub fn anonymous(last_applied_transactions: Vec<LastAppliedTx>) -> Self {
        Self {
            last_applied_transactions,
            ..Self::EMPTY
        }
    }

    /// True for contexts with the EMPTY identity
    pub fn is_anonymous(&self) -> bool {
        self.session_id == Self::EMPTY.session_id
            && self.machine_id == Self::EMPTY.machine_id
            && self.event_identifier == Self::EMPTY.event_identifier
    }

    /// Applied transaction id for a data source
    pub fn last_applied(&self, data_source_name: &str) -> Option<u64> {
        self.last_applied_transactions
            .iter()
            .find(|tx| tx.data_source_name == data_source_name)
            .map(|tx| tx.tx_id)
    }
}

impl PartialEq for SlaveContext {
    fn eq(&self, other: &Self) -> bool {
        self.event_identifier == other.event_identifier
            && self.machine_id == other.machine_id
            && self.session_id == other.session_id
    }
}

impl Eq for SlaveContext {}

impl Hash for SlaveContext {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.session_id.hash(state);
        self.machine_id.hash(state);
        self.event_identifier.hash(state);
    }
}

impl fmt::Display for SlaveContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SlaveContext[session:{}, machine:{}, event:{}, txs:[",
            self.session_id, self.machine_id, self.event_identifier
        )?;
        for (i, tx) in self.last_applied_transactions.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", tx.data_source_name, tx.tx_id)?;
        }
        write!(f, "]]")
    }
}
