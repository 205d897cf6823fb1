//! Branch detection
//!
//! Before a transaction received from a master is applied, its declared
//! `(master_id, checksum)` is compared against what the local store recorded
//! for the same transaction id, if anything. Disagreement means the two
//! histories forked at that id.

use crate::database::DataSource;
use crate::{Error, Result};
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Checksum a master assigns to a transaction when committing it
pub fn tx_checksum(tx_id: u64, data: &[u8]) -> u64 {
    xxh3_64_with_seed(data, tx_id)
}

/// Compare a freshly received checksum against a stored one
///
/// Old masters wrote checksums whose upper 32 bits were all set. A stored value
/// with that pattern matches a fresh value with the same lower 32 bits. The
/// reverse does not hold, so argument order matters.
pub fn checksum_matches(fresh: u64, stored: u64) -> bool {
    const HIGH: u64 = 0xFFFF_FFFF_0000_0000;
    const LOW: u64 = 0x0000_0000_FFFF_FFFF;
    if fresh == stored {
        return true;
    }
    stored & HIGH == HIGH && fresh & LOW == stored & LOW
}

/// Verifies incoming transactions before they are applied
pub trait TxChecksumVerifier: Send + Sync {
    /// Fail with [`Error::BranchedData`] if `tx_id` is recorded locally with a
    /// different master or checksum
    fn assert_match(&self, tx_id: u64, master_id: i32, checksum: u64) -> Result<()>;
}

/// Accepts everything; used where there is no local history to protect
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysMatch;

impl TxChecksumVerifier for AlwaysMatch {
    fn assert_match(&self, _tx_id: u64, _master_id: i32, _checksum: u64) -> Result<()> {
        Ok(())
    }
}

/// Verifies against the local transaction log of a data source
pub struct BranchDetectingTxVerifier {
    data_source: Arc<DataSource>,
}

impl BranchDetectingTxVerifier {
    /// Verifier over `data_source`
    pub fn new(data_source: Arc<DataSource>) -> Self {
        Self { data_source }
    }
}

impl TxChecksumVerifier for BranchDetectingTxVerifier {
    fn assert_match(&self, tx_id: u64, master_id: i32, checksum: u64) -> Result<()> {
        let recorded = match self.data_source.master_for_committed_tx(tx_id) {
            Ok(recorded) => recorded,
            Err(e) => {
                tracing::error!(
                    "Couldn't verify checksum for tx {} in {}: {}",
                    tx_id,
                    self.data_source.name(),
                    e
                );
                return Err(Error::branched(format!(
                    "unable to verify tx {} in {}: {}",
                    tx_id,
                    self.data_source.name(),
                    e
                )));
            }
        };

        let Some((local_master, local_checksum)) = recorded else {
            return Ok(());
        };
        if master_id != local_master || !checksum_matches(checksum, local_checksum) {
            return Err(Error::branched(format!(
                "{}: txId:{} master:{} checksum:{} doesn't match local master:{} checksum:{}",
                self.data_source.name(),
                tx_id,
                master_id,
                checksum,
                local_master,
                local_checksum
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::CommittedTransaction;

    fn verifier_with_tx5() -> (tempfile::TempDir, BranchDetectingTxVerifier, u64) {
        let dir = tempfile::tempdir().unwrap();
        let ds = Arc::new(DataSource::open(dir.path(), "graph").unwrap());
        let mut c1 = 0;
        for id in 1..=5 {
            let data = vec![id as u8; 4];
            let checksum = tx_checksum(id, &data);
            ds.apply(&CommittedTransaction::new(id, 1, checksum, data))
                .unwrap();
            c1 = checksum;
        }
        (dir, BranchDetectingTxVerifier::new(ds), c1)
    }

    #[test]
    fn test_other_master_for_same_tx_is_a_branch() {
        let (_dir, verifier, c1) = verifier_with_tx5();
        let err = verifier.assert_match(5, 2, c1).unwrap_err();
        assert!(matches!(err, Error::BranchedData(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_matching_record_passes() {
        let (_dir, verifier, c1) = verifier_with_tx5();
        verifier.assert_match(5, 1, c1).unwrap();
    }

    #[test]
    fn test_unknown_tx_passes() {
        let (_dir, verifier, _) = verifier_with_tx5();
        verifier.assert_match(6, 9, 12345).unwrap();
    }

    #[test]
    fn test_other_checksum_is_a_branch() {
        let (_dir, verifier, c1) = verifier_with_tx5();
        assert!(verifier.assert_match(5, 1, c1 ^ 1).is_err());
    }

    #[test]
    fn test_high_bits_quirk_is_one_directional() {
        let stored_buggy = 0xFFFF_FFFF_1234_5678;
        let fresh = 0x0000_0000_1234_5678;
        assert!(checksum_matches(fresh, stored_buggy));
        assert!(!checksum_matches(stored_buggy, fresh));
        assert!(!checksum_matches(0x0000_0000_1234_5679, stored_buggy));
    }

    #[test]
    fn test_checksum_is_seeded_by_tx_id() {
        assert_ne!(tx_checksum(1, b"same"), tx_checksum(2, b"same"));
        assert_eq!(tx_checksum(1, b"same"), tx_checksum(1, b"same"));
    }

    #[test]
    fn test_always_match() {
        AlwaysMatch.assert_match(5, 99, 0).unwrap();
    }
}
