//! Per data source transaction log
//!
//! Segment files are named `<name>.log.v<N>`; only the highest version is
//! written to. Each record is
//!
//! ```text
//! [tx_id:8][master_id:4][checksum:8][len:4][data:len]
//! ```
//!
//! Records are written through a [`DirectMappedLogBuffer`] and forced before
//! `append` returns. An index of every record is rebuilt by scanning the
//! segments on open.

use crate::buffer::{DirectMappedLogBuffer, LogBuffer};
use crate::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Size of the fixed record header
pub const RECORD_HEADER_SIZE: u64 = 24;

/// A committed transaction as shipped between machines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTransaction {
    /// Transaction id, contiguous per data source
    pub tx_id: u64,
    /// Machine that was master when the transaction committed
    pub master_id: i32,
    /// Checksum assigned by that master
    pub checksum: u64,
    /// Opaque log bytes
    pub data: Vec<u8>,
}

impl CommittedTransaction {
    /// Create a transaction
    pub fn new(tx_id: u64, master_id: i32, checksum: u64, data: Vec<u8>) -> Self {
        Self {
            tx_id,
            master_id,
            checksum,
            data,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TxMeta {
    tx_id: u64,
    master_id: i32,
    checksum: u64,
    version: u64,
    offset: u64,
    len: u32,
}

struct LogState {
    version: u64,
    writer: DirectMappedLogBuffer,
    index: Vec<TxMeta>,
    /// Set when a failed append could not be rolled back
    poisoned: Option<String>,
}

impl LogState {
    fn last_committed_tx(&self) -> u64 {
        self.index.last().map(|m| m.tx_id).unwrap_or(0)
    }
}

/// Append-only transaction log of one data source
pub struct TransactionLog {
    dir: PathBuf,
    name: String,
    state: Mutex<LogState>,
}

impl TransactionLog {
    /// Open (or create) the log `name` in `dir`
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let versions = segment_versions(dir, name)?;

        let mut index = Vec::new();
        let last = versions.last().copied();
        for version in &versions {
            let path = segment_path(dir, name, *version);
            scan_segment(&path, *version, Some(*version) == last, &mut index)?;
        }

        let version = last.unwrap_or(0);
        let writer = open_writer(&segment_path(dir, name, version))?;

        tracing::debug!(
            "Opened log {} at version {} with {} transactions",
            name,
            version,
            index.len()
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            state: Mutex::new(LogState {
                version,
                writer,
                index,
                poisoned: None,
            }),
        })
    }

    /// Data source name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Highest committed transaction id (0 when empty)
    pub fn last_committed_tx(&self) -> u64 {
        self.state.lock().last_committed_tx()
    }

    /// Version of the segment currently written to
    pub fn current_version(&self) -> u64 {
        self.state.lock().version
    }

    /// Append a transaction received from a master
    ///
    /// The id must be exactly one past the last committed id.
    pub fn append(&self, tx: &CommittedTransaction) -> Result<()> {
        let mut state = self.state.lock();
        self.check_writable(&state)?;
        let expected = state.last_committed_tx() + 1;
        if tx.tx_id != expected {
            return Err(Error::transaction(format!(
                "{}: expected tx {} but got {}",
                self.name, expected, tx.tx_id
            )));
        }
        self.write_record(&mut state, tx)
    }

    /// Commit new data as the next transaction, assigning its id
    ///
    /// `checksum_of` receives the assigned id and the data.
    pub fn commit_next(
        &self,
        master_id: i32,
        data: Vec<u8>,
        checksum_of: impl FnOnce(u64, &[u8]) -> u64,
    ) -> Result<CommittedTransaction> {
        let mut state = self.state.lock();
        self.check_writable(&state)?;
        let tx_id = state.last_committed_tx() + 1;
        let checksum = checksum_of(tx_id, &data);
        let tx = CommittedTransaction::new(tx_id, master_id, checksum, data);
        self.write_record(&mut state, &tx)?;
        Ok(tx)
    }

    /// `(master_id, checksum)` recorded for `tx_id`, read back from disk
    pub fn master_for_committed_tx(&self, tx_id: u64) -> Result<Option<(i32, u64)>> {
        let meta = {
            let state = self.state.lock();
            match find(&state.index, tx_id) {
                Some(meta) => meta,
                None => return Ok(None),
            }
        };
        let mut file = File::open(segment_path(&self.dir, &self.name, meta.version))?;
        file.seek(SeekFrom::Start(meta.offset))?;
        let header = read_header(&mut file)?;
        if header.tx_id != tx_id {
            return Err(Error::transaction(format!(
                "{}: record at offset {} holds tx {} instead of {}",
                self.name, meta.offset, header.tx_id, tx_id
            )));
        }
        Ok(Some((header.master_id, header.checksum)))
    }

    /// Lazily read transactions `from..=to`
    ///
    /// The returned iterator keeps the segment it is reading open.
    pub fn extract(&self, from: u64, to: u64) -> Result<TransactionIter> {
        let state = self.state.lock();
        let from = from.max(1);
        if from > to {
            return Ok(TransactionIter::empty(&self.dir, &self.name));
        }
        let last = state.last_committed_tx();
        if to > last {
            return Err(Error::transaction(format!(
                "{}: tx {} requested but last committed is {}",
                self.name, to, last
            )));
        }
        let first = state.index.first().map(|m| m.tx_id).unwrap_or(1);
        if from < first {
            return Err(Error::transaction(format!(
                "{}: tx {} is no longer retained (first is {})",
                self.name, from, first
            )));
        }
        let start = (from - first) as usize;
        let end = (to - first) as usize;
        Ok(TransactionIter {
            dir: self.dir.clone(),
            name: self.name.clone(),
            metas: state.index[start..=end].to_vec().into_iter(),
            open: None,
        })
    }

    /// Every transaction after `tx_id`
    pub fn extract_after(&self, tx_id: u64) -> Result<TransactionIter> {
        let last = self.last_committed_tx();
        self.extract(tx_id.saturating_add(1), last)
    }

    /// Close the current segment and start a new one
    ///
    /// Returns the last committed transaction id at the time of rotation.
    pub fn rotate(&self) -> Result<u64> {
        let mut state = self.state.lock();
        state.writer.force()?;
        let next = state.version + 1;
        state.writer = open_writer(&segment_path(&self.dir, &self.name, next))?;
        state.version = next;
        let last = state.last_committed_tx();
        tracing::info!("Rotated log {} to version {} at tx {}", self.name, next, last);
        Ok(last)
    }

    fn check_writable(&self, state: &LogState) -> Result<()> {
        match &state.poisoned {
            Some(cause) => Err(Error::transaction(format!(
                "{}: log is read-only after a failed append ({}); reopen it",
                self.name, cause
            ))),
            None => Ok(()),
        }
    }

    fn write_record(&self, state: &mut LogState, tx: &CommittedTransaction) -> Result<()> {
        let offset = state.writer.file_channel_position();
        let written = put_record(&mut state.writer, tx);
        self.finish_record(state, tx, offset, written)
    }

    /// Index a written record, or cut the segment back to `offset`
    fn finish_record(
        &self,
        state: &mut LogState,
        tx: &CommittedTransaction,
        offset: u64,
        written: Result<u32>,
    ) -> Result<()> {
        let len = match written {
            Ok(len) => len,
            Err(e) => {
                if let Err(rollback) = self.discard_tail(state, offset) {
                    tracing::error!(
                        "Log {} could not drop partial tx {} at offset {}: {}",
                        self.name,
                        tx.tx_id,
                        offset,
                        rollback
                    );
                    state.poisoned = Some(rollback.to_string());
                }
                return Err(e);
            }
        };
        let version = state.version;
        state.index.push(TxMeta {
            tx_id: tx.tx_id,
            master_id: tx.master_id,
            checksum: tx.checksum,
            version,
            offset,
            len,
        });
        Ok(())
    }

    fn discard_tail(&self, state: &mut LogState, offset: u64) -> Result<()> {
        let path = segment_path(&self.dir, &self.name, state.version);
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(offset)?;
        file.sync_data()?;
        state.writer = open_writer(&path)?;
        tracing::warn!("Dropped partial record at offset {} of {}", offset, path.display());
        Ok(())
    }

    /// File name of the segment currently written to
    pub fn active_segment_name(&self) -> String {
        segment_name(&self.name, self.state.lock().version)
    }

    /// True if `file_name` is a segment of this log
    pub fn is_segment(&self, file_name: &str) -> bool {
        parse_version(&self.name, file_name).is_some()
    }
}

fn put_record<B: LogBuffer + ?Sized>(out: &mut B, tx: &CommittedTransaction) -> Result<u32> {
    let len = u32::try_from(tx.data.len())
        .map_err(|_| Error::transaction(format!("tx {} too large", tx.tx_id)))?;
    out.put_i64(tx.tx_id as i64)?;
    out.put_i32(tx.master_id)?;
    out.put_i64(tx.checksum as i64)?;
    out.put_i32(len as i32)?;
    out.put_bytes(&tx.data)?;
    out.force()?;
    Ok(len)
}

fn find(index: &[TxMeta], tx_id: u64) -> Option<TxMeta> {
    let first = index.first()?.tx_id;
    if tx_id < first {
        return None;
    }
    index.get((tx_id - first) as usize).copied()
}

/// Segment file name for a log version
pub fn segment_name(name: &str, version: u64) -> String {
    format!("{}.log.v{}", name, version)
}

fn segment_path(dir: &Path, name: &str, version: u64) -> PathBuf {
    dir.join(segment_name(name, version))
}

fn parse_version(name: &str, file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(name)?
        .strip_prefix(".log.v")?
        .parse()
        .ok()
}

fn segment_versions(dir: &Path, name: &str) -> Result<Vec<u64>> {
    let mut versions = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(version) = entry
            .file_name()
            .to_str()
            .and_then(|f| parse_version(name, f))
        {
            versions.push(version);
        }
    }
    versions.sort_unstable();
    Ok(versions)
}

fn open_writer(path: &Path) -> Result<DirectMappedLogBuffer> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    file.seek(SeekFrom::End(0))?;
    DirectMappedLogBuffer::new(file)
}

struct RecordHeader {
    tx_id: u64,
    master_id: i32,
    checksum: u64,
    len: u32,
}

fn read_header<R: Read>(source: &mut R) -> Result<RecordHeader> {
    Ok(RecordHeader {
        tx_id: source.read_u64::<BigEndian>()?,
        master_id: source.read_i32::<BigEndian>()?,
        checksum: source.read_u64::<BigEndian>()?,
        len: source.read_u32::<BigEndian>()?,
    })
}

/// Fill `buf`, returning how many bytes were available before EOF
fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn scan_segment(path: &Path, version: u64, is_last: bool, index: &mut Vec<TxMeta>) -> Result<()> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut offset = 0u64;

    loop {
        let mut header_bytes = [0u8; RECORD_HEADER_SIZE as usize];
        let got = read_full(&mut reader, &mut header_bytes)?;
        if got == 0 {
            return Ok(());
        }
        let complete = got == header_bytes.len() && {
            let header = read_header(&mut &header_bytes[..])?;
            let end = offset + RECORD_HEADER_SIZE + header.len as u64;
            if end <= file_len {
                let expected = index.last().map(|m| m.tx_id + 1).unwrap_or(header.tx_id);
                if header.tx_id != expected {
                    return Err(Error::transaction(format!(
                        "{}: found tx {} where {} was expected",
                        path.display(),
                        header.tx_id,
                        expected
                    )));
                }
                reader.seek_relative(header.len as i64)?;
                index.push(TxMeta {
                    tx_id: header.tx_id,
                    master_id: header.master_id,
                    checksum: header.checksum,
                    version,
                    offset,
                    len: header.len,
                });
                offset = end;
                true
            } else {
                false
            }
        };
        if !complete {
            if !is_last {
                return Err(Error::malformed(format!(
                    "{}: truncated record at offset {}",
                    path.display(),
                    offset
                )));
            }
            tracing::warn!(
                "Truncating partial record at offset {} of {}",
                offset,
                path.display()
            );
            OpenOptions::new().write(true).open(path)?.set_len(offset)?;
            return Ok(());
        }
    }
}

/// Lazy reader over a range of committed transactions
pub struct TransactionIter {
    dir: PathBuf,
    name: String,
    metas: std::vec::IntoIter<TxMeta>,
    open: Option<(u64, File)>,
}

impl TransactionIter {
    fn empty(dir: &Path, name: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            metas: Vec::new().into_iter(),
            open: None,
        }
    }

    /// Transactions not yet read
    pub fn remaining(&self) -> usize {
        self.metas.len()
    }

    fn read(&mut self, meta: TxMeta) -> Result<CommittedTransaction> {
        if !matches!(&self.open, Some((version, _)) if *version == meta.version) {
            let file = File::open(segment_path(&self.dir, &self.name, meta.version))?;
            self.open = Some((meta.version, file));
        }
        let Some((_, file)) = self.open.as_mut() else {
            return Err(Error::internal("segment not open"));
        };
        file.seek(SeekFrom::Start(meta.offset + RECORD_HEADER_SIZE))?;
        let mut data = vec![0u8; meta.len as usize];
        file.read_exact(&mut data)?;
        Ok(CommittedTransaction::new(
            meta.tx_id,
            meta.master_id,
            meta.checksum,
            data,
        ))
    }
}

impl Iterator for TransactionIter {
    type Item = Result<CommittedTransaction>;

    fn next(&mut self) -> Option<Self::Item> {
        let meta = self.metas.next()?;
        Some(self.read(meta))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.metas.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(id: u64) -> CommittedTransaction {
        CommittedTransaction::new(id, 1, id * 31, format!("tx-{}", id).into_bytes())
    }

    #[test]
    fn test_append_and_extract() {
        let dir = tempfile::tempdir().unwrap();
        let log = TransactionLog::open(dir.path(), "graph").unwrap();
        for id in 1..=5 {
            log.append(&tx(id)).unwrap();
        }
        assert_eq!(log.last_committed_tx(), 5);

        let got: Vec<_> = log.extract(2, 4).unwrap().map(|t| t.unwrap()).collect();
        assert_eq!(got, vec![tx(2), tx(3), tx(4)]);
        assert_eq!(log.extract_after(5).unwrap().count(), 0);
    }

    #[test]
    fn test_out_of_order_append_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let log = TransactionLog::open(dir.path(), "graph").unwrap();
        log.append(&tx(1)).unwrap();
        assert!(matches!(log.append(&tx(3)), Err(Error::Transaction(_))));
        assert!(matches!(log.append(&tx(1)), Err(Error::Transaction(_))));
    }

    #[test]
    fn test_reopen_rebuilds_index_across_rotation() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = TransactionLog::open(dir.path(), "graph").unwrap();
            log.append(&tx(1)).unwrap();
            log.append(&tx(2)).unwrap();
            assert_eq!(log.rotate().unwrap(), 2);
            log.append(&tx(3)).unwrap();
        }
        let log = TransactionLog::open(dir.path(), "graph").unwrap();
        assert_eq!(log.current_version(), 1);
        assert_eq!(log.last_committed_tx(), 3);
        assert_eq!(log.master_for_committed_tx(2).unwrap(), Some((1, 62)));
        let all: Vec<_> = log.extract(1, 3).unwrap().map(|t| t.unwrap()).collect();
        assert_eq!(all, vec![tx(1), tx(2), tx(3)]);
    }

    #[test]
    fn test_partial_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = TransactionLog::open(dir.path(), "graph").unwrap();
            log.append(&tx(1)).unwrap();
        }
        let path = dir.path().join(segment_name("graph", 0));
        let good_len = std::fs::metadata(&path).unwrap().len();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 2, 0, 0]);
        std::fs::write(&path, bytes).unwrap();

        let log = TransactionLog::open(dir.path(), "graph").unwrap();
        assert_eq!(log.last_committed_tx(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);
        log.append(&tx(2)).unwrap();
    }

    #[test]
    fn test_commit_next_assigns_ids() {
        let dir = tempfile::tempdir().unwrap();
        let log = TransactionLog::open(dir.path(), "graph").unwrap();
        let first = log.commit_next(4, b"a".to_vec(), |id, _| id + 100).unwrap();
        let second = log.commit_next(4, b"b".to_vec(), |id, _| id + 100).unwrap();
        assert_eq!((first.tx_id, first.checksum), (1, 101));
        assert_eq!((second.tx_id, second.master_id), (2, 4));
        assert_eq!(log.master_for_committed_tx(3).unwrap(), None);
    }

    /// Passes `budget` bytes through to the file, then fails
    struct FailingBuffer<'a> {
        inner: &'a mut DirectMappedLogBuffer,
        budget: usize,
    }

    impl LogBuffer for FailingBuffer<'_> {
        fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
            let n = bytes.len().min(self.budget);
            self.inner.put_bytes(&bytes[..n])?;
            self.budget -= n;
            if n < bytes.len() {
                self.inner.write_out()?;
                return Err(Error::Io(std::io::Error::other("disk full")));
            }
            Ok(())
        }

        fn write_out(&mut self) -> Result<()> {
            self.inner.write_out()
        }

        fn force(&mut self) -> Result<()> {
            self.inner.force()
        }
    }

    #[test]
    fn test_failed_append_leaves_clean_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(segment_name("graph", 0));
        {
            let log = TransactionLog::open(dir.path(), "graph").unwrap();
            log.append(&tx(1)).unwrap();
            let clean_len = std::fs::metadata(&path).unwrap().len();

            {
                let mut state = log.state.lock();
                let offset = state.writer.file_channel_position();
                let written = put_record(
                    &mut FailingBuffer {
                        inner: &mut state.writer,
                        budget: RECORD_HEADER_SIZE as usize + 2,
                    },
                    &tx(2),
                );
                assert!(std::fs::metadata(&path).unwrap().len() > clean_len);
                assert!(log.finish_record(&mut state, &tx(2), offset, written).is_err());
            }
            assert_eq!(std::fs::metadata(&path).unwrap().len(), clean_len);
            assert_eq!(log.last_committed_tx(), 1);

            log.append(&tx(2)).unwrap();
            let got: Vec<_> = log.extract(1, 2).unwrap().map(|t| t.unwrap()).collect();
            assert_eq!(got, vec![tx(1), tx(2)]);
        }
        let log = TransactionLog::open(dir.path(), "graph").unwrap();
        assert_eq!(log.last_committed_tx(), 2);
        assert_eq!(log.master_for_committed_tx(2).unwrap(), Some((1, 62)));
    }

    #[test]
    fn test_unrecoverable_append_poisons_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = TransactionLog::open(dir.path(), "graph").unwrap();
        log.append(&tx(1)).unwrap();
        {
            let mut state = log.state.lock();
            let offset = state.writer.file_channel_position();
            // The segment is gone, so the tail cannot be cut back.
            state.version = 99;
            let written = Err(Error::Io(std::io::Error::other("disk full")));
            assert!(log.finish_record(&mut state, &tx(2), offset, written).is_err());
            assert!(state.poisoned.is_some());
        }
        assert!(matches!(log.append(&tx(2)), Err(Error::Transaction(_))));
        assert!(log.commit_next(1, b"x".to_vec(), |id, _| id).is_err());
    }

    #[test]
    fn test_extract_beyond_tip_fails() {
        let dir = tempfile::tempdir().unwrap();
        let log = TransactionLog::open(dir.path(), "graph").unwrap();
        log.append(&tx(1)).unwrap();
        assert!(log.extract(1, 2).is_err());
        assert_eq!(log.extract(3, 2).unwrap().count(), 0);
    }
}
