//! Replication wire protocol
//!
//! Every request and every response is one logical message in block framing
//! (see [`crate::buffer::block`]). Primitives are big-endian, request
//! arguments and reply values are bincode.
//!
//! Request:
//!
//! ```text
//! [version:1][request_type:1][len:4][args:len] (commit only: [tx bytes ...])
//! ```
//!
//! Response, a sequence of items ending in a status:
//!
//! ```text
//! ( [FILE:1][name][len:8][bytes:len][crc32:4] )*
//! [OK:1][store_id:24][len:4][value:len][stream_count:4] [name]* stream*
//! [ERROR:1][len:4][remote_error:len]
//!
//! stream = ( [TX:1][tx_id:8][master_id:4][checksum:8][len:4][data] )*
//!          ( [END:1] | [ABORTED:1][len:4][remote_error:len] )
//! ```
//!
//! Stream names come before any stream body so a reader can hand out every
//! stream up front and decode the bodies as they are consumed.

use crate::buffer::{BlockReader, LogBuffer, LogReader};
use crate::context::SlaveContext;
use crate::log::CommittedTransaction;
use crate::master::IdType;
use crate::response::{ResourceReleaser, Response, TransactionStream};
use crate::store_copy::StoreWriter;
use crate::store_id::{STORE_ID_SIZE, StoreId};
use crate::{Error, RemoteError, Result};
use crc32fast::Hasher;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::sync::Arc;

/// Replication protocol version
pub const PROTOCOL_VERSION: u8 = 2;

/// Backup protocol version, advanced independently
pub const BACKUP_PROTOCOL_VERSION: u8 = 1;

/// Largest logical request accepted on the master channel (16 MiB)
pub const MASTER_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Largest logical request accepted on the backup channel (4 MiB)
pub const BACKUP_FRAME_LENGTH: usize = 4 * 1024 * 1024;

/// Default port of the master RPC server
pub const DEFAULT_MASTER_PORT: u16 = 6361;

/// Default port of the backup server
pub const DEFAULT_BACKUP_PORT: u16 = 6362;

const ITEM_FILE: u8 = 2;
const STATUS_OK: u8 = 0;
const STATUS_ERROR: u8 = 1;

const STREAM_END: u8 = 0;
const STREAM_TX: u8 = 1;
const STREAM_ABORTED: u8 = 2;

const COPY_CHUNK: usize = 64 * 1024;

/// Master operations
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    /// Allocate an id range
    AllocateIds = 1,
    /// Intern a relationship type name
    CreateRelationshipType = 2,
    /// Start a transaction
    InitializeTx = 3,
    /// Exclusive node locks
    AcquireNodeWriteLock = 4,
    /// Shared node locks
    AcquireNodeReadLock = 5,
    /// Exclusive relationship locks
    AcquireRelationshipWriteLock = 6,
    /// Shared relationship locks
    AcquireRelationshipReadLock = 7,
    /// Commit a transaction touching one data source
    CommitSingleResourceTransaction = 8,
    /// Commit or roll back
    FinishTransaction = 9,
    /// Catch up
    PullUpdates = 10,
    /// Who committed a transaction
    GetMasterIdForCommittedTx = 11,
    /// Full store copy
    CopyStore = 12,
    /// Ranged copy of committed transactions
    CopyTransactions = 13,
    /// Exclusive index entry lock
    AcquireIndexWriteLock = 14,
    /// Shared index entry lock
    AcquireIndexReadLock = 15,
}

impl RequestType {
    /// Operation name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::AllocateIds => "allocate_ids",
            Self::CreateRelationshipType => "create_relationship_type",
            Self::InitializeTx => "initialize_tx",
            Self::AcquireNodeWriteLock => "acquire_node_write_lock",
            Self::AcquireNodeReadLock => "acquire_node_read_lock",
            Self::AcquireRelationshipWriteLock => "acquire_relationship_write_lock",
            Self::AcquireRelationshipReadLock => "acquire_relationship_read_lock",
            Self::CommitSingleResourceTransaction => "commit_single_resource_transaction",
            Self::FinishTransaction => "finish_transaction",
            Self::PullUpdates => "pull_updates",
            Self::GetMasterIdForCommittedTx => "get_master_id_for_committed_tx",
            Self::CopyStore => "copy_store",
            Self::CopyTransactions => "copy_transactions",
            Self::AcquireIndexWriteLock => "acquire_index_write_lock",
            Self::AcquireIndexReadLock => "acquire_index_read_lock",
        }
    }
}

impl TryFrom<u8> for RequestType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => Self::AllocateIds,
            2 => Self::CreateRelationshipType,
            3 => Self::InitializeTx,
            4 => Self::AcquireNodeWriteLock,
            5 => Self::AcquireNodeReadLock,
            6 => Self::AcquireRelationshipWriteLock,
            7 => Self::AcquireRelationshipReadLock,
            8 => Self::CommitSingleResourceTransaction,
            9 => Self::FinishTransaction,
            10 => Self::PullUpdates,
            11 => Self::GetMasterIdForCommittedTx,
            12 => Self::CopyStore,
            13 => Self::CopyTransactions,
            14 => Self::AcquireIndexWriteLock,
            15 => Self::AcquireIndexReadLock,
            _ => return Err(Error::malformed(format!("unknown request type {}", value))),
        })
    }
}

/// Backup operations
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupRequestType {
    /// Copy the whole store
    FullBackup = 0,
    /// Transactions since a previous backup
    IncrementalBackup = 1,
}

impl BackupRequestType {
    /// Operation name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::FullBackup => "full_backup",
            Self::IncrementalBackup => "incremental_backup",
        }
    }
}

impl TryFrom<u8> for BackupRequestType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::FullBackup),
            1 => Ok(Self::IncrementalBackup),
            _ => Err(Error::malformed(format!(
                "unknown backup request type {}",
                value
            ))),
        }
    }
}

/// Arguments of `allocate_ids`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateIdsArgs {
    /// Entity kind
    pub id_type: IdType,
}

/// Arguments of requests that carry only a context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextArgs {
    /// Caller context
    pub context: SlaveContext,
}

/// Arguments of `create_relationship_type`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRelationshipTypeArgs {
    /// Caller context
    pub context: SlaveContext,
    /// Relationship type name
    pub name: String,
}

/// Arguments of node and relationship lock requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockArgs {
    /// Caller context
    pub context: SlaveContext,
    /// Entity ids to lock together
    pub ids: Vec<u64>,
}

/// Arguments of index lock requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexLockArgs {
    /// Caller context
    pub context: SlaveContext,
    /// Index name
    pub index: String,
    /// Entry key
    pub key: String,
}

/// Arguments of `commit_single_resource_transaction`; the transaction bytes
/// follow the arguments until the end of the message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitArgs {
    /// Caller context
    pub context: SlaveContext,
    /// Data source the transaction belongs to
    pub resource: String,
}

/// Arguments of `finish_transaction`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishArgs {
    /// Caller context
    pub context: SlaveContext,
    /// Commit when true, roll back otherwise
    pub success: bool,
}

/// Arguments of `get_master_id_for_committed_tx`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterIdArgs {
    /// Committed transaction id
    pub tx_id: u64,
    /// Store the caller replicates
    pub store_id: StoreId,
}

/// Arguments of `copy_transactions`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyTransactionsArgs {
    /// Caller context
    pub context: SlaveContext,
    /// Data source to copy from
    pub data_source: String,
    /// First transaction id
    pub start: u64,
    /// Last transaction id, inclusive
    pub end: u64,
}

/// Start a request: version, type and bincode arguments
pub fn write_request<B: LogBuffer + ?Sized, A: Serialize>(
    out: &mut B,
    version: u8,
    request_type: u8,
    args: &A,
) -> Result<()> {
    out.put_u8(version)?;
    out.put_u8(request_type)?;
    write_serialized(out, args)
}

/// Read version and type of a request
pub fn read_request_header<R: Read>(reader: &mut LogReader<R>) -> Result<(u8, u8)> {
    Ok((reader.get_u8()?, reader.get_u8()?))
}

/// Read length-prefixed bincode
pub fn read_serialized<R: Read, A: DeserializeOwned>(reader: &mut LogReader<R>) -> Result<A> {
    let len = reader.get_len()?;
    let bytes = reader.get_bytes(len)?;
    Ok(bincode::deserialize(&bytes)?)
}

fn write_serialized<B: LogBuffer + ?Sized, A: Serialize + ?Sized>(
    out: &mut B,
    value: &A,
) -> Result<()> {
    let bytes = bincode::serialize(value)?;
    let len = i32::try_from(bytes.len())
        .map_err(|_| Error::serialization(format!("payload too large: {}", bytes.len())))?;
    out.put_i32(len)?;
    out.put_bytes(&bytes)
}

/// Write one store file item
pub fn write_store_file<B: LogBuffer + ?Sized>(
    out: &mut B,
    name: &str,
    data: &mut dyn Read,
    len: u64,
) -> Result<u64> {
    let wire_len = i64::try_from(len)
        .map_err(|_| Error::serialization(format!("store file {} too large", name)))?;
    out.put_u8(ITEM_FILE)?;
    out.put_string(name)?;
    out.put_i64(wire_len)?;

    let mut hasher = Hasher::new();
    let mut chunk = vec![0u8; COPY_CHUNK];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(COPY_CHUNK as u64) as usize;
        let read = data.read(&mut chunk[..want])?;
        if read == 0 {
            return Err(Error::internal(format!(
                "store file {} shrank during copy",
                name
            )));
        }
        hasher.update(&chunk[..read]);
        out.put_bytes(&chunk[..read])?;
        remaining -= read as u64;
    }
    out.put_i32(hasher.finalize() as i32)?;
    Ok(len)
}

/// Sends store files as items of the response being written
pub struct NetworkStoreWriter<'a, B: LogBuffer + ?Sized> {
    out: &'a mut B,
}

impl<'a, B: LogBuffer + ?Sized> NetworkStoreWriter<'a, B> {
    /// Writer into the response message `out`
    pub fn new(out: &'a mut B) -> Self {
        Self { out }
    }
}

impl<B: LogBuffer + ?Sized> StoreWriter for NetworkStoreWriter<'_, B> {
    fn write(&mut self, path: &str, data: &mut dyn Read, len: u64) -> Result<u64> {
        write_store_file(&mut *self.out, path, data, len)
    }

    fn done(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Write the error status of a response
pub fn write_error<B: LogBuffer + ?Sized>(out: &mut B, error: &Error) -> Result<()> {
    out.put_u8(STATUS_ERROR)?;
    write_serialized(out, &error.to_remote())
}

/// Write the success status, value and streams of a response
///
/// Streams are read lazily while being written. A stream that fails midway
/// is closed with an abort marker carrying the error; the message itself
/// stays well-formed.
pub fn write_response<B: LogBuffer + ?Sized, T: Serialize>(
    out: &mut B,
    mut response: Response<T>,
) -> Result<()> {
    out.put_u8(STATUS_OK)?;
    out.put_bytes(&response.store_id().serialize())?;
    write_serialized(out, response.value())?;

    let streams = response.take_streams();
    out.put_i32(streams.len() as i32)?;
    for stream in &streams {
        out.put_string(stream.data_source_name())?;
    }
    for stream in streams {
        let name = stream.data_source_name().to_string();
        let mut aborted = false;
        for tx in stream {
            match tx {
                Ok(tx) => write_transaction(out, &tx)?,
                Err(e) => {
                    tracing::error!("Failed to stream transactions of {}: {}", name, e);
                    out.put_u8(STREAM_ABORTED)?;
                    write_serialized(out, &e.to_remote())?;
                    aborted = true;
                    break;
                }
            }
        }
        if !aborted {
            out.put_u8(STREAM_END)?;
        }
    }
    response.close();
    Ok(())
}

fn write_transaction<B: LogBuffer + ?Sized>(out: &mut B, tx: &CommittedTransaction) -> Result<()> {
    let len = i32::try_from(tx.data.len())
        .map_err(|_| Error::serialization(format!("tx {} too large", tx.tx_id)))?;
    out.put_u8(STREAM_TX)?;
    out.put_i64(tx.tx_id as i64)?;
    out.put_i32(tx.master_id)?;
    out.put_i64(tx.checksum as i64)?;
    out.put_i32(len)?;
    out.put_bytes(&tx.data)
}

/// Status, store id, value and stream names of a response
///
/// What follows on the wire are the stream bodies; see
/// [`ResponseHead::stream_from`].
pub struct ResponseHead<T> {
    store_id: StoreId,
    value: T,
    stream_names: Vec<String>,
}

/// Read a response up to its stream bodies
///
/// Store file items are handed to `store_writer`; a response carrying files
/// without a writer is malformed. An error status is returned as the error
/// it carries.
pub fn read_response_head<R: Read, T: DeserializeOwned>(
    reader: &mut LogReader<R>,
    mut store_writer: Option<&mut dyn StoreWriter>,
) -> Result<ResponseHead<T>> {
    loop {
        match reader.get_u8()? {
            ITEM_FILE => {
                let writer = store_writer
                    .as_deref_mut()
                    .ok_or_else(|| Error::malformed("store file in a response without files"))?;
                read_store_file(reader, writer)?;
            }
            STATUS_ERROR => {
                let remote: RemoteError = read_serialized(reader)?;
                return Err(remote.into());
            }
            STATUS_OK => break,
            other => return Err(Error::malformed(format!("unknown response item {}", other))),
        }
    }

    let store_id = StoreId::deserialize(&reader.get_bytes(STORE_ID_SIZE)?)?;
    let value: T = read_serialized(reader)?;
    let stream_count = reader.get_len()?;
    let mut stream_names = Vec::with_capacity(stream_count.min(16));
    for _ in 0..stream_count {
        stream_names.push(reader.get_string()?);
    }
    Ok(ResponseHead {
        store_id,
        value,
        stream_names,
    })
}

impl<T> ResponseHead<T> {
    /// Nominal value
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Turn into a response whose streams decode from `reader` on demand
    ///
    /// Streams must be consumed in order; iterating one skips whatever was
    /// left unread of the streams before it. When the response is closed or
    /// dropped, the rest of the message is skipped and `on_release` gets the
    /// source back together with whether the message was read through
    /// cleanly. A source that was not read through cleanly is at an unknown
    /// position and must not be reused.
    pub fn stream_from<R, F>(self, reader: LogReader<BlockReader<R>>, on_release: F) -> Response<T>
    where
        R: Read + Send + 'static,
        F: FnOnce(R, Result<()>) + Send + 'static,
    {
        let wire = Arc::new(Mutex::new(WireStreams {
            reader: Some(reader),
            count: self.stream_names.len(),
            current: 0,
            failed: false,
        }));
        let streams = self
            .stream_names
            .into_iter()
            .enumerate()
            .map(|(index, name)| {
                let wire = wire.clone();
                TransactionStream::new(name, std::iter::from_fn(move || wire.lock().next(index)))
            })
            .collect();
        let releaser = ResourceReleaser::new(move || {
            let finished = wire.lock().finish();
            if let Some((source, outcome)) = finished {
                on_release(source, outcome);
            }
        });
        Response::new(self.value, self.store_id, streams, releaser)
    }
}

/// Read a response from a source nobody reuses
///
/// Streams still decode lazily; the source is dropped once the response is.
pub fn read_response<R: Read + Send + 'static, T: DeserializeOwned>(
    mut reader: LogReader<BlockReader<R>>,
    store_writer: Option<&mut dyn StoreWriter>,
) -> Result<Response<T>> {
    let head = read_response_head(&mut reader, store_writer)?;
    Ok(head.stream_from(reader, |_, _| {}))
}

enum StreamItem {
    Tx(CommittedTransaction),
    End,
    Aborted(Error),
}

fn read_stream_item<R: Read>(reader: &mut LogReader<R>) -> Result<StreamItem> {
    match reader.get_u8()? {
        STREAM_TX => Ok(StreamItem::Tx(read_transaction(reader)?)),
        STREAM_END => Ok(StreamItem::End),
        STREAM_ABORTED => {
            let remote: RemoteError = read_serialized(reader)?;
            Ok(StreamItem::Aborted(remote.into()))
        }
        other => Err(Error::malformed(format!("unknown stream marker {}", other))),
    }
}

fn skip_stream<R: Read>(reader: &mut LogReader<R>) -> Result<()> {
    loop {
        match read_stream_item(reader)? {
            StreamItem::Tx(_) => {}
            StreamItem::End | StreamItem::Aborted(_) => return Ok(()),
        }
    }
}

/// Stream bodies left on the wire, shared by the streams of one response
struct WireStreams<R: Read> {
    reader: Option<LogReader<BlockReader<R>>>,
    count: usize,
    current: usize,
    failed: bool,
}

impl<R: Read> WireStreams<R> {
    fn next(&mut self, index: usize) -> Option<Result<CommittedTransaction>> {
        loop {
            if self.failed || self.current > index {
                return None;
            }
            let reader = self.reader.as_mut()?;
            if self.current < index {
                if let Err(e) = skip_stream(reader) {
                    self.failed = true;
                    return Some(Err(e));
                }
                self.current += 1;
                continue;
            }
            return match read_stream_item(reader) {
                Ok(StreamItem::Tx(tx)) => Some(Ok(tx)),
                Ok(StreamItem::End) => {
                    self.current += 1;
                    None
                }
                Ok(StreamItem::Aborted(e)) => {
                    self.current += 1;
                    Some(Err(e))
                }
                Err(e) => {
                    self.failed = true;
                    Some(Err(e))
                }
            };
        }
    }

    fn finish(&mut self) -> Option<(R, Result<()>)> {
        let mut reader = self.reader.take()?;
        let outcome = if self.failed {
            Err(Error::malformed("response stream failed midway"))
        } else {
            let mut rest = || {
                while self.current < self.count {
                    skip_stream(&mut reader)?;
                    self.current += 1;
                }
                reader.inner_mut().drain()
            };
            rest()
        };
        Some((reader.into_inner().into_inner(), outcome))
    }
}

fn read_transaction<R: Read>(reader: &mut LogReader<R>) -> Result<CommittedTransaction> {
    let tx_id = reader.get_i64()? as u64;
    let master_id = reader.get_i32()?;
    let checksum = reader.get_i64()? as u64;
    let len = reader.get_len()?;
    let data = reader.get_bytes(len)?;
    Ok(CommittedTransaction::new(tx_id, master_id, checksum, data))
}

fn read_store_file<R: Read>(
    reader: &mut LogReader<R>,
    writer: &mut dyn StoreWriter,
) -> Result<()> {
    let name = reader.get_string()?;
    let len = reader.get_i64()?;
    let len = u64::try_from(len)
        .map_err(|_| Error::malformed(format!("negative length for store file {}", name)))?;

    let mut source = CrcReader {
        inner: reader.inner_mut().take(len),
        hasher: Hasher::new(),
    };
    writer.write(&name, &mut source, len)?;
    // Whatever the writer left unread still belongs to this item.
    io::copy(&mut source, &mut io::sink()).map_err(crate::buffer::block::unwrap_io)?;
    let computed = source.hasher.finalize();

    let expected = reader.get_i32()? as u32;
    if computed != expected {
        return Err(Error::malformed(format!(
            "checksum mismatch for store file {}: expected {:08x}, got {:08x}",
            name, expected, computed
        )));
    }
    Ok(())
}

struct CrcReader<R> {
    inner: R,
    hasher: Hasher,
}

impl<R: Read> Read for CrcReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}
