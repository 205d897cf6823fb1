//! Streaming a store to a writer
//!
//! Used by full store copy on the master and full backup. Logs are rotated
//! first so every closed segment can be shipped as an immutable file; what is
//! committed while the copy runs reaches the receiver as transaction streams.

use crate::buffer::block::unwrap_io;
use crate::context::{LastAppliedTx, SlaveContext};
use crate::database::Database;
use crate::response::TransactionStream;
use crate::{Error, Result};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};

/// Sink receiving store files
pub trait StoreWriter {
    /// Write `len` bytes read from `data` as the file `path`
    ///
    /// Returns the number of bytes written.
    fn write(&mut self, path: &str, data: &mut dyn Read, len: u64) -> Result<u64>;

    /// Called once after the last file
    fn done(&mut self) -> Result<()>;
}

/// Writes received store files into a directory
pub struct ToFileStoreWriter {
    base: PathBuf,
    files_written: usize,
    bytes_written: u64,
}

impl ToFileStoreWriter {
    /// Writer into `base`, created if missing
    pub fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        std::fs::create_dir_all(&base)?;
        Ok(Self {
            base,
            files_written: 0,
            bytes_written: 0,
        })
    }

    /// Files written so far
    pub fn files_written(&self) -> usize {
        self.files_written
    }

    /// Bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn target(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::malformed(format!("refusing store file path '{}'", path)));
        }
        Ok(self.base.join(relative))
    }
}

impl StoreWriter for ToFileStoreWriter {
    fn write(&mut self, path: &str, data: &mut dyn Read, len: u64) -> Result<u64> {
        let target = self.target(path)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(File::create(&target)?);
        let written = std::io::copy(&mut data.take(len), &mut out).map_err(unwrap_io)?;
        if written != len {
            return Err(Error::malformed(format!(
                "store file {} ended after {} of {} bytes",
                path, written, len
            )));
        }
        out.flush()?;
        out.into_inner()
            .map_err(|e| Error::Io(e.into_error()))?
            .sync_all()?;
        self.files_written += 1;
        self.bytes_written += written;
        tracing::debug!("Received store file {} ({} bytes)", path, written);
        Ok(written)
    }

    fn done(&mut self) -> Result<()> {
        tracing::info!(
            "Store copy into {} complete: {} files, {} bytes",
            self.base.display(),
            self.files_written,
            self.bytes_written
        );
        Ok(())
    }
}

/// Rotate every log, then hand each closed store file to `writer`
///
/// Returns the anonymous context describing what the copied files contain.
/// `writer.done()` is left to the caller.
pub fn rotate_logs_and_stream_store_files(
    database: &Database,
    writer: &mut dyn StoreWriter,
) -> Result<SlaveContext> {
    let snapshot: Vec<LastAppliedTx> = database.rotate_logs()?;
    for file in database.store_files()? {
        let mut source = File::open(&file.path)?;
        let written = writer.write(&file.name, &mut source, file.len)?;
        if written != file.len {
            return Err(Error::internal(format!(
                "store file {} changed during copy",
                file.name
            )));
        }
    }
    Ok(SlaveContext::anonymous(snapshot))
}

/// Streams of every transaction committed after what `context` has applied
///
/// A data source missing from the context counts as nothing applied. Data
/// sources with nothing new are left out.
pub fn transactions_after(
    database: &Database,
    context: &SlaveContext,
) -> Result<Vec<TransactionStream>> {
    let mut streams = Vec::new();
    for ds in database.data_sources() {
        let last = ds.last_committed_tx();
        let applied = context.last_applied(ds.name()).unwrap_or(0);
        if applied >= last {
            continue;
        }
        let txs = ds.log().extract(applied + 1, last)?;
        streams.push(TransactionStream::from_log(ds.name(), txs));
    }
    Ok(streams)
}
