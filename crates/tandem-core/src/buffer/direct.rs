//! File-backed log buffer
//!
//! Accumulates writes in a fixed in-memory buffer and flushes it to the file
//! at an explicitly tracked absolute position, independent of the file's own
//! cursor.

use crate::Result;
use crate::buffer::LogBuffer;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

/// Size of the in-memory buffer (512 KiB)
pub const DIRECT_BUFFER_SIZE: usize = 512 * 1024;

/// Log buffer writing to a file through a fixed 512 KiB buffer
pub struct DirectMappedLogBuffer {
    file: File,
    buffer: Vec<u8>,
    buffer_start_position: u64,
}

impl DirectMappedLogBuffer {
    /// Start buffering at the file's current position
    pub fn new(mut file: File) -> Result<Self> {
        let buffer_start_position = file.stream_position()?;
        Ok(Self {
            file,
            buffer: Vec::with_capacity(DIRECT_BUFFER_SIZE),
            buffer_start_position,
        })
    }

    fn ensure_capacity(&mut self, plus_size: usize) -> Result<()> {
        if DIRECT_BUFFER_SIZE - self.buffer.len() < plus_size {
            self.write_out()?;
        }
        Ok(())
    }

    /// Logical end of the log: flushed bytes plus buffered bytes
    pub fn file_channel_position(&self) -> u64 {
        self.buffer_start_position + self.buffer.len() as u64
    }

    /// Bytes currently held in memory
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// The underlying file
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Flush and give back the file
    pub fn into_file(mut self) -> Result<File> {
        self.write_out()?;
        Ok(self.file)
    }
}

impl LogBuffer for DirectMappedLogBuffer {
    fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        for chunk in bytes.chunks(DIRECT_BUFFER_SIZE) {
            self.ensure_capacity(chunk.len())?;
            self.buffer.extend_from_slice(chunk);
        }
        Ok(())
    }

    fn put_atom(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_capacity(bytes.len())?;
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    fn write_out(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(self.buffer_start_position))?;
        self.file.write_all(&self.buffer)?;
        self.buffer_start_position += self.buffer.len() as u64;
        self.buffer.clear();
        Ok(())
    }

    fn force(&mut self) -> Result<()> {
        self.write_out()?;
        self.file.sync_data()?;
        Ok(())
    }
}
