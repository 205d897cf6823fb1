//! Log framing layer
//!
//! A typed, append-only binary writer used for everything that ships
//! write-ahead log bytes, either to a file or over a network channel.
//!
//! Two strategies implement [`LogBuffer`]:
//!
//! - [`DirectMappedLogBuffer`]: 512 KiB in-memory buffer over a file, flushed
//!   at a tracked absolute offset, `force()` additionally syncs.
//! - [`BlockLogBuffer`]: 256-byte frames (1 header byte + 255 payload bytes)
//!   for network channels, closed by [`BlockLogBuffer::done`].
//!
//! The two never share state and are never mixed within one logical stream.
//! All primitives are written big-endian.

pub mod block;
pub mod direct;

pub use block::{
    BLOCK_DATA_SIZE, BLOCK_SIZE, BlockLogBuffer, BlockReader, FULL_BLOCK_AND_MORE,
};
pub use direct::{DIRECT_BUFFER_SIZE, DirectMappedLogBuffer};

use crate::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt};
use std::io::Read;

const COPY_CHUNK: usize = 8 * 1024;

/// Append-only typed writer over a file or network channel
pub trait LogBuffer {
    /// Append raw bytes; may be split at any boundary
    fn put_bytes(&mut self, bytes: &[u8]) -> Result<()>;

    /// Append a fixed-width primitive encoding
    ///
    /// File-backed buffers keep an atom contiguous within one flush; block
    /// framing is free to let it straddle two frames.
    fn put_atom(&mut self, bytes: &[u8]) -> Result<()> {
        self.put_bytes(bytes)
    }

    /// Make sure buffered data reaches the underlying target
    fn write_out(&mut self) -> Result<()>;

    /// Write out and force the target to durable storage
    fn force(&mut self) -> Result<()>;

    /// Append a byte
    fn put_u8(&mut self, value: u8) -> Result<()> {
        self.put_atom(&[value])
    }

    /// Append a short
    fn put_i16(&mut self, value: i16) -> Result<()> {
        self.put_atom(&value.to_be_bytes())
    }

    /// Append an int
    fn put_i32(&mut self, value: i32) -> Result<()> {
        self.put_atom(&value.to_be_bytes())
    }

    /// Append a long
    fn put_i64(&mut self, value: i64) -> Result<()> {
        self.put_atom(&value.to_be_bytes())
    }

    /// Append a float
    fn put_f32(&mut self, value: f32) -> Result<()> {
        self.put_atom(&value.to_be_bytes())
    }

    /// Append a double
    fn put_f64(&mut self, value: f64) -> Result<()> {
        self.put_atom(&value.to_be_bytes())
    }

    /// Append a char sequence as UTF-16 code units (2 bytes each)
    fn put_chars(&mut self, value: &str) -> Result<()> {
        for unit in value.encode_utf16() {
            self.put_atom(&unit.to_be_bytes())?;
        }
        Ok(())
    }

    /// Append a length-prefixed string: unit count as int, then the units
    fn put_string(&mut self, value: &str) -> Result<()> {
        let units = value.encode_utf16().count();
        let units = i32::try_from(units)
            .map_err(|_| Error::serialization(format!("string too long: {} units", units)))?;
        self.put_i32(units)?;
        self.put_chars(value)
    }
}

impl LogBuffer for Vec<u8> {
    fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }

    fn write_out(&mut self) -> Result<()> {
        Ok(())
    }

    fn force(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<B: LogBuffer + ?Sized> LogBuffer for &mut B {
    fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).put_bytes(bytes)
    }

    fn put_atom(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).put_atom(bytes)
    }

    fn write_out(&mut self) -> Result<()> {
        (**self).write_out()
    }

    fn force(&mut self) -> Result<()> {
        (**self).force()
    }
}

/// Reads back what a [`LogBuffer`] wrote
pub struct LogReader<R> {
    inner: R,
}

impl<R: Read> LogReader<R> {
    /// Wrap a byte source
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read a byte
    pub fn get_u8(&mut self) -> Result<u8> {
        self.inner.read_u8().map_err(block::unwrap_io)
    }

    /// Read a short
    pub fn get_i16(&mut self) -> Result<i16> {
        self.inner.read_i16::<BigEndian>().map_err(block::unwrap_io)
    }

    /// Read an int
    pub fn get_i32(&mut self) -> Result<i32> {
        self.inner.read_i32::<BigEndian>().map_err(block::unwrap_io)
    }

    /// Read a long
    pub fn get_i64(&mut self) -> Result<i64> {
        self.inner.read_i64::<BigEndian>().map_err(block::unwrap_io)
    }

    /// Read a float
    pub fn get_f32(&mut self) -> Result<f32> {
        self.inner.read_f32::<BigEndian>().map_err(block::unwrap_io)
    }

    /// Read a double
    pub fn get_f64(&mut self) -> Result<f64> {
        self.inner.read_f64::<BigEndian>().map_err(block::unwrap_io)
    }

    /// Read a non-negative int used as a length
    pub fn get_len(&mut self) -> Result<usize> {
        let len = self.get_i32()?;
        usize::try_from(len).map_err(|_| Error::malformed(format!("negative length {}", len)))
    }

    /// Read exactly `len` bytes
    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; len];
        self.inner.read_exact(&mut bytes).map_err(block::unwrap_io)?;
        Ok(bytes)
    }

    /// Read `units` UTF-16 code units
    pub fn get_chars(&mut self, units: usize) -> Result<String> {
        let mut chars = Vec::with_capacity(units);
        for _ in 0..units {
            chars.push(self.inner.read_u16::<BigEndian>().map_err(block::unwrap_io)?);
        }
        String::from_utf16(&chars).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Read a string written by [`LogBuffer::put_string`]
    pub fn get_string(&mut self) -> Result<String> {
        let units = self.get_len()?;
        self.get_chars(units)
    }

    /// Read everything that is left
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut rest = Vec::new();
        self.inner
            .read_to_end(&mut rest)
            .map_err(block::unwrap_io)?;
        Ok(rest)
    }

    /// Copy everything that is left into `out`, one chunk at a time
    pub fn copy_to<B: LogBuffer + ?Sized>(&mut self, out: &mut B) -> Result<u64> {
        let mut chunk = [0u8; COPY_CHUNK];
        let mut copied = 0u64;
        loop {
            let read = match self.inner.read(&mut chunk) {
                Ok(0) => return Ok(copied),
                Ok(read) => read,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(block::unwrap_io(e)),
            };
            out.put_bytes(&chunk[..read])?;
            copied += read as u64;
        }
    }

    /// Access the wrapped source
    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Unwrap the source
    pub fn into_inner(self) -> R {
        self.inner
    }
}
