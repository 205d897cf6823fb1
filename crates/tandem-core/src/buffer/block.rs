//! Block-chunked network framing
//!
//! A logical message is cut into 256-byte blocks:
//!
//! ```text
//! [header:1][payload:255]   header == 0   full block, more follow
//! [header:1][payload:N]     header == N   final block, N in 1..=255
//! ```
//!
//! The writer stages up to one block plus the widest primitive (8 bytes) so a
//! put never has to be split by the caller; whatever spills past the block
//! boundary is carried into the next block.

use crate::buffer::LogBuffer;
use crate::{Error, Result};
use std::io::{self, Read, Write};

/// Frame size including the header byte
pub const BLOCK_SIZE: usize = 256;

/// Payload bytes per frame
pub const BLOCK_DATA_SIZE: usize = BLOCK_SIZE - 1;

/// Header value of a full frame that is followed by more frames
pub const FULL_BLOCK_AND_MORE: u8 = 0;

const LARGEST_ATOM: usize = 8;
const STAGING_SIZE: usize = BLOCK_SIZE + LARGEST_ATOM;

/// Writes a logical message as a sequence of 256-byte blocks
pub struct BlockLogBuffer<W: Write> {
    target: W,
    staging: [u8; STAGING_SIZE],
    position: usize,
    blocks_written: u64,
}

impl<W: Write> BlockLogBuffer<W> {
    /// Create a writer for `target`
    pub fn new(target: W) -> Self {
        let mut staging = [0u8; STAGING_SIZE];
        staging[0] = FULL_BLOCK_AND_MORE;
        Self {
            target,
            staging,
            position: 1,
            blocks_written: 0,
        }
    }

    fn clear_staging(&mut self) {
        // Reserve the header assuming the block will be filled
        self.staging[0] = FULL_BLOCK_AND_MORE;
        self.position = 1;
    }

    fn check_flush(&mut self) -> Result<()> {
        // A block that is exactly full is held back so that done() can still
        // turn it into the final block.
        if self.position > BLOCK_SIZE {
            self.target.write_all(&self.staging[..BLOCK_SIZE])?;
            self.blocks_written += 1;
            let spilled = self.position - BLOCK_SIZE;
            self.staging.copy_within(BLOCK_SIZE..self.position, 1);
            self.staging[0] = FULL_BLOCK_AND_MORE;
            self.position = 1 + spilled;
        }
        Ok(())
    }

    /// Close the logical message: patch the header with the final block's
    /// payload length and write it
    pub fn done(&mut self) -> Result<()> {
        if self.position <= 1 {
            return Err(Error::internal(
                "a block message must carry at least one payload byte",
            ));
        }
        debug_assert!(self.position <= BLOCK_SIZE, "staging area over full");
        self.staging[0] = (self.position - 1) as u8;
        self.target.write_all(&self.staging[..self.position])?;
        self.target.flush()?;
        self.blocks_written += 1;
        self.clear_staging();
        Ok(())
    }

    /// Copy everything `data` yields into the message, returning the byte count
    pub fn write_from<R: Read + ?Sized>(&mut self, data: &mut R) -> Result<u64> {
        let mut total = 0u64;
        loop {
            let read = data.read(&mut self.staging[self.position..])?;
            if read == 0 {
                break;
            }
            self.position += read;
            total += read as u64;
            self.check_flush()?;
        }
        Ok(total)
    }

    /// Number of frames handed to the target so far
    pub fn blocks_written(&self) -> u64 {
        self.blocks_written
    }

    /// Access the target
    pub fn target_mut(&mut self) -> &mut W {
        &mut self.target
    }

    /// Give back the target; anything not closed by `done()` is discarded
    pub fn into_inner(self) -> W {
        self.target
    }
}

impl<W: Write> LogBuffer for BlockLogBuffer<W> {
    fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < bytes.len() {
            let room = STAGING_SIZE - self.position;
            let to_write = room.min(bytes.len() - offset);
            self.staging[self.position..self.position + to_write]
                .copy_from_slice(&bytes[offset..offset + to_write]);
            self.position += to_write;
            offset += to_write;
            self.check_flush()?;
        }
        Ok(())
    }

    fn put_atom(&mut self, bytes: &[u8]) -> Result<()> {
        debug_assert!(bytes.len() <= LARGEST_ATOM);
        self.staging[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
        self.check_flush()
    }

    fn write_out(&mut self) -> Result<()> {
        Ok(())
    }

    fn force(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Reads one logical block-framed message as a plain byte stream
///
/// Yields EOF after the final block. A stream that ends mid-message or
/// carries an impossible header is malformed and the connection must be
/// abandoned.
pub struct BlockReader<R: Read> {
    source: R,
    block: [u8; BLOCK_DATA_SIZE],
    len: usize,
    pos: usize,
    last: bool,
    total: usize,
    max_message_len: usize,
}

impl<R: Read> BlockReader<R> {
    /// Read a message of unbounded length
    pub fn new(source: R) -> Self {
        Self::with_limit(source, usize::MAX)
    }

    /// Read a message, failing once it exceeds `max_message_len` payload bytes
    pub fn with_limit(source: R, max_message_len: usize) -> Self {
        Self {
            source,
            block: [0u8; BLOCK_DATA_SIZE],
            len: 0,
            pos: 0,
            last: false,
            total: 0,
            max_message_len,
        }
    }

    /// Wait for the first header of a message
    ///
    /// Returns `Ok(false)` when the peer closed the connection cleanly between
    /// messages.
    pub fn begin(&mut self) -> Result<bool> {
        let mut header = [0u8; 1];
        loop {
            match self.source.read(&mut header) {
                Ok(0) => return Ok(false),
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.load_block(header[0])?;
        Ok(true)
    }

    fn next_block(&mut self) -> Result<()> {
        let mut header = [0u8; 1];
        self.source.read_exact(&mut header).map_err(truncated)?;
        self.load_block(header[0])
    }

    fn load_block(&mut self, header: u8) -> Result<()> {
        let len = if header == FULL_BLOCK_AND_MORE {
            BLOCK_DATA_SIZE
        } else {
            header as usize
        };
        self.source
            .read_exact(&mut self.block[..len])
            .map_err(truncated)?;
        self.len = len;
        self.pos = 0;
        self.last = header != FULL_BLOCK_AND_MORE;
        self.total += len;
        if self.total > self.max_message_len {
            return Err(Error::FrameTooLarge {
                max: self.max_message_len,
                got: self.total,
            });
        }
        Ok(())
    }

    /// True once the final block has been consumed
    pub fn is_finished(&self) -> bool {
        self.last && self.pos == self.len
    }

    /// Payload bytes received so far
    pub fn bytes_read(&self) -> usize {
        self.total
    }

    /// Skip the rest of the message
    pub fn drain(&mut self) -> Result<()> {
        io::copy(self, &mut io::sink()).map_err(unwrap_io)?;
        Ok(())
    }

    /// Give back the source
    pub fn into_inner(self) -> R {
        self.source
    }
}

impl<R: Read> Read for BlockReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos == self.len {
            if self.last {
                return Ok(0);
            }
            let loaded = if self.total == 0 {
                match self.begin() {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(Error::malformed("connection closed before message")),
                    Err(e) => Err(e),
                }
            } else {
                self.next_block()
            };
            loaded.map_err(wrap_io)?;
        }
        let n = buf.len().min(self.len - self.pos);
        buf[..n].copy_from_slice(&self.block[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn truncated(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::malformed("stream ended before the final block")
    } else {
        Error::Io(e)
    }
}

/// Carry a crate error through an `io::Error`
pub(crate) fn wrap_io(error: Error) -> io::Error {
    match error {
        Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// Recover a crate error carried through an `io::Error`
pub(crate) fn unwrap_io(error: io::Error) -> Error {
    if error.get_ref().is_some_and(|inner| inner.is::<Error>()) {
        if let Some(inner) = error.into_inner() {
            if let Ok(err) = inner.downcast::<Error>() {
                return *err;
            }
        }
        return Error::internal("lost wrapped framing error");
    }
    if error.kind() == io::ErrorKind::UnexpectedEof {
        return Error::malformed("message ended early");
    }
    Error::Io(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::LogReader;
    use proptest::prelude::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buffer = BlockLogBuffer::new(&mut out);
        buffer.put_bytes(payload).unwrap();
        buffer.done().unwrap();
        out
    }

    fn deframe(wire: &[u8]) -> Vec<u8> {
        let mut reader = BlockReader::new(wire);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    /// Walk the frames of one message, returning every header byte
    fn headers(wire: &[u8]) -> Vec<u8> {
        let mut headers = Vec::new();
        let mut pos = 0;
        loop {
            let header = wire[pos];
            headers.push(header);
            if header == FULL_BLOCK_AND_MORE {
                pos += BLOCK_SIZE;
            } else {
                pos += 1 + header as usize;
                assert_eq!(pos, wire.len(), "final block must end the message");
                return headers;
            }
        }
    }

    #[test]
    fn test_single_block_message() {
        let wire = frame(b"hello");
        assert_eq!(wire[0], 5);
        assert_eq!(&wire[1..], b"hello");
        assert_eq!(deframe(&wire), b"hello");
    }

    #[test]
    fn test_exactly_one_full_block_stays_final() {
        let payload = vec![3u8; BLOCK_DATA_SIZE];
        let wire = frame(&payload);
        assert_eq!(headers(&wire), vec![255]);
        assert_eq!(deframe(&wire), payload);
    }

    #[test]
    fn test_boundary_lengths() {
        for len in [
            1,
            BLOCK_DATA_SIZE - 1,
            BLOCK_DATA_SIZE,
            BLOCK_DATA_SIZE + 1,
            BLOCK_DATA_SIZE * 2,
            BLOCK_DATA_SIZE * 2 + 1,
            BLOCK_DATA_SIZE * 3 - 1,
        ] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let wire = frame(&payload);
            let hs = headers(&wire);
            let last = *hs.last().unwrap();
            assert!((1..=255).contains(&last), "len {} header {}", len, last);
            assert!(hs[..hs.len() - 1].iter().all(|h| *h == FULL_BLOCK_AND_MORE));
            assert_eq!(deframe(&wire), payload, "len {}", len);
        }
    }

    #[test]
    fn test_long_straddles_block_boundary() {
        let mut out = Vec::new();
        let mut buffer = BlockLogBuffer::new(&mut out);
        // 251 bytes leave 4 in the first block; the next long straddles it.
        buffer.put_bytes(&[9u8; 251]).unwrap();
        buffer.put_i64(0x0102_0304_0506_0708).unwrap();
        buffer.put_i32(-1).unwrap();
        buffer.done().unwrap();
        assert_eq!(buffer.blocks_written(), 2);

        assert_eq!(headers(&out), vec![0, 8]);
        let mut reader = LogReader::new(BlockReader::new(out.as_slice()));
        assert_eq!(reader.get_bytes(251).unwrap(), vec![9u8; 251]);
        assert_eq!(reader.get_i64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(reader.get_i32().unwrap(), -1);
        assert!(reader.read_to_end().unwrap().is_empty());
    }

    #[test]
    fn test_consecutive_messages_on_one_stream() {
        let mut out = Vec::new();
        let mut buffer = BlockLogBuffer::new(&mut out);
        buffer.put_i32(1).unwrap();
        buffer.done().unwrap();
        buffer.put_bytes(&[7u8; 600]).unwrap();
        buffer.done().unwrap();

        let mut source = out.as_slice();
        let mut first = BlockReader::new(&mut source);
        let mut bytes = Vec::new();
        first.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, 1i32.to_be_bytes());

        let mut second = BlockReader::new(&mut source);
        bytes.clear();
        second.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, vec![7u8; 600]);
        assert!(source.is_empty());
    }

    #[test]
    fn test_empty_message_is_rejected() {
        let mut out = Vec::new();
        let mut buffer = BlockLogBuffer::new(&mut out);
        assert!(buffer.done().is_err());
    }

    #[test]
    fn test_write_from_reader() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        let mut out = Vec::new();
        let mut buffer = BlockLogBuffer::new(&mut out);
        assert_eq!(buffer.write_from(&mut data.as_slice()).unwrap(), 1000);
        buffer.done().unwrap();
        assert_eq!(deframe(&out), data);
    }

    #[test]
    fn test_truncated_stream_is_malformed() {
        let wire = frame(&[1u8; 700]);
        let cut = &wire[..300];
        let mut reader = LogReader::new(BlockReader::new(cut));
        let result = reader.read_to_end();
        assert!(matches!(result, Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn test_message_limit_enforced() {
        let wire = frame(&[1u8; 1000]);
        let mut reader = LogReader::new(BlockReader::with_limit(wire.as_slice(), 512));
        let result = reader.read_to_end();
        assert!(matches!(result, Err(Error::FrameTooLarge { max: 512, .. })));
    }

    #[test]
    fn test_begin_reports_clean_close() {
        let empty: &[u8] = &[];
        let mut reader = BlockReader::new(empty);
        assert!(!reader.begin().unwrap());
    }

    #[derive(Debug, Clone)]
    enum Put {
        Byte(u8),
        Short(i16),
        Int(i32),
        Long(i64),
        Double(f64),
        Bytes(Vec<u8>),
    }

    fn put_strategy() -> impl Strategy<Value = Put> {
        prop_oneof![
            any::<u8>().prop_map(Put::Byte),
            any::<i16>().prop_map(Put::Short),
            any::<i32>().prop_map(Put::Int),
            any::<i64>().prop_map(Put::Long),
            any::<u64>().prop_map(|bits| Put::Double(f64::from_bits(bits))),
            prop::collection::vec(any::<u8>(), 0..700).prop_map(Put::Bytes),
        ]
    }

    proptest! {
        #[test]
        fn prop_framing_round_trip(puts in prop::collection::vec(put_strategy(), 1..40)) {
            let mut expected = Vec::new();
            let mut wire = Vec::new();
            let mut buffer = BlockLogBuffer::new(&mut wire);
            for put in &puts {
                match put {
                    Put::Byte(v) => { buffer.put_u8(*v).unwrap(); expected.put_u8(*v).unwrap(); }
                    Put::Short(v) => { buffer.put_i16(*v).unwrap(); expected.put_i16(*v).unwrap(); }
                    Put::Int(v) => { buffer.put_i32(*v).unwrap(); expected.put_i32(*v).unwrap(); }
                    Put::Long(v) => { buffer.put_i64(*v).unwrap(); expected.put_i64(*v).unwrap(); }
                    Put::Double(v) => { buffer.put_f64(*v).unwrap(); expected.put_f64(*v).unwrap(); }
                    Put::Bytes(v) => { buffer.put_bytes(v).unwrap(); expected.put_bytes(v).unwrap(); }
                }
            }
            prop_assume!(!expected.is_empty());
            buffer.done().unwrap();

            let hs = headers(&wire);
            let last = *hs.last().unwrap();
            prop_assert!(last >= 1);
            prop_assert_eq!(deframe(&wire), expected);
        }
    }
}
