//! In-process transport
//!
//! Drives a [`RequestHandler`] directly on the calling thread. Requests go
//! through exactly the same framing and dispatch as over TCP.

use crate::buffer::{BLOCK_DATA_SIZE, FULL_BLOCK_AND_MORE};
use crate::server::{RequestHandler, read_request, serve_one};
use crate::transport::{Channel, Transport};
use crate::{Error, Result};
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Transport calling a handler in the same process
pub struct LocalTransport<H: RequestHandler> {
    handler: Arc<H>,
    opened: Arc<AtomicUsize>,
}

impl<H: RequestHandler> LocalTransport<H> {
    /// Transport over `handler`
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Channels opened so far
    pub fn channels_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl<H: RequestHandler> Transport for LocalTransport<H> {
    fn open(&self) -> Result<Box<dyn Channel>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LocalChannel {
            handler: self.handler.clone(),
            request: Vec::new(),
            response: Cursor::new(Vec::new()),
            closed: false,
        }))
    }

    fn describe(&self) -> String {
        format!("local:{}", self.handler.name())
    }
}

struct LocalChannel<H: RequestHandler> {
    handler: Arc<H>,
    request: Vec<u8>,
    response: Cursor<Vec<u8>>,
    closed: bool,
}

impl<H: RequestHandler> LocalChannel<H> {
    fn dispatch(&mut self) -> Result<()> {
        let framed = std::mem::take(&mut self.request);
        let payload = read_request(framed.as_slice(), self.handler.max_request_bytes())?
            .ok_or_else(|| Error::malformed("empty request"))?;
        let mut output = Vec::new();
        let keep_open = serve_one(self.handler.as_ref(), &payload, &mut output)?;
        self.closed = !keep_open;
        self.response = Cursor::new(output);
        Ok(())
    }
}

/// True once `framed` holds a complete block message
fn is_complete(framed: &[u8]) -> bool {
    let mut pos = 0;
    while pos < framed.len() {
        let header = framed[pos];
        let len = if header == FULL_BLOCK_AND_MORE {
            BLOCK_DATA_SIZE
        } else {
            header as usize
        };
        pos += 1 + len;
        if header != FULL_BLOCK_AND_MORE {
            return pos <= framed.len();
        }
    }
    false
}

impl<H: RequestHandler> Read for LocalChannel<H> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.response.read(buf)
    }
}

impl<H: RequestHandler> Write for LocalChannel<H> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "channel closed by handler",
            ));
        }
        self.request.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if is_complete(&self.request) {
            self.dispatch().map_err(crate::buffer::block::wrap_io)?;
        }
        Ok(())
    }
}
