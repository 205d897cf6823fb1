//! Request/response exchanges over pooled channels

use crate::buffer::{BlockLogBuffer, BlockReader, LogReader};
use crate::context::SlaveContext;
use crate::master::TxExtractor;
use crate::protocol::{read_response_head, write_request};
use crate::response::{Response, TransactionStream};
use crate::store_copy::StoreWriter;
use crate::transport::{ChannelPool, Transport};
use crate::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Default number of channels a client keeps to one server
pub const DEFAULT_MAX_CHANNELS: usize = 20;

/// Default wait for a free channel
pub const DEFAULT_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(20);

/// Parts of a request beyond its arguments
#[derive(Default)]
pub struct RequestExtras<'a> {
    /// Writes transaction bytes after the arguments
    pub extractor: Option<&'a mut dyn TxExtractor>,
    /// Receives store files carried by the response
    pub store_writer: Option<&'a mut dyn StoreWriter>,
}

/// Client for one protocol on one remote machine
///
/// Each call checks a channel out of a pool and writes one request message.
/// The response hands its transaction streams out still on the wire; the
/// channel goes back to the pool once the response is closed or dropped.
/// Transport failures surface as [`Error::Communication`] naming the
/// operation, the remote machine id and the caller's context.
pub struct RequestClient {
    pool: ChannelPool,
    machine_id: i32,
    protocol_version: u8,
}

impl RequestClient {
    /// Client speaking `protocol_version` to machine `machine_id`
    pub fn new(
        transport: Arc<dyn Transport>,
        machine_id: i32,
        protocol_version: u8,
        max_channels: usize,
        checkout_timeout: Duration,
    ) -> Self {
        Self {
            pool: ChannelPool::new(transport, max_channels, checkout_timeout),
            machine_id,
            protocol_version,
        }
    }

    /// Remote machine id
    pub fn machine_id(&self) -> i32 {
        self.machine_id
    }

    /// Endpoint description
    pub fn describe(&self) -> String {
        self.pool.describe()
    }

    /// Close pooled channels that are not in use
    pub fn close_idle(&self) {
        self.pool.close_idle();
    }

    /// Send one request and read its response
    pub fn call<A: Serialize, T: DeserializeOwned>(
        &self,
        request_type: u8,
        operation: &str,
        context: Option<&SlaveContext>,
        args: &A,
        extras: RequestExtras<'_>,
    ) -> Result<Response<T>> {
        let describe = || match context {
            Some(context) => context.to_string(),
            None => "no context".to_string(),
        };
        let to_communication = |e: Error| match e {
            Error::Io(source) => Error::communication(operation, self.machine_id, describe(), source),
            other => other,
        };

        let mut channel = self.pool.acquire().map_err(to_communication)?;
        let RequestExtras {
            extractor,
            store_writer,
        } = extras;

        let sent = (|| {
            let mut out = BlockLogBuffer::new(&mut *channel);
            write_request(&mut out, self.protocol_version, request_type, args)?;
            if let Some(extractor) = extractor {
                extractor.extract(&mut out)?;
            }
            out.done()
        })();
        if let Err(e) = sent {
            channel.mark_broken();
            return Err(to_communication(e));
        }

        let mut reader = LogReader::new(BlockReader::new(channel));
        let head = read_response_head(&mut reader, store_writer);
        match head {
            Ok(head) => {
                let machine_id = self.machine_id;
                let released = operation.to_string();
                let response = head.stream_from(reader, move |mut channel, outcome| {
                    if let Err(e) = outcome {
                        channel.mark_broken();
                        tracing::debug!(
                            "Discarding channel to machine {} after streaming {} failed: {}",
                            machine_id,
                            released,
                            e
                        );
                    }
                });
                Ok(self.attribute_stream_errors(response, operation, describe()))
            }
            Err(e) => {
                // Read whatever the response still holds so the channel can be reused.
                let drained = reader.inner_mut().drain();
                let mut channel = reader.into_inner().into_inner();
                match drained {
                    Ok(()) => Err(to_communication(e)),
                    Err(drain_error) => {
                        channel.mark_broken();
                        tracing::debug!(
                            "Discarding channel to machine {} after {} failed: {}",
                            self.machine_id,
                            operation,
                            e
                        );
                        // A response cut short means the connection failed, whatever the framing saw.
                        let source = match drain_error {
                            Error::Io(source) => source,
                            other => io::Error::new(io::ErrorKind::ConnectionAborted, other.to_string()),
                        };
                        Err(Error::communication(
                            operation,
                            self.machine_id,
                            describe(),
                            source,
                        ))
                    }
                }
            }
        }
    }

    /// Report transport failures met while streaming as communication errors
    fn attribute_stream_errors<T>(
        &self,
        mut response: Response<T>,
        operation: &str,
        context: String,
    ) -> Response<T> {
        let streams = response
            .take_streams()
            .into_iter()
            .map(|stream| {
                let name = stream.data_source_name().to_string();
                let operation = operation.to_string();
                let context = context.clone();
                let machine_id = self.machine_id;
                TransactionStream::new(
                    name,
                    stream.map(move |tx| {
                        tx.map_err(|e| match e {
                            Error::Io(source) => Error::communication(
                                &operation,
                                machine_id,
                                context.clone(),
                                source,
                            ),
                            other => other,
                        })
                    }),
                )
            })
            .collect();
        response.with_streams(streams)
    }
}
