//! Connections to a remote request handler
//!
//! A [`Transport`] opens [`Channel`]s; a channel carries one request message
//! followed by its response message at a time. Clients check channels out of
//! a [`ChannelPool`] only for the duration of one exchange.

pub mod client;
pub mod local;
pub mod pool;
pub mod tcp;

pub use client::{DEFAULT_CHECKOUT_TIMEOUT, DEFAULT_MAX_CHANNELS, RequestClient, RequestExtras};
pub use local::LocalTransport;
pub use pool::{ChannelPool, PooledChannel};
pub use tcp::TcpTransport;

use crate::Result;
use std::io::{Read, Write};

/// A bidirectional byte channel
pub trait Channel: Read + Write + Send {}

impl<T: Read + Write + Send> Channel for T {}

/// Opens channels to one remote endpoint
pub trait Transport: Send + Sync {
    /// Open a new channel
    fn open(&self) -> Result<Box<dyn Channel>>;

    /// Endpoint description for logs
    fn describe(&self) -> String;
}
