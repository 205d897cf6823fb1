//! Client side of the backup protocol

use crate::backup::Backup;
use crate::context::SlaveContext;
use crate::protocol::{BACKUP_PROTOCOL_VERSION, BackupRequestType, ContextArgs};
use crate::response::Response;
use crate::store_copy::StoreWriter;
use crate::transport::{
    DEFAULT_CHECKOUT_TIMEOUT, RequestClient, RequestExtras, TcpTransport, Transport,
};
use crate::Result;
use std::sync::Arc;

/// Remote [`Backup`] source
pub struct BackupClient {
    client: RequestClient,
}

impl BackupClient {
    /// Client for the backup server of machine `machine_id`
    ///
    /// Use `-1` when the serving machine is not part of a cluster.
    pub fn new(transport: Arc<dyn Transport>, machine_id: i32) -> Self {
        Self {
            client: RequestClient::new(
                transport,
                machine_id,
                BACKUP_PROTOCOL_VERSION,
                1,
                DEFAULT_CHECKOUT_TIMEOUT,
            ),
        }
    }

    /// Client over TCP
    pub fn connect(host: impl Into<String>, port: u16) -> Self {
        Self::new(Arc::new(TcpTransport::new(host, port)), -1)
    }

    /// Endpoint description
    pub fn describe(&self) -> String {
        self.client.describe()
    }
}

impl Backup for BackupClient {
    fn full_backup(&self, writer: &mut dyn StoreWriter) -> Result<Response<SlaveContext>> {
        let request_type = BackupRequestType::FullBackup;
        let response = self.client.call(
            request_type as u8,
            request_type.name(),
            None,
            &(),
            RequestExtras {
                extractor: None,
                store_writer: Some(&mut *writer),
            },
        )?;
        writer.done()?;
        Ok(response)
    }

    fn incremental_backup(&self, context: &SlaveContext) -> Result<Response<()>> {
        let request_type = BackupRequestType::IncrementalBackup;
        let args = ContextArgs {
            context: context.clone(),
        };
        self.client.call(
            request_type as u8,
            request_type.name(),
            Some(context),
            &args,
            RequestExtras::default(),
        )
    }
}
