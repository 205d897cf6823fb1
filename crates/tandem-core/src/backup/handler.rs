//! Server side of the backup protocol

use crate::backup::Backup;
use crate::buffer::{LogBuffer, LogReader};
use crate::protocol::{
    BACKUP_FRAME_LENGTH, BACKUP_PROTOCOL_VERSION, BackupRequestType, ContextArgs,
    NetworkStoreWriter, read_serialized, write_response,
};
use crate::server::RequestHandler;
use crate::Result;
use std::io::Read;
use std::sync::Arc;

/// Decodes backup requests and dispatches them to a [`Backup`]
pub struct BackupServer {
    backup: Arc<dyn Backup>,
}

impl BackupServer {
    /// Handler over `backup`
    pub fn new(backup: Arc<dyn Backup>) -> Self {
        Self { backup }
    }
}

impl RequestHandler for BackupServer {
    fn name(&self) -> &str {
        "backup"
    }

    fn protocol_version(&self) -> u8 {
        BACKUP_PROTOCOL_VERSION
    }

    fn max_request_bytes(&self) -> usize {
        BACKUP_FRAME_LENGTH
    }

    fn handle(
        &self,
        request_type: u8,
        request: &mut LogReader<&mut dyn Read>,
        out: &mut dyn LogBuffer,
    ) -> Result<()> {
        let request_type = BackupRequestType::try_from(request_type)?;
        tracing::debug!("Serving {}", request_type.name());

        match request_type {
            BackupRequestType::FullBackup => {
                let () = read_serialized(request)?;
                let response = {
                    let mut writer = NetworkStoreWriter::new(&mut *out);
                    self.backup.full_backup(&mut writer)?
                };
                write_response(out, response)
            }
            BackupRequestType::IncrementalBackup => {
                let args: ContextArgs = read_serialized(request)?;
                write_response(out, self.backup.incremental_backup(&args.context)?)
            }
        }
    }
}
