//! Server side of the master protocol

use crate::buffer::{LogBuffer, LogReader};
use crate::context::SlaveContext;
use crate::database::DEFAULT_DATA_SOURCE_NAME;
use crate::master::{Master, MasterImpl, TxExtractor};
use crate::protocol::{
    AllocateIdsArgs, CommitArgs, ContextArgs, CopyTransactionsArgs, CreateRelationshipTypeArgs,
    FinishArgs, IndexLockArgs, LockArgs, MASTER_FRAME_LENGTH, MasterIdArgs, NetworkStoreWriter,
    PROTOCOL_VERSION, RequestType, read_serialized, write_response,
};
use crate::server::RequestHandler;
use crate::verifier::{BranchDetectingTxVerifier, TxChecksumVerifier};
use crate::Result;
use std::io::Read;
use std::sync::Arc;

/// Decodes master requests and dispatches them to a [`MasterImpl`]
///
/// Before serving a context-bearing request, the `(master_id, checksum)` the
/// caller reports for its last applied main-store transaction is checked
/// against this master's log. A caller whose history forked is refused with
/// a branch error rather than being fed transactions it cannot apply.
pub struct MasterServer {
    master: Arc<MasterImpl>,
    verifier: BranchDetectingTxVerifier,
}

impl MasterServer {
    /// Handler over `master`
    pub fn new(master: Arc<MasterImpl>) -> Self {
        let verifier = BranchDetectingTxVerifier::new(master.database().main_data_source().clone());
        Self { master, verifier }
    }

    /// The served master
    pub fn master(&self) -> &Arc<MasterImpl> {
        &self.master
    }

    fn verify(&self, context: &SlaveContext) -> Result<()> {
        if context.is_anonymous() {
            return Ok(());
        }
        match context.last_applied(DEFAULT_DATA_SOURCE_NAME) {
            Some(tx_id) if tx_id > 0 && context.master_id >= 0 => {
                self.verifier
                    .assert_match(tx_id, context.master_id, context.checksum)
            }
            _ => Ok(()),
        }
    }
}

/// Transaction bytes trailing a commit request
struct TrailingBytes<'a, 'r> {
    request: &'a mut LogReader<&'r mut dyn Read>,
}

impl TxExtractor for TrailingBytes<'_, '_> {
    fn extract(&mut self, buffer: &mut dyn LogBuffer) -> Result<()> {
        self.request.copy_to(buffer)?;
        Ok(())
    }
}

impl RequestHandler for MasterServer {
    fn name(&self) -> &str {
        "master"
    }

    fn protocol_version(&self) -> u8 {
        PROTOCOL_VERSION
    }

    fn max_request_bytes(&self) -> usize {
        MASTER_FRAME_LENGTH
    }

    fn handle(
        &self,
        request_type: u8,
        request: &mut LogReader<&mut dyn Read>,
        out: &mut dyn LogBuffer,
    ) -> Result<()> {
        let request_type = RequestType::try_from(request_type)?;
        tracing::trace!("Serving {}", request_type.name());
        let master = self.master.as_ref();

        match request_type {
            RequestType::AllocateIds => {
                let args: AllocateIdsArgs = read_serialized(request)?;
                write_response(out, master.allocate_ids(args.id_type)?)
            }
            RequestType::CreateRelationshipType => {
                let args: CreateRelationshipTypeArgs = read_serialized(request)?;
                self.verify(&args.context)?;
                write_response(
                    out,
                    master.create_relationship_type(&args.context, &args.name)?,
                )
            }
            RequestType::InitializeTx => {
                let args: ContextArgs = read_serialized(request)?;
                self.verify(&args.context)?;
                write_response(out, master.initialize_tx(&args.context)?)
            }
            RequestType::AcquireNodeWriteLock => {
                let args: LockArgs = read_serialized(request)?;
                self.verify(&args.context)?;
                write_response(out, master.acquire_node_write_lock(&args.context, &args.ids)?)
            }
            RequestType::AcquireNodeReadLock => {
                let args: LockArgs = read_serialized(request)?;
                self.verify(&args.context)?;
                write_response(out, master.acquire_node_read_lock(&args.context, &args.ids)?)
            }
            RequestType::AcquireRelationshipWriteLock => {
                let args: LockArgs = read_serialized(request)?;
                self.verify(&args.context)?;
                write_response(
                    out,
                    master.acquire_relationship_write_lock(&args.context, &args.ids)?,
                )
            }
            RequestType::AcquireRelationshipReadLock => {
                let args: LockArgs = read_serialized(request)?;
                self.verify(&args.context)?;
                write_response(
                    out,
                    master.acquire_relationship_read_lock(&args.context, &args.ids)?,
                )
            }
            RequestType::CommitSingleResourceTransaction => {
                let args: CommitArgs = read_serialized(request)?;
                self.verify(&args.context)?;
                let mut extractor = TrailingBytes { request };
                write_response(
                    out,
                    master.commit_single_resource_transaction(
                        &args.context,
                        &args.resource,
                        &mut extractor,
                    )?,
                )
            }
            RequestType::FinishTransaction => {
                let args: FinishArgs = read_serialized(request)?;
                self.verify(&args.context)?;
                write_response(out, master.finish_transaction(&args.context, args.success)?)
            }
            RequestType::PullUpdates => {
                let args: ContextArgs = read_serialized(request)?;
                self.verify(&args.context)?;
                write_response(out, master.pull_updates(&args.context)?)
            }
            RequestType::GetMasterIdForCommittedTx => {
                let args: MasterIdArgs = read_serialized(request)?;
                write_response(
                    out,
                    master.get_master_id_for_committed_tx(args.tx_id, &args.store_id)?,
                )
            }
            RequestType::CopyStore => {
                let args: ContextArgs = read_serialized(request)?;
                let response = {
                    let mut writer = NetworkStoreWriter::new(&mut *out);
                    master.copy_store(&args.context, &mut writer)?
                };
                write_response(out, response)
            }
            RequestType::CopyTransactions => {
                let args: CopyTransactionsArgs = read_serialized(request)?;
                write_response(
                    out,
                    master.copy_transactions(&args.context, &args.data_source, args.start, args.end)?,
                )
            }
            RequestType::AcquireIndexWriteLock => {
                let args: IndexLockArgs = read_serialized(request)?;
                self.verify(&args.context)?;
                write_response(
                    out,
                    master.acquire_index_write_lock(&args.context, &args.index, &args.key)?,
                )
            }
            RequestType::AcquireIndexReadLock => {
                let args: IndexLockArgs = read_serialized(request)?;
                self.verify(&args.context)?;
                write_response(
                    out,
                    master.acquire_index_read_lock(&args.context, &args.index, &args.key)?,
                )
            }
        }
    }
}
