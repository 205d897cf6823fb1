//! Client side of the master protocol

use crate::context::SlaveContext;
use crate::master::{IdAllocation, IdType, LockResult, Master, TxExtractor};
use crate::protocol::{
    AllocateIdsArgs, CommitArgs, ContextArgs, CopyTransactionsArgs, CreateRelationshipTypeArgs,
    FinishArgs, IndexLockArgs, LockArgs, MasterIdArgs, PROTOCOL_VERSION, RequestType,
};
use crate::response::Response;
use crate::store_copy::StoreWriter;
use crate::store_id::StoreId;
use crate::transport::client::{
    DEFAULT_CHECKOUT_TIMEOUT, DEFAULT_MAX_CHANNELS, RequestClient, RequestExtras,
};
use crate::transport::{TcpTransport, Transport};
use crate::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// Remote [`Master`] reached through a [`Transport`]
pub struct MasterClient {
    client: RequestClient,
}

type Extras<'a> = RequestExtras<'a>;

impl MasterClient {
    /// Client for the master with id `machine_id`
    pub fn new(
        transport: Arc<dyn Transport>,
        machine_id: i32,
        max_channels: usize,
        checkout_timeout: Duration,
    ) -> Self {
        Self {
            client: RequestClient::new(
                transport,
                machine_id,
                PROTOCOL_VERSION,
                max_channels,
                checkout_timeout,
            ),
        }
    }

    /// Client over TCP with default pool settings
    pub fn connect(host: impl Into<String>, port: u16, machine_id: i32) -> Self {
        Self::new(
            Arc::new(TcpTransport::new(host, port)),
            machine_id,
            DEFAULT_MAX_CHANNELS,
            DEFAULT_CHECKOUT_TIMEOUT,
        )
    }

    /// Machine id of the master this client talks to
    pub fn machine_id(&self) -> i32 {
        self.client.machine_id()
    }

    /// Endpoint description
    pub fn describe(&self) -> String {
        self.client.describe()
    }

    /// Close pooled connections that are not in use
    pub fn close_idle(&self) {
        self.client.close_idle();
    }

    fn call<A: Serialize, T: DeserializeOwned>(
        &self,
        request_type: RequestType,
        context: Option<&SlaveContext>,
        args: &A,
        extras: Extras<'_>,
    ) -> Result<Response<T>> {
        self.client
            .call(request_type as u8, request_type.name(), context, args, extras)
    }
}

impl Master for MasterClient {
    fn allocate_ids(&self, id_type: IdType) -> Result<Response<IdAllocation>> {
        self.call(
            RequestType::AllocateIds,
            None,
            &AllocateIdsArgs { id_type },
            Extras::default(),
        )
    }

    fn create_relationship_type(&self, context: &SlaveContext, name: &str) -> Result<Response<i32>> {
        let args = CreateRelationshipTypeArgs {
            context: context.clone(),
            name: name.to_string(),
        };
        self.call(
            RequestType::CreateRelationshipType,
            Some(context),
            &args,
            Extras::default(),
        )
    }

    fn initialize_tx(&self, context: &SlaveContext) -> Result<Response<()>> {
        let args = ContextArgs {
            context: context.clone(),
        };
        self.call(RequestType::InitializeTx, Some(context), &args, Extras::default())
    }

    fn acquire_node_write_lock(
        &self,
        context: &SlaveContext,
        nodes: &[u64],
    ) -> Result<Response<LockResult>> {
        self.lock(RequestType::AcquireNodeWriteLock, context, nodes)
    }

    fn acquire_node_read_lock(
        &self,
        context: &SlaveContext,
        nodes: &[u64],
    ) -> Result<Response<LockResult>> {
        self.lock(RequestType::AcquireNodeReadLock, context, nodes)
    }

    fn acquire_relationship_write_lock(
        &self,
        context: &SlaveContext,
        relationships: &[u64],
    ) -> Result<Response<LockResult>> {
        self.lock(RequestType::AcquireRelationshipWriteLock, context, relationships)
    }

    fn acquire_relationship_read_lock(
        &self,
        context: &SlaveContext,
        relationships: &[u64],
    ) -> Result<Response<LockResult>> {
        self.lock(RequestType::AcquireRelationshipReadLock, context, relationships)
    }

    fn commit_single_resource_transaction(
        &self,
        context: &SlaveContext,
        resource: &str,
        extractor: &mut dyn TxExtractor,
    ) -> Result<Response<u64>> {
        let args = CommitArgs {
            context: context.clone(),
            resource: resource.to_string(),
        };
        self.call(
            RequestType::CommitSingleResourceTransaction,
            Some(context),
            &args,
            Extras {
                extractor: Some(extractor),
                store_writer: None,
            },
        )
    }

    fn finish_transaction(&self, context: &SlaveContext, success: bool) -> Result<Response<()>> {
        let args = FinishArgs {
            context: context.clone(),
            success,
        };
        self.call(
            RequestType::FinishTransaction,
            Some(context),
            &args,
            Extras::default(),
        )
    }

    fn pull_updates(&self, context: &SlaveContext) -> Result<Response<()>> {
        let args = ContextArgs {
            context: context.clone(),
        };
        self.call(RequestType::PullUpdates, Some(context), &args, Extras::default())
    }

    fn get_master_id_for_committed_tx(
        &self,
        tx_id: u64,
        store_id: &StoreId,
    ) -> Result<Response<(i32, u64)>> {
        let args = MasterIdArgs {
            tx_id,
            store_id: *store_id,
        };
        self.call(
            RequestType::GetMasterIdForCommittedTx,
            None,
            &args,
            Extras::default(),
        )
    }

    fn copy_store(
        &self,
        context: &SlaveContext,
        writer: &mut dyn StoreWriter,
    ) -> Result<Response<()>> {
        let args = ContextArgs {
            context: context.clone(),
        };
        let response = self.call(
            RequestType::CopyStore,
            Some(context),
            &args,
            Extras {
                extractor: None,
                store_writer: Some(&mut *writer),
            },
        )?;
        writer.done()?;
        Ok(response)
    }

    fn copy_transactions(
        &self,
        context: &SlaveContext,
        data_source: &str,
        start: u64,
        end: u64,
    ) -> Result<Response<()>> {
        let args = CopyTransactionsArgs {
            context: context.clone(),
            data_source: data_source.to_string(),
            start,
            end,
        };
        self.call(
            RequestType::CopyTransactions,
            Some(context),
            &args,
            Extras::default(),
        )
    }

    fn acquire_index_write_lock(
        &self,
        context: &SlaveContext,
        index: &str,
        key: &str,
    ) -> Result<Response<LockResult>> {
        self.index_lock(RequestType::AcquireIndexWriteLock, context, index, key)
    }

    fn acquire_index_read_lock(
        &self,
        context: &SlaveContext,
        index: &str,
        key: &str,
    ) -> Result<Response<LockResult>> {
        self.index_lock(RequestType::AcquireIndexReadLock, context, index, key)
    }
}

impl MasterClient {
    fn lock(
        &self,
        request_type: RequestType,
        context: &SlaveContext,
        ids: &[u64],
    ) -> Result<Response<LockResult>> {
        let args = LockArgs {
            context: context.clone(),
            ids: ids.to_vec(),
        };
        self.call(request_type, Some(context), &args, Extras::default())
    }

    fn index_lock(
        &self,
        request_type: RequestType,
        context: &SlaveContext,
        index: &str,
        key: &str,
    ) -> Result<Response<LockResult>> {
        let args = IndexLockArgs {
            context: context.clone(),
            index: index.to_string(),
            key: key.to_string(),
        };
        self.call(request_type, Some(context), &args, Extras::default())
    }
}
