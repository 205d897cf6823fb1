//! Master RPC responses with piggybacked transaction streams

use crate::Result;
use crate::log::{CommittedTransaction, TransactionIter};
use crate::store_id::StoreId;
use std::fmt;

/// Transactions of one data source that the caller has not applied yet
pub struct TransactionStream {
    data_source_name: String,
    transactions: Box<dyn Iterator<Item = Result<CommittedTransaction>> + Send>,
}

impl TransactionStream {
    /// Stream over any source of transactions
    pub fn new(
        data_source_name: impl Into<String>,
        transactions: impl Iterator<Item = Result<CommittedTransaction>> + Send + 'static,
    ) -> Self {
        Self {
            data_source_name: data_source_name.into(),
            transactions: Box::new(transactions),
        }
    }

    /// Stream reading lazily from a transaction log
    pub fn from_log(data_source_name: impl Into<String>, iter: TransactionIter) -> Self {
        Self::new(data_source_name, iter)
    }

    /// Stream over transactions already in memory
    pub fn from_vec(data_source_name: impl Into<String>, txs: Vec<CommittedTransaction>) -> Self {
        Self::new(data_source_name, txs.into_iter().map(Ok))
    }

    /// Data source the transactions belong to
    pub fn data_source_name(&self) -> &str {
        &self.data_source_name
    }
}

impl Iterator for TransactionStream {
    type Item = Result<CommittedTransaction>;

    fn next(&mut self) -> Option<Self::Item> {
        self.transactions.next()
    }
}

impl fmt::Debug for TransactionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionStream")
            .field("data_source_name", &self.data_source_name)
            .finish_non_exhaustive()
    }
}

/// Runs a release action exactly once, on `release()` or on drop
pub struct ResourceReleaser(Option<Box<dyn FnOnce() + Send>>);

impl ResourceReleaser {
    /// Releaser running `release` once
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(release)))
    }

    /// Releaser with nothing to release
    pub fn noop() -> Self {
        Self(None)
    }

    /// Run the release action if it has not run yet
    pub fn release(&mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

impl Drop for ResourceReleaser {
    fn drop(&mut self) {
        self.release();
    }
}

/// Nominal result of a master call plus catch-up transactions
///
/// Must be consumed exactly once; whichever way it is consumed (or dropped),
/// the streams' file handles and the releaser are freed.
pub struct Response<T> {
    value: T,
    store_id: StoreId,
    streams: Vec<TransactionStream>,
    releaser: ResourceReleaser,
}

impl<T> Response<T> {
    /// Create a response
    pub fn new(
        value: T,
        store_id: StoreId,
        streams: Vec<TransactionStream>,
        releaser: ResourceReleaser,
    ) -> Self {
        Self {
            value,
            store_id,
            streams,
            releaser,
        }
    }

    /// Response carrying no transactions
    pub fn without_streams(value: T, store_id: StoreId) -> Self {
        Self::new(value, store_id, Vec::new(), ResourceReleaser::noop())
    }

    /// Nominal result
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Store id of the answering master
    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    /// Streams not yet consumed
    pub fn streams(&self) -> &[TransactionStream] {
        &self.streams
    }

    /// Take the streams out, leaving the response with none
    pub fn take_streams(&mut self) -> Vec<TransactionStream> {
        std::mem::take(&mut self.streams)
    }

    /// Replace the streams, keeping value and releaser
    pub fn with_streams(mut self, streams: Vec<TransactionStream>) -> Self {
        self.streams = streams;
        self
    }

    /// Replace the nominal value, keeping streams and releaser
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Response<U> {
        let Response {
            value,
            store_id,
            streams,
            releaser,
        } = self;
        Response {
            value: f(value),
            store_id,
            streams,
            releaser,
        }
    }

    /// Release every resource and return the nominal value
    pub fn into_value(self) -> T {
        let Response {
            value,
            streams,
            mut releaser,
            ..
        } = self;
        drop(streams);
        releaser.release();
        value
    }

    /// Release every resource without looking at the streams
    pub fn close(self) {
        drop(self.into_value());
    }

    /// Feed every transaction to `applier`, then close
    ///
    /// The applier receives the data source name and the transaction, in
    /// stream order. Resources are released even when applying fails.
    pub fn apply<F>(mut self, mut applier: F) -> Result<T>
    where
        F: FnMut(&str, CommittedTransaction) -> Result<()>,
    {
        for stream in self.take_streams() {
            let name = stream.data_source_name.clone();
            for tx in stream {
                applier(&name, tx?)?;
            }
        }
        Ok(self.into_value())
    }
}

impl<T: fmt::Debug> fmt::Debug for Response<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("value", &self.value)
            .field("store_id", &self.store_id)
            .field("streams", &self.streams)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_releaser() -> (ResourceReleaser, Arc<AtomicUsize>) {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let releaser = ResourceReleaser::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (releaser, released)
    }

    fn txs(ids: &[u64]) -> Vec<CommittedTransaction> {
        ids.iter()
            .map(|id| CommittedTransaction::new(*id, 1, *id, vec![*id as u8]))
            .collect()
    }

    #[test]
    fn test_apply_visits_in_order_and_releases() {
        let (releaser, released) = counting_releaser();
        let response = Response::new(
            "ok",
            StoreId::new(1, 2, 1),
            vec![
                TransactionStream::from_vec("graph", txs(&[4, 5])),
                TransactionStream::from_vec("index", txs(&[9])),
            ],
            releaser,
        );

        let mut seen = Vec::new();
        let value = response
            .apply(|name, tx| {
                seen.push((name.to_string(), tx.tx_id));
                Ok(())
            })
            .unwrap();
        assert_eq!(value, "ok");
        assert_eq!(
            seen,
            vec![
                ("graph".to_string(), 4),
                ("graph".to_string(), 5),
                ("index".to_string(), 9)
            ]
        );
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_apply_still_releases() {
        let (releaser, released) = counting_releaser();
        let response = Response::new(
            (),
            StoreId::new(1, 2, 1),
            vec![TransactionStream::from_vec("graph", txs(&[1, 2]))],
            releaser,
        );
        let result = response.apply(|_, _| Err(Error::branched("diverged")));
        assert!(matches!(result, Err(Error::BranchedData(_))));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases_once() {
        let (releaser, released) = counting_releaser();
        let response = Response::new(1u64, StoreId::new(1, 2, 1), Vec::new(), releaser);
        drop(response);
        assert_eq!(released.load(Ordering::SeqCst), 1);

        let (releaser, released) = counting_releaser();
        Response::new(1u64, StoreId::new(1, 2, 1), Vec::new(), releaser).close();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
