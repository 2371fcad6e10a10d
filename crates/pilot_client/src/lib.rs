//! Client for the shardpilot placement driver.
//!
//! A [`Client`] owns one background worker task that multiplexes every
//! timestamp and region-lookup request over a single long-lived connection to
//! the driver leader, batching whatever is queued at the moment the
//! connection is free. See [`worker`] for the pipelining loop.

mod worker;

use std::sync::Arc;

use pilot_proto::codec::FrameError;
use pilot_proto::meta::{Region, Timestamp};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use worker::{RpcWorker, WorkerRequest};

/// Maximum number of requests queued toward the worker before submissions
/// fail with [`ClientError::Busy`].
pub const MAX_PIPELINED_REQUESTS: usize = 10_000;

#[derive(Clone, Debug, Error)]
pub enum ClientError {
    #[error("placement driver request queue is full")]
    Busy,
    #[error("placement driver client is closed")]
    Closed,
    #[error("rpc failed: {0}")]
    Rpc(Arc<FrameError>),
    #[error("placement driver error: {0}")]
    Server(String),
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

impl From<FrameError> for ClientError {
    fn from(err: FrameError) -> ClientError {
        ClientError::Rpc(Arc::new(err))
    }
}

/// Handle to the pipelined placement driver connection.
pub struct Client {
    tx: Option<mpsc::Sender<WorkerRequest>>,
    shutdown: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl Client {
    /// Connect to the driver leader at `addr` for the given cluster.
    ///
    /// The connection is established lazily by the worker; requests queue
    /// until it is up and fail individually if it breaks.
    pub fn new(addr: impl Into<String>, cluster_id: u64) -> Client {
        Client::with_capacity(addr, cluster_id, MAX_PIPELINED_REQUESTS)
    }

    fn with_capacity(addr: impl Into<String>, cluster_id: u64, capacity: usize) -> Client {
        let (tx, rx) = mpsc::channel(capacity);
        let shutdown = CancellationToken::new();
        let worker = RpcWorker::new(addr.into(), cluster_id, rx, shutdown.clone());
        let handle = tokio::spawn(worker.run());
        Client {
            tx: Some(tx),
            shutdown,
            worker: Some(handle),
        }
    }

    /// Fetch one timestamp from the driver's timestamp oracle.
    pub async fn get_ts(&self) -> Result<Timestamp, ClientError> {
        let (done, wait) = oneshot::channel();
        self.submit(WorkerRequest::Tso { done })?;
        wait.await.map_err(|_| ClientError::Closed)?
    }

    /// Look up the region covering `key`.
    pub async fn get_region(&self, key: &[u8]) -> Result<Region, ClientError> {
        let (done, wait) = oneshot::channel();
        self.submit(WorkerRequest::Region {
            key: key.to_vec(),
            done,
        })?;
        wait.await.map_err(|_| ClientError::Closed)?
    }

    /// Stop the worker and fail every still-queued request with
    /// [`ClientError::Closed`]. No request is leaked.
    pub async fn close(mut self) {
        // Drop the sender first so the worker's drain observes a closed
        // channel and cannot race a late submission.
        self.tx = None;
        self.shutdown.cancel();
        if let Some(handle) = self.worker.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = ?err, "placement driver client worker panicked");
            }
        }
    }

    fn submit(&self, request: WorkerRequest) -> Result<(), ClientError> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(ClientError::Closed);
        };
        tx.try_send(request).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ClientError::Busy,
            mpsc::error::TrySendError::Closed(_) => ClientError::Closed,
        })
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_queue_reports_busy() {
        // Nothing listens on the target address, so the worker sits in its
        // reconnect loop and the queue cannot drain.
        let client = Client::with_capacity("127.0.0.1:1", 1, 2);
        let (done_a, _wait_a) = oneshot::channel();
        let (done_b, _wait_b) = oneshot::channel();
        client
            .submit(WorkerRequest::Tso { done: done_a })
            .expect("first queued");
        client
            .submit(WorkerRequest::Tso { done: done_b })
            .expect("second queued");

        let (done_c, _wait_c) = oneshot::channel();
        assert!(matches!(
            client.submit(WorkerRequest::Tso { done: done_c }),
            Err(ClientError::Busy)
        ));
        client.close().await;
    }

    #[tokio::test]
    async fn close_drains_queued_requests() {
        let client = Client::with_capacity("127.0.0.1:1", 1, 8);
        let (done, wait) = oneshot::channel();
        client
            .submit(WorkerRequest::Tso { done })
            .expect("request queued");

        client.close().await;
        match wait.await {
            Ok(Err(ClientError::Closed)) => {}
            other => panic!("expected drained request to fail closed, got {other:?}"),
        }
    }
}
