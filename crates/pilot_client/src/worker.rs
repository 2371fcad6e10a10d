//! The pipelining RPC worker.
//!
//! One worker task owns one TCP connection to the driver leader. Each turn it
//! blocks for the first queued request, greedily drains whatever else is
//! already queued, then serves the batch: region lookups as ordered
//! request/response pairs, and all timestamp requests as a single `Tso`
//! round trip whose results are distributed in batch order. Any failure
//! poisons the connection; the worker reconnects and carries on with the
//! next batch.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pilot_proto::codec::{Frame, FrameCodec, FrameError};
use pilot_proto::meta::{Region, Timestamp};
use pilot_proto::rpc::{
    CmdType, GetMetaRequest, MetaType, Request, RequestHeader, Response, TsoRequest,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ClientError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const NET_IO_TIMEOUT: Duration = Duration::from_secs(1);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

static MSG_ID: AtomicU64 = AtomicU64::new(0);

fn next_msg_id() -> u64 {
    MSG_ID.fetch_add(1, Ordering::Relaxed) + 1
}

pub(crate) enum WorkerRequest {
    Tso {
        done: oneshot::Sender<Result<Timestamp, ClientError>>,
    },
    Region {
        key: Vec<u8>,
        done: oneshot::Sender<Result<Region, ClientError>>,
    },
}

impl WorkerRequest {
    fn fail(self, err: ClientError) {
        match self {
            WorkerRequest::Tso { done } => {
                let _ = done.send(Err(err));
            }
            WorkerRequest::Region { done, .. } => {
                let _ = done.send(Err(err));
            }
        }
    }
}

pub(crate) struct RpcWorker {
    addr: String,
    cluster_id: u64,
    rx: mpsc::Receiver<WorkerRequest>,
    shutdown: CancellationToken,
}

impl RpcWorker {
    pub(crate) fn new(
        addr: String,
        cluster_id: u64,
        rx: mpsc::Receiver<WorkerRequest>,
        shutdown: CancellationToken,
    ) -> RpcWorker {
        RpcWorker {
            addr,
            cluster_id,
            rx,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        'reconnect: loop {
            let Some(stream) = self.connect().await else {
                break;
            };
            let mut framed = Framed::new(stream, FrameCodec::new());

            loop {
                let first = tokio::select! {
                    _ = self.shutdown.cancelled() => break 'reconnect,
                    request = self.rx.recv() => request,
                };
                let Some(first) = first else {
                    break 'reconnect;
                };

                let mut batch = vec![first];
                while let Ok(request) = self.rx.try_recv() {
                    batch.push(request);
                }

                if !self.handle_batch(&mut framed, batch).await {
                    tracing::warn!(
                        addr = %self.addr,
                        "placement driver connection poisoned, reconnecting"
                    );
                    continue 'reconnect;
                }
            }
        }

        self.drain().await;
    }

    /// Dial the driver, retrying every second until connected or shut down.
    async fn connect(&mut self) -> Option<TcpStream> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            tracing::info!(addr = %self.addr, "connecting to placement driver");
            let attempt = tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                res = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.addr)) => res,
            };
            match attempt {
                Ok(Ok(stream)) => return Some(stream),
                Ok(Err(err)) => {
                    tracing::warn!(
                        addr = %self.addr,
                        error = %err,
                        "failed to connect to placement driver, will retry"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        addr = %self.addr,
                        "connect to placement driver timed out, will retry"
                    );
                }
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    /// Serve one drained batch. Returns false when the connection is
    /// poisoned and must be re-established; the failed requests are already
    /// resolved with their errors.
    async fn handle_batch(
        &mut self,
        framed: &mut Framed<TcpStream, FrameCodec>,
        batch: Vec<WorkerRequest>,
    ) -> bool {
        let mut ok = true;
        let mut tso_waiters = Vec::new();

        for request in batch {
            match request {
                WorkerRequest::Tso { done } => tso_waiters.push(done),
                WorkerRequest::Region { key, done } => {
                    match self.fetch_region(framed, key).await {
                        Ok(region) => {
                            let _ = done.send(Ok(region));
                        }
                        Err(err) => {
                            ok = false;
                            tracing::error!(error = %err, "region lookup rpc failed");
                            let _ = done.send(Err(err));
                        }
                    }
                }
            }
        }

        if !tso_waiters.is_empty() {
            match self.fetch_timestamps(framed, tso_waiters.len() as u32).await {
                Ok(timestamps) => {
                    for (done, ts) in tso_waiters.into_iter().zip(timestamps) {
                        let _ = done.send(Ok(ts));
                    }
                }
                Err(err) => {
                    ok = false;
                    tracing::error!(error = %err, "timestamp rpc failed");
                    for done in tso_waiters {
                        let _ = done.send(Err(err.clone()));
                    }
                }
            }
        }

        ok
    }

    async fn fetch_timestamps(
        &mut self,
        framed: &mut Framed<TcpStream, FrameCodec>,
        count: u32,
    ) -> Result<Vec<Timestamp>, ClientError> {
        let request = Request {
            header: Some(self.header()),
            cmd_type: CmdType::Tso as i32,
            tso: Some(TsoRequest { count }),
            ..Default::default()
        };
        let response = self.round_trip(framed, &request).await?;
        let tso = response
            .tso
            .ok_or_else(|| ClientError::Unexpected("tso field not set in response".to_string()))?;
        if tso.timestamps.len() != count as usize {
            return Err(ClientError::Unexpected(format!(
                "asked for {count} timestamps, got {}",
                tso.timestamps.len()
            )));
        }
        Ok(tso.timestamps)
    }

    async fn fetch_region(
        &mut self,
        framed: &mut Framed<TcpStream, FrameCodec>,
        key: Vec<u8>,
    ) -> Result<Region, ClientError> {
        let request = Request {
            header: Some(self.header()),
            cmd_type: CmdType::GetMeta as i32,
            get_meta: Some(GetMetaRequest {
                meta_type: MetaType::RegionType as i32,
                region_key: key,
            }),
            ..Default::default()
        };
        let response = self.round_trip(framed, &request).await?;
        response
            .get_meta
            .and_then(|meta| meta.region)
            .ok_or_else(|| ClientError::Unexpected("region not set in response".to_string()))
    }

    /// One framed request/response exchange under the per-operation
    /// I/O deadline. The stream is strictly ordered, so the reply id must
    /// match the request id.
    async fn round_trip(
        &mut self,
        framed: &mut Framed<TcpStream, FrameCodec>,
        request: &Request,
    ) -> Result<Response, ClientError> {
        let msg_id = next_msg_id();
        deadline(framed.send(Frame::from_msg(msg_id, request))).await??;

        let frame = match deadline(framed.next()).await? {
            Some(frame) => frame?,
            None => {
                return Err(FrameError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "placement driver closed the connection",
                ))
                .into());
            }
        };
        if frame.msg_id != msg_id {
            return Err(ClientError::Unexpected(format!(
                "response id {} does not match request id {msg_id}",
                frame.msg_id
            )));
        }

        let response: Response = frame.decode()?;
        if let Some(err) = response.header.as_ref().and_then(|h| h.error.as_ref()) {
            return Err(ClientError::Server(err.message.clone()));
        }
        Ok(response)
    }

    fn header(&self) -> RequestHeader {
        RequestHeader {
            uuid: Uuid::new_v4().as_bytes().to_vec(),
            cluster_id: self.cluster_id,
        }
    }

    /// Fail everything still queued so no request is leaked on shutdown.
    async fn drain(&mut self) {
        self.rx.close();
        while let Some(request) = self.rx.recv().await {
            request.fail(ClientError::Closed);
        }
    }
}

async fn deadline<T>(fut: impl std::future::Future<Output = T>) -> Result<T, ClientError> {
    time::timeout(NET_IO_TIMEOUT, fut).await.map_err(|_| {
        ClientError::from(FrameError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "placement driver i/o deadline exceeded",
        )))
    })
}
