//! The job worker: plans membership changes and splits, drives the queued
//! jobs against storage nodes, and reconciles rejected commands with the
//! region state the nodes actually hold.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pilot_proto::codec::{Frame, FrameCodec};
use pilot_proto::meta::{Peer, Region, Store};
use pilot_proto::raft::{
    AdminCmdType, AdminRequest, ChangePeerRequest, ConfChangeType, Job, JobStatus, MessageType,
    RaftCmdRequest, RaftCmdResponse, RaftRequestHeader, RegionDetailRequest, RegionDetailResponse,
    RegionLeaderRequest, SplitRequest, StatusCmdType, StatusRequest, StoreMessage,
};
use pilot_proto::rpc::{AskChangePeerRequest, AskSplitRequest};
use prost::Message;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cluster::Cluster;
use crate::error::{Error, Result};
use crate::keys;
use crate::metastore::{Compare, TxnOp};

/// The ticker that pulses the worker even without explicit nudges.
const CHECK_JOB_INTERVAL: Duration = Duration::from_secs(10);

const STORE_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const STORE_IO_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_SEND_RETRY: usize = 10;

static MSG_ID: AtomicU64 = AtomicU64::new(0);

fn next_msg_id() -> u64 {
    MSG_ID.fetch_add(1, Ordering::Relaxed) + 1
}

/// Single-threaded loop owning all job execution for one cluster.
pub(crate) async fn run_job_worker(
    cluster: Arc<Cluster>,
    mut ask_job_rx: mpsc::Receiver<()>,
    next_retry_delay: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = time::interval(CHECK_JOB_INTERVAL);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                cluster.notify_job_worker();
            }
            pulse = ask_job_rx.recv() => {
                if pulse.is_none() {
                    break;
                }
                if !cluster.gate.is_leader() {
                    tracing::warn!("not the leader, leaving queued jobs alone");
                    continue;
                }

                let job = match cluster.first_job().await {
                    Ok(Some(job)) => job,
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to read the job queue");
                        continue;
                    }
                };

                if let Err(err) = cluster.handle_job(&job).await {
                    tracing::error!(
                        job_id = job.job_id,
                        error = %err,
                        "job failed, will retry"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = time::sleep(next_retry_delay) => {}
                    }
                    cluster.notify_job_worker();
                    continue;
                }

                if let Err(err) = cluster.pop_job(&job).await {
                    tracing::error!(job_id = job.job_id, error = %err, "failed to pop job");
                }
                cluster.notify_job_worker();
            }
        }
    }

    cluster.conns.close();
}

impl Cluster {
    /// Plan a membership change toward the configured replica count and
    /// queue it as a job. A region already at target is a no-op.
    pub async fn handle_ask_change_peer(&self, request: AskChangePeerRequest) -> Result<()> {
        let meta = self.get_cluster_meta().await?;
        let target = meta.max_peer_count as usize;
        let region = request
            .region
            .ok_or_else(|| Error::Protocol("ask change peer without a region".to_string()))?;
        let region_id = region.region_id;
        let current = region.peers.len();

        let (change_type, peer) = if current == target {
            tracing::info!(region_id, peers = current, "region already at target size");
            return Ok(());
        } else if current < target {
            tracing::info!(region_id, peers = current, target, "planning replica add");
            (ConfChangeType::AddReplica, self.plan_add_peer(&region).await?)
        } else {
            tracing::info!(region_id, peers = current, target, "planning replica removal");
            (
                ConfChangeType::RemoveReplica,
                plan_remove_peer(&region, request.leader.as_ref())?,
            )
        };

        let admin = AdminRequest {
            cmd_type: AdminCmdType::ChangePeer as i32,
            change_peer: Some(ChangePeerRequest {
                change_type: change_type as i32,
                peer: Some(peer),
                region: Some(region),
            }),
            split: None,
        };
        self.post_job(RaftCmdRequest {
            header: Some(RaftRequestHeader {
                uuid: vec![],
                region_id,
                peer: request.leader,
            }),
            admin: Some(admin),
            status: None,
        })
        .await
    }

    /// Allocate ids for a split at `split_key` and queue it as a job.
    pub async fn handle_ask_split(&self, request: AskSplitRequest) -> Result<()> {
        let region = request
            .region
            .ok_or_else(|| Error::Protocol("ask split without a region".to_string()))?;
        let region_id = region.region_id;

        let new_region_id = self.alloc.alloc().await?;
        let mut new_peer_ids = Vec::with_capacity(region.peers.len());
        for _ in &region.peers {
            new_peer_ids.push(self.alloc.alloc().await?);
        }
        tracing::info!(
            region_id,
            new_region_id,
            split_key = %keys::display_key(&request.split_key),
            "planning region split"
        );

        let admin = AdminRequest {
            cmd_type: AdminCmdType::Split as i32,
            change_peer: None,
            split: Some(SplitRequest {
                new_region_id,
                new_peer_ids,
                split_key: request.split_key,
                region: Some(region),
            }),
        };
        self.post_job(RaftCmdRequest {
            header: Some(RaftRequestHeader {
                uuid: vec![],
                region_id,
                peer: request.leader,
            }),
            admin: Some(admin),
            status: None,
        })
        .await
    }

    /// Pick a store for a fresh replica: prefer stores whose node carries no
    /// peer of this region, fall back to same-node stores, and never reuse a
    /// store that already holds one.
    async fn plan_add_peer(&self, region: &Region) -> Result<Peer> {
        let peer_id = self.alloc.alloc().await?;

        let mut best = Vec::new();
        let mut same_node = Vec::new();
        for store in self.stores_snapshot() {
            let mut on_store = false;
            let mut on_node = false;
            for peer in &region.peers {
                if peer.store_id == store.store_id {
                    on_store = true;
                    break;
                } else if peer.node_id == store.node_id {
                    on_node = true;
                }
            }
            if on_store {
                continue;
            } else if on_node {
                same_node.push(store);
            } else {
                best.push(store);
            }
        }

        let store =
            choose_store(&best, &same_node).ok_or(Error::NoStoreForPeer(region.region_id))?;
        Ok(Peer {
            peer_id,
            node_id: store.node_id,
            store_id: store.store_id,
        })
    }

    pub(crate) async fn handle_job(&self, job: &Job) -> Result<()> {
        tracing::debug!(job_id = job.job_id, "handling job");
        if job.status() == JobStatus::Pending {
            self.update_job_status(job, JobStatus::Running).await?;
        }

        let request = job
            .request
            .clone()
            .ok_or_else(|| Error::Protocol("job without a request".to_string()))?;
        let admin = request
            .admin
            .as_ref()
            .ok_or_else(|| Error::Protocol("job without an admin request".to_string()))?;
        match admin.cmd_type() {
            AdminCmdType::ChangePeer => self.run_change_peer_job(&request).await,
            AdminCmdType::Split => self.run_split_job(&request).await,
            AdminCmdType::InvalidAdmin => {
                tracing::error!(job_id = job.job_id, "job carries no valid command, ignoring");
                Ok(())
            }
        }
    }

    async fn run_change_peer_job(&self, request: &RaftCmdRequest) -> Result<()> {
        let region = request
            .admin
            .as_ref()
            .and_then(|a| a.change_peer.as_ref())
            .and_then(|c| c.region.clone())
            .ok_or_else(|| Error::Protocol("change peer job without a region".to_string()))?;

        let response = self.send_raft_command(request.clone(), &region).await?;

        let region = if let Some(rejection) = rejection_message(&response) {
            tracing::error!(
                region_id = region.region_id,
                error = %rejection,
                "change peer rejected, checking the storage node state"
            );
            match self.check_change_peer_applied(request).await? {
                Some(region) => region,
                None => {
                    tracing::warn!(
                        region_id = region.region_id,
                        "storage node did not apply the change peer, canceling the job"
                    );
                    return Ok(());
                }
            }
        } else {
            response
                .admin
                .and_then(|a| a.change_peer)
                .and_then(|c| c.region)
                .ok_or_else(|| {
                    Error::Protocol("change peer response without a region".to_string())
                })?
        };

        let search_key =
            keys::region_search_key(&self.root, &keys::encode_end_key(&region.end_key));
        self.leader_txn(
            vec![],
            vec![TxnOp::put(search_key, region.encode_to_vec())],
            "update change peer region",
        )
        .await
    }

    /// A rejected change-peer command may still have applied. Ask any
    /// reachable peer for the region detail: a present target peer confirms
    /// an add, an absent one confirms a removal.
    async fn check_change_peer_applied(&self, request: &RaftCmdRequest) -> Result<Option<Region>> {
        let header = request
            .header
            .as_ref()
            .ok_or_else(|| Error::Protocol("change peer job without a header".to_string()))?;
        let leader = header
            .peer
            .clone()
            .ok_or_else(|| Error::Protocol("change peer job without a peer".to_string()))?;
        let change = request
            .admin
            .as_ref()
            .and_then(|a| a.change_peer.as_ref())
            .ok_or_else(|| Error::Protocol("change peer job without a change".to_string()))?;
        let target_peer_id = change.peer.as_ref().map(|p| p.peer_id).unwrap_or(0);

        let detail = self.region_detail(header.region_id, &leader).await?;
        let region = detail
            .region
            .ok_or_else(|| Error::Protocol("region detail without a region".to_string()))?;
        let found = region.peers.iter().any(|p| p.peer_id == target_peer_id);

        let applied = match change.change_type() {
            ConfChangeType::AddReplica => found,
            ConfChangeType::RemoveReplica => !found,
        };
        Ok(applied.then_some(region))
    }

    async fn run_split_job(&self, request: &RaftCmdRequest) -> Result<()> {
        let split = request
            .admin
            .as_ref()
            .and_then(|a| a.split.as_ref())
            .ok_or_else(|| Error::Protocol("split job without a split".to_string()))?;
        let region = split
            .region
            .clone()
            .ok_or_else(|| Error::Protocol("split job without a region".to_string()))?;

        let response = self.send_raft_command(request.clone(), &region).await?;

        let (left, right) = if let Some(rejection) = rejection_message(&response) {
            tracing::error!(
                region_id = region.region_id,
                error = %rejection,
                "split rejected, checking the storage node state"
            );
            match self.check_split_applied(request).await? {
                Some(pair) => pair,
                None => {
                    tracing::warn!(
                        region_id = region.region_id,
                        "storage node did not apply the split, canceling the job"
                    );
                    return Ok(());
                }
            }
        } else {
            let split_resp = response
                .admin
                .and_then(|a| a.split)
                .ok_or_else(|| Error::Protocol("split response without a split".to_string()))?;
            let left = split_resp
                .left
                .ok_or_else(|| Error::Protocol("split response without a left".to_string()))?;
            let right = split_resp
                .right
                .ok_or_else(|| Error::Protocol("split response without a right".to_string()))?;
            (left, right)
        };

        self.persist_split(&left, &right).await
    }

    /// Persist both halves of a split in one transaction guarded against
    /// replays: the left search key must be new, the right search key is the
    /// old end and must exist, and the right region id must be fresh.
    async fn persist_split(&self, left: &Region, right: &Region) -> Result<()> {
        let left_encoded = keys::encode_end_key(&left.end_key);
        let right_encoded = keys::encode_end_key(&right.end_key);
        let left_search = keys::region_search_key(&self.root, &left_encoded);
        let right_search = keys::region_search_key(&self.root, &right_encoded);
        let left_region = keys::region_key(&self.root, left.region_id);
        let right_region = keys::region_key(&self.root, right.region_id);

        let cmps = vec![
            Compare::CreateRevisionEq(left_search.clone(), 0),
            Compare::CreateRevisionGt(right_search.clone(), 0),
            Compare::CreateRevisionEq(right_region.clone(), 0),
        ];
        let ops = vec![
            TxnOp::put(left_region, left_encoded),
            TxnOp::put(right_region, right_encoded),
            TxnOp::put(left_search.clone(), left.encode_to_vec()),
            TxnOp::put(right_search, right.encode_to_vec()),
        ];
        match self.leader_txn(cmps, ops, "update split regions").await {
            Ok(()) => Ok(()),
            Err(Error::Txn(what)) => {
                // A retried job can race its own earlier success: if the left
                // half is already in the directory, the split is persisted.
                if let Some(kv) = self.store.get(&left_search).await? {
                    let persisted = Region::decode(kv.value.as_slice())?;
                    if persisted.region_id == left.region_id {
                        tracing::info!(
                            region_id = left.region_id,
                            "split already persisted, treating as success"
                        );
                        return Ok(());
                    }
                }
                Err(Error::Txn(what))
            }
            Err(err) => Err(err),
        }
    }

    /// A rejected split may still have applied. If the left half's end key
    /// already equals the split key, read the right half by its new id and
    /// report the pair.
    async fn check_split_applied(
        &self,
        request: &RaftCmdRequest,
    ) -> Result<Option<(Region, Region)>> {
        let header = request
            .header
            .as_ref()
            .ok_or_else(|| Error::Protocol("split job without a header".to_string()))?;
        let leader = header
            .peer
            .clone()
            .ok_or_else(|| Error::Protocol("split job without a peer".to_string()))?;
        let split = request
            .admin
            .as_ref()
            .and_then(|a| a.split.as_ref())
            .ok_or_else(|| Error::Protocol("split job without a split".to_string()))?;

        let left_detail = self.region_detail(header.region_id, &leader).await?;
        let left = left_detail
            .region
            .ok_or_else(|| Error::Protocol("region detail without a region".to_string()))?;
        if left.end_key != split.split_key {
            return Ok(None);
        }

        let right_detail = self.region_detail(split.new_region_id, &leader).await?;
        let right = right_detail
            .region
            .ok_or_else(|| Error::Protocol("region detail without a region".to_string()))?;
        Ok(Some((left, right)))
    }

    /// Deliver an admin command to the region's leader, chasing leadership
    /// for up to ten attempts. A network failure propagates so the job loop
    /// can retry later; a response (even a rejection) is returned as-is.
    pub(crate) async fn send_raft_command(
        &self,
        mut request: RaftCmdRequest,
        region: &Region,
    ) -> Result<RaftCmdResponse> {
        let origin_peer = request
            .header
            .as_ref()
            .and_then(|h| h.peer.clone())
            .ok_or_else(|| Error::Protocol("raft command without a target peer".to_string()))?;

        'retry: for _ in 0..MAX_SEND_RETRY {
            let response = self.call_command(&request).await?;

            let not_leader = response
                .header
                .as_ref()
                .and_then(|h| h.error.as_ref())
                .and_then(|e| e.not_leader.clone());
            let Some(not_leader) = not_leader else {
                return Ok(response);
            };
            tracing::warn!(
                region_id = region.region_id,
                peer_id = request.header.as_ref().and_then(|h| h.peer.as_ref()).map(|p| p.peer_id),
                "target peer is not the region leader"
            );

            if let Some(leader) = not_leader.leader {
                if let Some(header) = request.header.as_mut() {
                    header.peer = Some(leader);
                }
                continue;
            }

            // The rejected peer knows no leader; probe the rest of the
            // replica set.
            for peer in &region.peers {
                if peer.peer_id == origin_peer.peer_id {
                    continue;
                }
                match self.region_leader(region.region_id, peer).await {
                    Ok(Some(leader)) => {
                        if let Some(header) = request.header.as_mut() {
                            header.peer = Some(leader);
                        }
                        continue 'retry;
                    }
                    Ok(None) => {
                        tracing::info!(
                            region_id = region.region_id,
                            peer_id = peer.peer_id,
                            "peer knows no region leader"
                        );
                    }
                    Err(err) => {
                        tracing::error!(
                            region_id = region.region_id,
                            peer_id = peer.peer_id,
                            error = %err,
                            "region leader probe failed"
                        );
                    }
                }
            }

            // No leader discoverable; hand the rejection to the caller.
            return Ok(response);
        }

        Err(Error::SendCommand(region.region_id))
    }

    /// One framed command exchange with the node hosting the target peer.
    // TODO: route these calls through the node connection cache.
    async fn call_command(&self, request: &RaftCmdRequest) -> Result<RaftCmdResponse> {
        let node_id = request
            .header
            .as_ref()
            .and_then(|h| h.peer.as_ref())
            .map(|p| p.node_id)
            .ok_or_else(|| Error::Protocol("raft command without a target peer".to_string()))?;
        let node = self.get_node(node_id).await?;

        let stream = time::timeout(STORE_CONNECT_TIMEOUT, TcpStream::connect(&node.address))
            .await
            .map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to node {node_id} at {} timed out", node.address),
                ))
            })??;
        let mut framed = Framed::new(stream, FrameCodec::new());

        let message = StoreMessage {
            msg_type: MessageType::Command as i32,
            cmd_req: Some(request.clone()),
            cmd_resp: None,
        };
        io_deadline(framed.send(Frame::from_msg(next_msg_id(), &message))).await??;

        let frame = match io_deadline(framed.next()).await? {
            Some(frame) => frame?,
            None => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("node {node_id} closed the connection"),
                )))
            }
        };
        let reply: StoreMessage = frame.decode()?;
        reply
            .cmd_resp
            .ok_or_else(|| Error::Protocol("store reply without a command response".to_string()))
    }

    async fn region_leader(&self, region_id: u64, peer: &Peer) -> Result<Option<Peer>> {
        let request = status_request(region_id, peer, StatusCmdType::RegionLeader);
        let response = self.call_command(&request).await?;
        match response.status.and_then(|s| s.region_leader) {
            Some(leader_resp) => Ok(leader_resp.leader),
            None => Err(Error::Protocol(format!(
                "region {region_id} leader probe got no status response"
            ))),
        }
    }

    async fn region_detail(&self, region_id: u64, peer: &Peer) -> Result<RegionDetailResponse> {
        let request = status_request(region_id, peer, StatusCmdType::RegionDetail);
        let response = self.call_command(&request).await?;
        response
            .status
            .and_then(|s| s.region_detail)
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "region {region_id} detail probe got no status response"
                ))
            })
    }
}

fn status_request(region_id: u64, peer: &Peer, cmd: StatusCmdType) -> RaftCmdRequest {
    let status = match cmd {
        StatusCmdType::RegionLeader => StatusRequest {
            cmd_type: cmd as i32,
            region_leader: Some(RegionLeaderRequest {}),
            region_detail: None,
        },
        _ => StatusRequest {
            cmd_type: cmd as i32,
            region_leader: None,
            region_detail: Some(RegionDetailRequest {}),
        },
    };
    RaftCmdRequest {
        header: Some(RaftRequestHeader {
            uuid: Uuid::new_v4().as_bytes().to_vec(),
            region_id,
            peer: Some(peer.clone()),
        }),
        admin: None,
        status: Some(status),
    }
}

fn rejection_message(response: &RaftCmdResponse) -> Option<String> {
    response
        .header
        .as_ref()
        .and_then(|h| h.error.as_ref())
        .map(|e| e.message.clone())
}

/// Uniform random pick, best stores first.
fn choose_store(best: &[Store], same_node: &[Store]) -> Option<Store> {
    let pool = if best.is_empty() { same_node } else { best };
    if pool.is_empty() {
        return None;
    }
    let index = rand::thread_rng().gen_range(0..pool.len());
    Some(pool[index].clone())
}

/// Pick any non-leader peer for removal.
fn plan_remove_peer(region: &Region, leader: Option<&Peer>) -> Result<Peer> {
    if region.peers.len() <= 1 {
        return Err(Error::NoRemovablePeer(region.region_id));
    }
    let leader_id = leader.map(|p| p.peer_id).unwrap_or(0);
    region
        .peers
        .iter()
        .find(|p| p.peer_id != leader_id)
        .cloned()
        .ok_or(Error::NoRemovablePeer(region.region_id))
}

async fn io_deadline<T>(fut: impl std::future::Future<Output = T>) -> Result<T> {
    time::timeout(STORE_IO_TIMEOUT, fut).await.map_err(|_| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "storage node i/o deadline exceeded",
        ))
    })
}
