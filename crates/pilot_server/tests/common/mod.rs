//! Shared helpers for integration tests: an in-process driver and a mock
//! storage node speaking the framed command protocol.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use pilot_proto::codec::{Frame, FrameCodec};
use pilot_proto::meta::{Peer, Region};
use pilot_proto::raft::{
    AdminCmdType, ConfChangeType, MessageType, RaftCmdRequest, RaftCmdResponse,
    RaftResponseHeader, RegionDetailResponse, RegionLeaderResponse, StatusCmdType, StatusResponse,
    StoreError, StoreMessage,
};
use pilot_proto::rpc::{Request, RequestHeader, Response};
use pilot_server::{Config, MemStore, Server};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use uuid::Uuid;

pub const CLUSTER_ID: u64 = 1;

static TEST_MSG_ID: AtomicU64 = AtomicU64::new(0);

/// Start a driver on an ephemeral port and wait until it leads.
pub async fn start_server() -> (Arc<Server>, SocketAddr) {
    let cfg = Config {
        listen_addr: "127.0.0.1:0".to_string(),
        leader_lease_secs: 1,
        next_retry_delay_ms: 100,
        max_peer_count: 5,
        ..Config::default()
    };
    let server = Server::new(cfg, Arc::new(MemStore::new()));
    {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(err) = server.run().await {
                panic!("server exited with error: {err}");
            }
        });
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(addr) = server.local_addr() {
            if server.is_leader() {
                return (server, addr);
            }
        }
        assert!(Instant::now() < deadline, "server never became leader");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn request_header() -> RequestHeader {
    RequestHeader {
        uuid: Uuid::new_v4().as_bytes().to_vec(),
        cluster_id: CLUSTER_ID,
    }
}

pub async fn connect(addr: SocketAddr) -> Framed<TcpStream, FrameCodec> {
    let stream = TcpStream::connect(addr).await.expect("connect to driver");
    Framed::new(stream, FrameCodec::new())
}

/// One framed request/response exchange, asserting stream discipline.
pub async fn rpc(framed: &mut Framed<TcpStream, FrameCodec>, request: &Request) -> Response {
    let msg_id = TEST_MSG_ID.fetch_add(1, Ordering::Relaxed) + 1;
    framed
        .send(Frame::from_msg(msg_id, request))
        .await
        .expect("send request");
    let frame = framed
        .next()
        .await
        .expect("connection stayed open")
        .expect("read response");
    assert_eq!(frame.msg_id, msg_id);
    frame.decode().expect("decode response")
}

/// Region state shared by every mock storage node, the stand-in for what the
/// raft group would replicate.
#[derive(Clone, Default)]
pub struct MockCluster {
    state: Arc<Mutex<MockState>>,
    /// When set, the next admin command applies but reports an error, as if
    /// the response was lost after the raft group committed.
    fail_next_admin: Arc<AtomicBool>,
}

#[derive(Default)]
struct MockState {
    regions: HashMap<u64, Region>,
    leaders: HashMap<u64, Peer>,
    /// (store_id, region_id) -> peer hosted there.
    placements: HashMap<(u64, u64), Peer>,
}

impl MockCluster {
    pub fn new() -> MockCluster {
        MockCluster::default()
    }

    /// Seed a bootstrapped region onto the stores its peers name.
    pub fn add_region(&self, region: Region) {
        let mut state = self.state.lock().unwrap();
        for peer in &region.peers {
            state
                .placements
                .insert((peer.store_id, region.region_id), peer.clone());
        }
        state.regions.insert(region.region_id, region);
    }

    pub fn region(&self, region_id: u64) -> Option<Region> {
        self.state.lock().unwrap().regions.get(&region_id).cloned()
    }

    pub fn leader(&self, region_id: u64) -> Option<Peer> {
        self.state.lock().unwrap().leaders.get(&region_id).cloned()
    }

    pub fn peer_hosted(&self, store_id: u64, region_id: u64) -> bool {
        self.state
            .lock()
            .unwrap()
            .placements
            .contains_key(&(store_id, region_id))
    }

    pub fn fail_next_admin(&self) {
        self.fail_next_admin.store(true, Ordering::SeqCst);
    }

    fn propose(&self, store_ids: &[u64], request: &RaftCmdRequest) -> RaftCmdResponse {
        let Some(header) = request.header.as_ref() else {
            return error_response("request without header");
        };
        let region_id = header.region_id;
        let Some(peer) = header.peer.as_ref() else {
            return error_response("request without peer");
        };
        if !store_ids.contains(&peer.store_id) {
            return error_response(&format!("store {} is not on this node", peer.store_id));
        }

        let mut state = self.state.lock().unwrap();

        if let Some(status) = request.status.as_ref() {
            return handle_status(&state, region_id, status.cmd_type());
        }

        let Some(hosted) = state.placements.get(&(peer.store_id, region_id)).cloned() else {
            let mut response = error_response("region not found");
            if let Some(h) = response.header.as_mut() {
                if let Some(e) = h.error.as_mut() {
                    e.region_not_found = Some(pilot_proto::raft::RegionNotFound { region_id });
                }
            }
            return response;
        };

        if let Some(leader) = state.leaders.get(&region_id) {
            if leader.peer_id != hosted.peer_id {
                let mut response = error_response("peer is not leader");
                if let Some(h) = response.header.as_mut() {
                    if let Some(e) = h.error.as_mut() {
                        e.not_leader = Some(pilot_proto::raft::NotLeader {
                            region_id,
                            leader: Some(leader.clone()),
                        });
                    }
                }
                return response;
            }
        }

        let Some(admin) = request.admin.as_ref() else {
            return error_response("unsupported request");
        };
        let response = match admin.cmd_type() {
            AdminCmdType::ChangePeer => handle_change_peer(&mut state, region_id, admin),
            AdminCmdType::Split => handle_split(&mut state, region_id, admin),
            AdminCmdType::InvalidAdmin => error_response("invalid admin command"),
        };

        // The proposing peer is the leader from here on; the driver observes
        // this through status probes, it never assigns it.
        state.leaders.insert(region_id, hosted);

        if response
            .header
            .as_ref()
            .map_or(true, |h| h.error.is_none())
            && self.fail_next_admin.swap(false, Ordering::SeqCst)
        {
            return error_response("injected: response lost after commit");
        }
        response
    }
}

fn handle_status(state: &MockState, region_id: u64, cmd: StatusCmdType) -> RaftCmdResponse {
    match cmd {
        StatusCmdType::RegionLeader => RaftCmdResponse {
            header: Some(RaftResponseHeader::default()),
            admin: None,
            status: Some(StatusResponse {
                cmd_type: cmd as i32,
                region_leader: Some(RegionLeaderResponse {
                    leader: state.leaders.get(&region_id).cloned(),
                }),
                region_detail: None,
            }),
        },
        StatusCmdType::RegionDetail => match state.regions.get(&region_id) {
            Some(region) => RaftCmdResponse {
                header: Some(RaftResponseHeader::default()),
                admin: None,
                status: Some(StatusResponse {
                    cmd_type: cmd as i32,
                    region_leader: None,
                    region_detail: Some(RegionDetailResponse {
                        region: Some(region.clone()),
                        leader: state.leaders.get(&region_id).cloned(),
                    }),
                }),
            },
            None => error_response(&format!("region {region_id} not found")),
        },
        StatusCmdType::InvalidStatus => error_response("invalid status command"),
    }
}

fn handle_change_peer(
    state: &mut MockState,
    region_id: u64,
    admin: &pilot_proto::raft::AdminRequest,
) -> RaftCmdResponse {
    let Some(change) = admin.change_peer.as_ref() else {
        return error_response("change peer without a change");
    };
    let Some(peer) = change.peer.as_ref() else {
        return error_response("change peer without a peer");
    };
    let Some(region) = state.regions.get_mut(&region_id) else {
        return error_response("region not found");
    };

    match change.change_type() {
        ConfChangeType::AddReplica => {
            if region
                .peers
                .iter()
                .any(|p| p.peer_id == peer.peer_id || p.store_id == peer.store_id)
            {
                return error_response(&format!(
                    "add duplicated peer {} for region {region_id}",
                    peer.peer_id
                ));
            }
            region.peers.push(peer.clone());
            region.max_peer_id = region.max_peer_id.max(peer.peer_id);
            state
                .placements
                .insert((peer.store_id, region_id), peer.clone());
        }
        ConfChangeType::RemoveReplica => {
            let before = region.peers.len();
            region.peers.retain(|p| p.peer_id != peer.peer_id);
            if region.peers.len() == before {
                return error_response(&format!(
                    "remove missing peer {} for region {region_id}",
                    peer.peer_id
                ));
            }
            state.placements.remove(&(peer.store_id, region_id));
        }
    }

    let region = region.clone();
    RaftCmdResponse {
        header: Some(RaftResponseHeader::default()),
        admin: Some(pilot_proto::raft::AdminResponse {
            cmd_type: AdminCmdType::ChangePeer as i32,
            change_peer: Some(pilot_proto::raft::ChangePeerResponse {
                region: Some(region),
            }),
            split: None,
        }),
        status: None,
    }
}

fn handle_split(
    state: &mut MockState,
    region_id: u64,
    admin: &pilot_proto::raft::AdminRequest,
) -> RaftCmdResponse {
    let Some(split) = admin.split.as_ref() else {
        return error_response("split without a split");
    };
    let Some(region) = state.regions.get(&region_id).cloned() else {
        return error_response("region not found");
    };
    if split.new_peer_ids.len() != region.peers.len() {
        return error_response("split peer id count mismatch");
    }
    if !region.start_key.is_empty() && split.split_key <= region.start_key {
        return error_response("split key not above region start");
    }
    if !region.end_key.is_empty() && split.split_key >= region.end_key {
        return error_response("split key not below region end");
    }

    let mut right_peers = Vec::with_capacity(region.peers.len());
    let mut max_peer_id = 0;
    for (peer, new_id) in region.peers.iter().zip(&split.new_peer_ids) {
        max_peer_id = max_peer_id.max(*new_id);
        right_peers.push(Peer {
            peer_id: *new_id,
            node_id: peer.node_id,
            store_id: peer.store_id,
        });
    }
    let right = Region {
        region_id: split.new_region_id,
        start_key: split.split_key.clone(),
        end_key: region.end_key.clone(),
        max_peer_id,
        peers: right_peers,
    };

    let mut left = region;
    left.end_key = split.split_key.clone();

    for peer in &right.peers {
        state
            .placements
            .insert((peer.store_id, right.region_id), peer.clone());
    }
    state.regions.insert(left.region_id, left.clone());
    state.regions.insert(right.region_id, right.clone());

    RaftCmdResponse {
        header: Some(RaftResponseHeader::default()),
        admin: Some(pilot_proto::raft::AdminResponse {
            cmd_type: AdminCmdType::Split as i32,
            change_peer: None,
            split: Some(pilot_proto::raft::SplitResponse {
                left: Some(left),
                right: Some(right),
            }),
        }),
        status: None,
    }
}

fn error_response(message: &str) -> RaftCmdResponse {
    RaftCmdResponse {
        header: Some(RaftResponseHeader {
            uuid: vec![],
            error: Some(StoreError {
                message: message.to_string(),
                not_leader: None,
                region_not_found: None,
            }),
        }),
        admin: None,
        status: None,
    }
}

/// A mock storage node serving the framed command protocol for its stores.
pub struct MockNode {
    pub node_id: u64,
    pub addr: SocketAddr,
    pub store_ids: Vec<u64>,
}

pub async fn start_mock_node(cluster: MockCluster, node_id: u64, store_ids: Vec<u64>) -> MockNode {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock node");
    let addr = listener.local_addr().expect("mock node addr");
    let serve_stores = store_ids.clone();

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let cluster = cluster.clone();
            let store_ids = serve_stores.clone();
            tokio::spawn(async move {
                let mut framed = Framed::new(socket, FrameCodec::new());
                while let Some(Ok(frame)) = framed.next().await {
                    let Ok(message) = frame.decode::<StoreMessage>() else {
                        return;
                    };
                    let Some(cmd_req) = message.cmd_req else {
                        return;
                    };
                    let mut response = cluster.propose(&store_ids, &cmd_req);
                    if let Some(header) = response.header.as_mut() {
                        header.uuid = cmd_req
                            .header
                            .as_ref()
                            .map(|h| h.uuid.clone())
                            .unwrap_or_default();
                    }
                    let reply = StoreMessage {
                        msg_type: MessageType::CommandResp as i32,
                        cmd_req: None,
                        cmd_resp: Some(response),
                    };
                    if framed
                        .send(Frame::from_msg(frame.msg_id, &reply))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            });
        }
    });

    MockNode {
        node_id,
        addr,
        store_ids,
    }
}
