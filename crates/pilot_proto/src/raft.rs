//! Placement driver <-> storage node surface: raft admin commands, status
//! probes, and the durable job record that wraps a pending command.

use crate::meta::{Peer, Region};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    InvalidMessage = 0,
    Command = 1,
    CommandResp = 2,
}

/// Top-level envelope body on a storage-node connection.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StoreMessage {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub msg_type: i32,
    #[prost(message, optional, tag = "2")]
    pub cmd_req: Option<RaftCmdRequest>,
    #[prost(message, optional, tag = "3")]
    pub cmd_resp: Option<RaftCmdResponse>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RaftRequestHeader {
    #[prost(bytes = "vec", tag = "1")]
    pub uuid: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub region_id: u64,
    /// The peer the command is addressed to; rewritten when leadership moves.
    #[prost(message, optional, tag = "3")]
    pub peer: Option<Peer>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RaftResponseHeader {
    #[prost(bytes = "vec", tag = "1")]
    pub uuid: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub error: Option<StoreError>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StoreError {
    #[prost(string, tag = "1")]
    pub message: String,
    #[prost(message, optional, tag = "2")]
    pub not_leader: Option<NotLeader>,
    #[prost(message, optional, tag = "3")]
    pub region_not_found: Option<RegionNotFound>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NotLeader {
    #[prost(uint64, tag = "1")]
    pub region_id: u64,
    /// The leader the rejected peer knows about, when it knows one.
    #[prost(message, optional, tag = "2")]
    pub leader: Option<Peer>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RegionNotFound {
    #[prost(uint64, tag = "1")]
    pub region_id: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum AdminCmdType {
    InvalidAdmin = 0,
    ChangePeer = 1,
    Split = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ConfChangeType {
    AddReplica = 0,
    RemoveReplica = 1,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChangePeerRequest {
    #[prost(enumeration = "ConfChangeType", tag = "1")]
    pub change_type: i32,
    #[prost(message, optional, tag = "2")]
    pub peer: Option<Peer>,
    #[prost(message, optional, tag = "3")]
    pub region: Option<Region>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChangePeerResponse {
    /// The region after the membership change applied.
    #[prost(message, optional, tag = "1")]
    pub region: Option<Region>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SplitRequest {
    #[prost(uint64, tag = "1")]
    pub new_region_id: u64,
    /// One fresh peer id per existing replica slot, in peer order.
    #[prost(uint64, repeated, tag = "2")]
    pub new_peer_ids: Vec<u64>,
    #[prost(bytes = "vec", tag = "3")]
    pub split_key: Vec<u8>,
    #[prost(message, optional, tag = "4")]
    pub region: Option<Region>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SplitResponse {
    #[prost(message, optional, tag = "1")]
    pub left: Option<Region>,
    #[prost(message, optional, tag = "2")]
    pub right: Option<Region>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AdminRequest {
    #[prost(enumeration = "AdminCmdType", tag = "1")]
    pub cmd_type: i32,
    #[prost(message, optional, tag = "2")]
    pub change_peer: Option<ChangePeerRequest>,
    #[prost(message, optional, tag = "3")]
    pub split: Option<SplitRequest>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AdminResponse {
    #[prost(enumeration = "AdminCmdType", tag = "1")]
    pub cmd_type: i32,
    #[prost(message, optional, tag = "2")]
    pub change_peer: Option<ChangePeerResponse>,
    #[prost(message, optional, tag = "3")]
    pub split: Option<SplitResponse>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum StatusCmdType {
    InvalidStatus = 0,
    RegionLeader = 1,
    RegionDetail = 2,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RegionLeaderRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RegionLeaderResponse {
    #[prost(message, optional, tag = "1")]
    pub leader: Option<Peer>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RegionDetailRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RegionDetailResponse {
    #[prost(message, optional, tag = "1")]
    pub region: Option<Region>,
    #[prost(message, optional, tag = "2")]
    pub leader: Option<Peer>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StatusRequest {
    #[prost(enumeration = "StatusCmdType", tag = "1")]
    pub cmd_type: i32,
    #[prost(message, optional, tag = "2")]
    pub region_leader: Option<RegionLeaderRequest>,
    #[prost(message, optional, tag = "3")]
    pub region_detail: Option<RegionDetailRequest>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StatusResponse {
    #[prost(enumeration = "StatusCmdType", tag = "1")]
    pub cmd_type: i32,
    #[prost(message, optional, tag = "2")]
    pub region_leader: Option<RegionLeaderResponse>,
    #[prost(message, optional, tag = "3")]
    pub region_detail: Option<RegionDetailResponse>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RaftCmdRequest {
    #[prost(message, optional, tag = "1")]
    pub header: Option<RaftRequestHeader>,
    #[prost(message, optional, tag = "2")]
    pub admin: Option<AdminRequest>,
    #[prost(message, optional, tag = "3")]
    pub status: Option<StatusRequest>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RaftCmdResponse {
    #[prost(message, optional, tag = "1")]
    pub header: Option<RaftResponseHeader>,
    #[prost(message, optional, tag = "2")]
    pub admin: Option<AdminResponse>,
    #[prost(message, optional, tag = "3")]
    pub status: Option<StatusResponse>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum JobStatus {
    Pending = 0,
    Running = 1,
}

/// A durably queued coordination command awaiting execution by the leader.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Job {
    #[prost(uint64, tag = "1")]
    pub job_id: u64,
    #[prost(enumeration = "JobStatus", tag = "2")]
    pub status: i32,
    #[prost(message, optional, tag = "3")]
    pub request: Option<RaftCmdRequest>,
}
