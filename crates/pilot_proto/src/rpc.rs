//! Client <-> placement driver command surface.
//!
//! Every request carries a [`RequestHeader`]; every response echoes the
//! request uuid and reports failures through [`ResponseHeader::error`].

use crate::meta::{Node, Region, Store, Timestamp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum CmdType {
    Invalid = 0,
    Tso = 1,
    Bootstrap = 2,
    IsBootstrapped = 3,
    GetMeta = 4,
    AskChangePeer = 5,
    AskSplit = 6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MetaType {
    InvalidMeta = 0,
    RegionType = 1,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RequestHeader {
    /// 16 random bytes chosen by the client, echoed in the response.
    #[prost(bytes = "vec", tag = "1")]
    pub uuid: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub cluster_id: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ResponseHeader {
    #[prost(bytes = "vec", tag = "1")]
    pub uuid: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub error: Option<ErrorDetail>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ErrorDetail {
    #[prost(string, tag = "1")]
    pub message: String,
    /// Present when a bootstrap attempt hit an already-bootstrapped cluster.
    #[prost(message, optional, tag = "2")]
    pub bootstrapped: Option<AlreadyBootstrapped>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AlreadyBootstrapped {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TsoRequest {
    /// Number of timestamps to issue in this round trip.
    #[prost(uint32, tag = "1")]
    pub count: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TsoResponse {
    /// Exactly `count` timestamps, strictly increasing in request order.
    #[prost(message, repeated, tag = "1")]
    pub timestamps: Vec<Timestamp>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BootstrapRequest {
    #[prost(message, optional, tag = "1")]
    pub node: Option<Node>,
    #[prost(message, repeated, tag = "2")]
    pub stores: Vec<Store>,
    #[prost(message, optional, tag = "3")]
    pub region: Option<Region>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BootstrapResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct IsBootstrappedRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct IsBootstrappedResponse {
    #[prost(bool, tag = "1")]
    pub bootstrapped: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetMetaRequest {
    #[prost(enumeration = "MetaType", tag = "1")]
    pub meta_type: i32,
    /// Lookup key for `MetaType::RegionType`.
    #[prost(bytes = "vec", tag = "2")]
    pub region_key: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetMetaResponse {
    #[prost(enumeration = "MetaType", tag = "1")]
    pub meta_type: i32,
    #[prost(message, optional, tag = "2")]
    pub region: Option<Region>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AskChangePeerRequest {
    #[prost(message, optional, tag = "1")]
    pub leader: Option<crate::meta::Peer>,
    #[prost(message, optional, tag = "2")]
    pub region: Option<Region>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AskChangePeerResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AskSplitRequest {
    #[prost(message, optional, tag = "1")]
    pub region: Option<Region>,
    #[prost(message, optional, tag = "2")]
    pub leader: Option<crate::meta::Peer>,
    #[prost(bytes = "vec", tag = "3")]
    pub split_key: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AskSplitResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Request {
    #[prost(message, optional, tag = "1")]
    pub header: Option<RequestHeader>,
    #[prost(enumeration = "CmdType", tag = "2")]
    pub cmd_type: i32,
    #[prost(message, optional, tag = "3")]
    pub tso: Option<TsoRequest>,
    #[prost(message, optional, tag = "4")]
    pub bootstrap: Option<BootstrapRequest>,
    #[prost(message, optional, tag = "5")]
    pub is_bootstrapped: Option<IsBootstrappedRequest>,
    #[prost(message, optional, tag = "6")]
    pub get_meta: Option<GetMetaRequest>,
    #[prost(message, optional, tag = "7")]
    pub ask_change_peer: Option<AskChangePeerRequest>,
    #[prost(message, optional, tag = "8")]
    pub ask_split: Option<AskSplitRequest>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Response {
    #[prost(message, optional, tag = "1")]
    pub header: Option<ResponseHeader>,
    #[prost(enumeration = "CmdType", tag = "2")]
    pub cmd_type: i32,
    #[prost(message, optional, tag = "3")]
    pub tso: Option<TsoResponse>,
    #[prost(message, optional, tag = "4")]
    pub bootstrap: Option<BootstrapResponse>,
    #[prost(message, optional, tag = "5")]
    pub is_bootstrapped: Option<IsBootstrappedResponse>,
    #[prost(message, optional, tag = "6")]
    pub get_meta: Option<GetMetaResponse>,
    #[prost(message, optional, tag = "7")]
    pub ask_change_peer: Option<AskChangePeerResponse>,
    #[prost(message, optional, tag = "8")]
    pub ask_split: Option<AskSplitResponse>,
}
