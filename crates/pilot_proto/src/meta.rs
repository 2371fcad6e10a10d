//! Cluster metadata records shared by the client, driver, and storage nodes.

/// A monotonically increasing hybrid timestamp.
///
/// Ordering is lexicographic on `(physical, logical)`; `physical` is
/// milliseconds since the Unix epoch.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Timestamp {
    #[prost(int64, tag = "1")]
    pub physical: i64,
    #[prost(int64, tag = "2")]
    pub logical: i64,
}

/// A physical machine running one or more stores.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Node {
    #[prost(uint64, tag = "1")]
    pub node_id: u64,
    #[prost(string, tag = "2")]
    pub address: String,
}

/// A storage container on a node.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Store {
    #[prost(uint64, tag = "1")]
    pub store_id: u64,
    #[prost(uint64, tag = "2")]
    pub node_id: u64,
}

/// One replica of a region, placed on a specific store.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Peer {
    #[prost(uint64, tag = "1")]
    pub peer_id: u64,
    #[prost(uint64, tag = "2")]
    pub node_id: u64,
    #[prost(uint64, tag = "3")]
    pub store_id: u64,
}

/// A contiguous key range `[start_key, end_key)` and its replica set.
///
/// An empty `end_key` means the range is unbounded on the right.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Region {
    #[prost(uint64, tag = "1")]
    pub region_id: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub start_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub end_key: Vec<u8>,
    #[prost(uint64, tag = "4")]
    pub max_peer_id: u64,
    #[prost(message, repeated, tag = "5")]
    pub peers: Vec<Peer>,
}

/// Cluster-wide settings persisted at bootstrap.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ClusterMeta {
    #[prost(uint64, tag = "1")]
    pub cluster_id: u64,
    #[prost(uint32, tag = "2")]
    pub max_peer_count: u32,
}

/// The record the elected placement driver publishes under the leader key.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LeaderInfo {
    #[prost(string, tag = "1")]
    pub addr: String,
}
