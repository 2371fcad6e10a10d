//! Error types for the placement driver.

use pilot_proto::codec::FrameError;
use thiserror::Error;

use crate::metastore::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// This process is not the elected leader.
    #[error("not the placement driver leader")]
    NotLeader,

    /// A leader-conditional write failed its compare: leadership moved while
    /// the operation was in flight.
    #[error("leadership lost during a meta store write")]
    LeaderLost,

    #[error("cluster is not bootstrapped")]
    ClusterNotBootstrapped,

    #[error("cluster is already bootstrapped")]
    ClusterBootstrapped,

    #[error("cluster id mismatch: got {got}, expected {expected}")]
    ClusterMismatch { got: u64, expected: u64 },

    #[error("no region found for key {}", crate::keys::display_key(.0))]
    RegionNotFound(Vec<u8>),

    #[error("node {0} not found")]
    NodeNotFound(u64),

    #[error("no store can take a new replica of region {0}")]
    NoStoreForPeer(u64),

    #[error("no removable replica in region {0}")]
    NoRemovablePeer(u64),

    /// The logical clock wrapped and never recovered within the retry budget.
    #[error("timestamp oracle exhausted its logical clock")]
    TsoExhausted,

    #[error("timestamp oracle is not ready")]
    TsoNotReady,

    #[error("send raft command to region {0} failed")]
    SendCommand(u64),

    /// A guarded transaction did not commit for a reason other than an
    /// explicit leader compare failure.
    #[error("meta store transaction failed: {0}")]
    Txn(&'static str),

    /// A message violated a protocol invariant. Logged and surfaced, never a
    /// panic.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("message decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
}
