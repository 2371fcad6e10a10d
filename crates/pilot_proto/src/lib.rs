//! Wire protocol for the shardpilot placement driver.
//!
//! Every message on the wire is a 16-byte framed envelope ([`codec`]) around a
//! protobuf body. The message types are hand-written `prost` structs split by
//! audience: [`meta`] for the shared metadata records, [`rpc`] for the
//! client <-> driver command surface, and [`raft`] for the driver <->
//! storage-node admin/status surface.

pub mod codec;
pub mod meta;
pub mod raft;
pub mod rpc;

pub use codec::{Frame, FrameCodec, FrameError};
