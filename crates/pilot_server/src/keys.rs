//! Key layout under the configured root path.
//!
//! Everything the driver persists lives below `<root>`:
//!
//! ```text
//! <root>/leader
//! <root>/timestamp
//! <root>/alloc_id
//! <root>/cluster/meta
//! <root>/cluster/nodes/<node_id>
//! <root>/cluster/stores/<store_id>
//! <root>/cluster/regions/region/<region_id>
//! <root>/cluster/regions/region_search/<encoded_end_key>
//! <root>/jobs/<job_id>
//! ```
//!
//! Numeric path segments are 20-digit zero-padded decimals so that
//! lexicographic ascending order equals numeric order.

pub fn leader_key(root: &str) -> Vec<u8> {
    format!("{root}/leader").into_bytes()
}

pub fn timestamp_key(root: &str) -> Vec<u8> {
    format!("{root}/timestamp").into_bytes()
}

pub fn alloc_id_key(root: &str) -> Vec<u8> {
    format!("{root}/alloc_id").into_bytes()
}

pub fn cluster_meta_key(root: &str) -> Vec<u8> {
    format!("{root}/cluster/meta").into_bytes()
}

pub fn node_key(root: &str, node_id: u64) -> Vec<u8> {
    format!("{root}/cluster/nodes/{node_id:020}").into_bytes()
}

pub fn node_prefix(root: &str) -> Vec<u8> {
    format!("{root}/cluster/nodes/").into_bytes()
}

pub fn store_key(root: &str, store_id: u64) -> Vec<u8> {
    format!("{root}/cluster/stores/{store_id:020}").into_bytes()
}

pub fn store_prefix(root: &str) -> Vec<u8> {
    format!("{root}/cluster/stores/").into_bytes()
}

pub fn region_key(root: &str, region_id: u64) -> Vec<u8> {
    format!("{root}/cluster/regions/region/{region_id:020}").into_bytes()
}

pub fn region_search_prefix(root: &str) -> Vec<u8> {
    format!("{root}/cluster/regions/region_search/").into_bytes()
}

pub fn region_search_key(root: &str, encoded_end_key: &[u8]) -> Vec<u8> {
    let mut key = region_search_prefix(root);
    key.extend_from_slice(encoded_end_key);
    key
}

pub fn job_key(root: &str, job_id: u64) -> Vec<u8> {
    format!("{root}/jobs/{job_id:020}").into_bytes()
}

pub fn job_prefix(root: &str) -> Vec<u8> {
    format!("{root}/jobs/").into_bytes()
}

/// Order-preserving encoding for region end keys.
///
/// Non-empty keys are prefixed with `0x01`; the empty end key (the unbounded
/// rightmost region) encodes as `0xff` so it sorts after every bounded one.
pub fn encode_end_key(end_key: &[u8]) -> Vec<u8> {
    if end_key.is_empty() {
        return vec![0xff];
    }
    let mut encoded = Vec::with_capacity(end_key.len() + 1);
    encoded.push(0x01);
    encoded.extend_from_slice(end_key);
    encoded
}

/// Start of the directory scan for the region covering `key`: the smallest
/// encoded end key strictly greater than `key`, so a region whose end equals
/// `key` (which does not contain it) is skipped.
pub fn encode_search_start(key: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(key.len() + 2);
    encoded.push(0x01);
    encoded.extend_from_slice(key);
    encoded.push(0x00);
    encoded
}

/// Exclusive upper bound covering every key that starts with `prefix`,
/// mirroring the range-end convention of etcd-style stores.
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // All 0xff: scan to the end of the keyspace.
    vec![0xff; prefix.len() + 1]
}

pub(crate) fn display_key(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(s) => format!("{s:?}"),
        Err(_) => format!("0x{}", hex(key)),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
