//! The consensus-backed key-value store the driver coordinates through.
//!
//! The driver only needs a narrow slice of an etcd-style store: linearizable
//! point reads, ascending limited range scans, guarded transactions, and
//! leases for leader election. [`MetaStore`] captures exactly that slice so
//! any equivalent linearizable KV can sit behind it; [`MemStore`] is the
//! in-process implementation used by the single-binary deployment and the
//! test suites.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

pub type LeaseId = i64;
pub type Revision = i64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("meta store operation timed out")]
    Timeout,
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),
}

/// A stored key with its revision bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub create_revision: Revision,
    pub mod_revision: Revision,
}

/// Guard evaluated before a transaction's operations apply.
///
/// `create_revision(key)` is 0 for an absent key, matching etcd semantics.
#[derive(Clone, Debug)]
pub enum Compare {
    CreateRevisionEq(Vec<u8>, Revision),
    CreateRevisionGt(Vec<u8>, Revision),
    ValueEq(Vec<u8>, Vec<u8>),
}

#[derive(Clone, Debug)]
pub enum TxnOp {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    },
    Delete {
        key: Vec<u8>,
    },
}

impl TxnOp {
    pub fn put(key: Vec<u8>, value: Vec<u8>) -> TxnOp {
        TxnOp::Put {
            key,
            value,
            lease: None,
        }
    }

    pub fn put_with_lease(key: Vec<u8>, value: Vec<u8>, lease: LeaseId) -> TxnOp {
        TxnOp::Put {
            key,
            value,
            lease: Some(lease),
        }
    }

    pub fn delete(key: Vec<u8>) -> TxnOp {
        TxnOp::Delete { key }
    }
}

#[async_trait]
pub trait MetaStore: Send + Sync + 'static {
    async fn get(&self, key: &[u8]) -> Result<Option<KeyValue>, StoreError>;

    /// Ascending scan of `[start, end)` returning at most `limit` entries.
    async fn range(&self, start: &[u8], end: &[u8], limit: usize)
        -> Result<Vec<KeyValue>, StoreError>;

    /// Atomically apply `ops` iff every compare holds. Returns whether the
    /// transaction committed.
    async fn txn(&self, cmps: Vec<Compare>, ops: Vec<TxnOp>) -> Result<bool, StoreError>;

    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError>;

    async fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId, StoreError>;

    /// Refresh a lease. Returns false when the lease has already expired.
    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<bool, StoreError>;

    async fn lease_revoke(&self, lease: LeaseId) -> Result<(), StoreError>;

    /// First entry of an ascending scan, the directory's lookup primitive.
    async fn range_first(&self, start: &[u8], end: &[u8]) -> Result<Option<KeyValue>, StoreError> {
        Ok(self.range(start, end, 1).await?.into_iter().next())
    }
}

struct Entry {
    value: Vec<u8>,
    create_revision: Revision,
    mod_revision: Revision,
    lease: Option<LeaseId>,
}

struct Lease {
    expires_at: Instant,
    ttl: Duration,
}

#[derive(Default)]
struct Inner {
    kvs: BTreeMap<Vec<u8>, Entry>,
    leases: HashMap<LeaseId, Lease>,
    revision: Revision,
    next_lease: LeaseId,
}

/// In-memory revisioned store with expiring leases.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }
}

impl Inner {
    /// Drop expired leases and every key attached to them. Runs before any
    /// operation observes state so expiry is never visible late.
    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return;
        }
        for id in &expired {
            self.leases.remove(id);
        }
        self.kvs
            .retain(|_, entry| entry.lease.map_or(true, |id| !expired.contains(&id)));
    }

    fn create_revision(&self, key: &[u8]) -> Revision {
        self.kvs.get(key).map_or(0, |entry| entry.create_revision)
    }

    fn check(&self, cmp: &Compare) -> bool {
        match cmp {
            Compare::CreateRevisionEq(key, rev) => self.create_revision(key) == *rev,
            Compare::CreateRevisionGt(key, rev) => self.create_revision(key) > *rev,
            Compare::ValueEq(key, value) => {
                self.kvs.get(key.as_slice()).map(|e| &e.value) == Some(value)
            }
        }
    }

    fn apply(&mut self, op: TxnOp, revision: Revision) {
        match op {
            TxnOp::Put { key, value, lease } => match self.kvs.get_mut(&key) {
                Some(entry) => {
                    entry.value = value;
                    entry.mod_revision = revision;
                    entry.lease = lease.or(entry.lease);
                }
                None => {
                    self.kvs.insert(
                        key,
                        Entry {
                            value,
                            create_revision: revision,
                            mod_revision: revision,
                            lease,
                        },
                    );
                }
            },
            TxnOp::Delete { key } => {
                self.kvs.remove(&key);
            }
        }
    }

    fn key_value(&self, key: &[u8]) -> Option<KeyValue> {
        self.kvs.get(key).map(|entry| KeyValue {
            key: key.to_vec(),
            value: entry.value.clone(),
            create_revision: entry.create_revision,
            mod_revision: entry.mod_revision,
        })
    }
}

#[async_trait]
impl MetaStore for MemStore {
    async fn get(&self, key: &[u8]) -> Result<Option<KeyValue>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge_expired(Instant::now());
        Ok(inner.key_value(key))
    }

    async fn range(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<KeyValue>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge_expired(Instant::now());
        let entries = inner
            .kvs
            .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
            .take(limit)
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
                create_revision: entry.create_revision,
                mod_revision: entry.mod_revision,
            })
            .collect();
        Ok(entries)
    }

    async fn txn(&self, cmps: Vec<Compare>, ops: Vec<TxnOp>) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge_expired(Instant::now());
        if !cmps.iter().all(|cmp| inner.check(cmp)) {
            return Ok(false);
        }
        inner.revision += 1;
        let revision = inner.revision;
        for op in ops {
            inner.apply(op, revision);
        }
        Ok(true)
    }

    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge_expired(Instant::now());
        inner.revision += 1;
        let revision = inner.revision;
        inner.apply(TxnOp::put(key.to_vec(), value), revision);
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge_expired(Instant::now());
        inner.revision += 1;
        let revision = inner.revision;
        inner.apply(TxnOp::delete(key.to_vec()), revision);
        Ok(())
    }

    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge_expired(Instant::now());
        inner.next_lease += 1;
        let id = inner.next_lease;
        inner.leases.insert(
            id,
            Lease {
                expires_at: Instant::now() + ttl,
                ttl,
            },
        );
        Ok(id)
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge_expired(Instant::now());
        match inner.leases.get_mut(&lease) {
            Some(rec) => {
                rec.expires_at = Instant::now() + rec.ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn lease_revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge_expired(Instant::now());
        if inner.leases.remove(&lease).is_none() {
            return Err(StoreError::LeaseNotFound(lease));
        }
        inner
            .kvs
            .retain(|_, entry| entry.lease.map_or(true, |id| id != lease));
        Ok(())
    }
}
