//! Lease-based single-active-leader guard.
//!
//! A campaign is one guarded transaction: create the leader key, attached to
//! a fresh lease, iff it does not exist. The winner remembers the key's
//! create revision; every subsequent driver write carries a compare against
//! that revision, so losing the lease converts any in-flight write into a
//! failed transaction with no side effects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pilot_proto::meta::LeaderInfo;
use prost::Message;

use crate::error::{Error, Result};
use crate::keys;
use crate::metastore::{Compare, LeaseId, MetaStore, Revision, TxnOp};

#[derive(Clone, Copy)]
struct Leadership {
    lease: LeaseId,
    revision: Revision,
}

pub struct LeaderGate {
    store: Arc<dyn MetaStore>,
    leader_path: Vec<u8>,
    lease_ttl: Duration,
    state: Mutex<Option<Leadership>>,
    is_leader: AtomicBool,
}

impl LeaderGate {
    pub fn new(store: Arc<dyn MetaStore>, root: &str, lease_ttl: Duration) -> LeaderGate {
        LeaderGate {
            store,
            leader_path: keys::leader_key(root),
            lease_ttl,
            state: Mutex::new(None),
            is_leader: AtomicBool::new(false),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// The compare every leader-conditional write must carry.
    pub fn leader_cmp(&self) -> Result<Compare> {
        let state = self.state.lock().unwrap();
        match *state {
            Some(leadership) => Ok(Compare::CreateRevisionEq(
                self.leader_path.clone(),
                leadership.revision,
            )),
            None => Err(Error::NotLeader),
        }
    }

    /// Try to take leadership. Returns false when another driver holds it.
    pub async fn campaign(&self, info: &LeaderInfo) -> Result<bool> {
        let lease = self.store.lease_grant(self.lease_ttl).await?;
        let won = self
            .store
            .txn(
                vec![Compare::CreateRevisionEq(self.leader_path.clone(), 0)],
                vec![TxnOp::put_with_lease(
                    self.leader_path.clone(),
                    info.encode_to_vec(),
                    lease,
                )],
            )
            .await?;
        if !won {
            if let Err(err) = self.store.lease_revoke(lease).await {
                tracing::debug!(error = %err, "failed to revoke losing campaign lease");
            }
            return Ok(false);
        }

        let kv = self
            .store
            .get(&self.leader_path)
            .await?
            .ok_or_else(|| Error::Protocol("leader key vanished after campaign".to_string()))?;
        *self.state.lock().unwrap() = Some(Leadership {
            lease,
            revision: kv.create_revision,
        });
        self.is_leader.store(true, Ordering::SeqCst);
        Ok(true)
    }

    /// Refresh the election lease. Returns false (and demotes) when the
    /// lease has already expired.
    pub async fn keep_alive_once(&self) -> Result<bool> {
        let lease = {
            let state = self.state.lock().unwrap();
            match *state {
                Some(leadership) => leadership.lease,
                None => return Err(Error::NotLeader),
            }
        };
        let alive = self.store.lease_keep_alive(lease).await?;
        if !alive {
            self.demote();
        }
        Ok(alive)
    }

    /// Drop the in-memory claim to leadership without touching the store.
    pub fn demote(&self) {
        self.is_leader.store(false, Ordering::SeqCst);
        *self.state.lock().unwrap() = None;
    }

    /// Give up leadership and release the lease so a successor can campaign
    /// without waiting for expiry.
    pub async fn resign(&self) {
        let state = self.state.lock().unwrap().take();
        self.is_leader.store(false, Ordering::SeqCst);
        if let Some(leadership) = state {
            if let Err(err) = self.store.lease_revoke(leadership.lease).await {
                tracing::debug!(error = %err, "failed to revoke leadership lease");
            }
        }
    }

    /// Read the currently published leader record, if any.
    pub async fn current_leader(&self) -> Result<Option<LeaderInfo>> {
        match self.store.get(&self.leader_path).await? {
            Some(kv) => Ok(Some(LeaderInfo::decode(kv.value.as_slice())?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metastore::MemStore;

    fn gate(store: &Arc<MemStore>, ttl: Duration) -> LeaderGate {
        let store: Arc<dyn MetaStore> = store.clone();
        LeaderGate::new(store, "/pilot", ttl)
    }

    #[tokio::test]
    async fn only_one_campaign_wins() {
        let store = Arc::new(MemStore::new());
        let first = gate(&store, Duration::from_secs(5));
        let second = gate(&store, Duration::from_secs(5));

        let info = LeaderInfo {
            addr: "127.0.0.1:1162".to_string(),
        };
        assert!(first.campaign(&info).await.unwrap());
        assert!(!second.campaign(&info).await.unwrap());
        assert!(first.is_leader());
        assert!(!second.is_leader());

        let published = second.current_leader().await.unwrap().unwrap();
        assert_eq!(published.addr, "127.0.0.1:1162");
    }

    #[tokio::test]
    async fn resign_lets_a_successor_win() {
        let store = Arc::new(MemStore::new());
        let first = gate(&store, Duration::from_secs(5));
        let second = gate(&store, Duration::from_secs(5));

        let info = LeaderInfo {
            addr: "a".to_string(),
        };
        assert!(first.campaign(&info).await.unwrap());
        first.resign().await;
        assert!(second.campaign(&info).await.unwrap());
        assert!(first.leader_cmp().is_err());
    }

    #[tokio::test]
    async fn expired_lease_fails_leader_conditional_writes() {
        let store = Arc::new(MemStore::new());
        let first = gate(&store, Duration::from_millis(30));

        let info = LeaderInfo {
            addr: "a".to_string(),
        };
        assert!(first.campaign(&info).await.unwrap());
        let cmp = first.leader_cmp().unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        // The leader key is gone with the lease, so the stale compare fails.
        let committed = store
            .txn(vec![cmp], vec![TxnOp::put(b"x".to_vec(), b"1".to_vec())])
            .await
            .unwrap();
        assert!(!committed);
        assert!(!first.keep_alive_once().await.unwrap());
        assert!(!first.is_leader());
    }
}
