//! Cluster-wide id allocation.
//!
//! Ids come out of a persisted window: the store holds the end of the last
//! reserved range, and the leader hands out ids from memory until the window
//! is empty, then reserves the next thousand with a guarded transaction.
//! A failover can skip ids but never reuse one.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::election::LeaderGate;
use crate::error::{Error, Result};
use crate::keys;
use crate::metastore::{Compare, MetaStore, TxnOp};

const ALLOC_STEP: u64 = 1000;

#[derive(Default)]
struct Window {
    next: u64,
    end: u64,
}

pub struct IdAllocator {
    store: Arc<dyn MetaStore>,
    gate: Arc<LeaderGate>,
    path: Vec<u8>,
    window: Mutex<Window>,
}

impl IdAllocator {
    pub fn new(store: Arc<dyn MetaStore>, gate: Arc<LeaderGate>, root: &str) -> IdAllocator {
        IdAllocator {
            store,
            gate,
            path: keys::alloc_id_key(root),
            window: Mutex::new(Window::default()),
        }
    }

    pub async fn alloc(&self) -> Result<u64> {
        let mut window = self.window.lock().await;
        if window.next == window.end {
            let end = self.reserve_window().await?;
            window.end = end;
            window.next = end - ALLOC_STEP;
        }
        window.next += 1;
        Ok(window.next)
    }

    async fn reserve_window(&self) -> Result<u64> {
        let current = self.store.get(&self.path).await?;
        let (guard, current_end) = match &current {
            None => (Compare::CreateRevisionEq(self.path.clone(), 0), 0),
            Some(kv) => {
                let bytes: [u8; 8] = kv.value.as_slice().try_into().map_err(|_| {
                    Error::Protocol(format!(
                        "id allocator record must be 8 bytes, got {}",
                        kv.value.len()
                    ))
                })?;
                (
                    Compare::ValueEq(self.path.clone(), kv.value.clone()),
                    u64::from_be_bytes(bytes),
                )
            }
        };

        let end = current_end + ALLOC_STEP;
        let committed = self
            .store
            .txn(
                vec![self.gate.leader_cmp()?, guard],
                vec![TxnOp::put(self.path.clone(), end.to_be_bytes().to_vec())],
            )
            .await?;
        if !committed {
            // Either leadership moved or another writer reserved concurrently;
            // both mean this process must not hand out ids from the window.
            return Err(Error::LeaderLost);
        }
        tracing::debug!(end, "reserved a new id window");
        Ok(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metastore::MemStore;
    use pilot_proto::meta::LeaderInfo;
    use std::time::Duration;

    async fn allocator() -> (Arc<LeaderGate>, IdAllocator) {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let gate = Arc::new(LeaderGate::new(
            store.clone(),
            "/pilot",
            Duration::from_secs(5),
        ));
        gate.campaign(&LeaderInfo {
            addr: "t".to_string(),
        })
        .await
        .unwrap();
        let alloc = IdAllocator::new(store, gate.clone(), "/pilot");
        (gate, alloc)
    }

    #[tokio::test]
    async fn ids_are_strictly_increasing_across_windows() {
        let (_gate, alloc) = allocator().await;
        let mut last = 0;
        for _ in 0..(ALLOC_STEP * 2 + 10) {
            let id = alloc.alloc().await.unwrap();
            assert!(id > last);
            last = id;
        }
    }

    #[tokio::test]
    async fn a_new_allocator_skips_the_reserved_window() {
        let (gate, alloc) = allocator().await;
        let first = alloc.alloc().await.unwrap();

        // A restarted allocator over the same store must not reuse anything.
        let restarted = IdAllocator::new(alloc.store.clone(), gate, "/pilot");
        let next = restarted.alloc().await.unwrap();
        assert!(next > first);
        assert!(next > ALLOC_STEP);
    }

    #[tokio::test]
    async fn non_leader_cannot_reserve() {
        let (gate, alloc) = allocator().await;
        gate.demote();
        assert!(matches!(alloc.alloc().await, Err(Error::NotLeader)));
    }
}
