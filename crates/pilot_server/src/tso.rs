//! The timestamp oracle.
//!
//! Safety invariant: for any two issued timestamps, the one returned first
//! compares lexicographically smaller on `(physical, logical)`, across
//! restarts and leader changes. The engine guarantees it by never issuing a
//! physical beyond the persisted checkpoint, and by syncing a new leader
//! strictly past any window a previous leader could still be serving.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pilot_proto::meta::Timestamp;

use crate::election::LeaderGate;
use crate::error::{Error, Result};
use crate::keys;
use crate::metastore::{MetaStore, TxnOp};

/// The tick task advances the in-memory physical every 10 ms.
pub const UPDATE_TIMESTAMP_STEP: Duration = Duration::from_millis(10);

const UPDATE_TIMESTAMP_STEP_MS: i64 = 10;
const MAX_LOGICAL: i64 = 1 << 18;
const MAX_ISSUE_RETRIES: usize = 100;
const LOGICAL_SATURATED_BACKOFF: Duration = Duration::from_millis(50);
const NOT_READY_BACKOFF: Duration = Duration::from_millis(200);

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

/// One physical window and its logical counter. Readers share the Arc and
/// bump the counter; the tick task swaps the whole slot.
struct TsoSlot {
    physical_ms: i64,
    logical: AtomicI64,
}

pub struct TsoEngine {
    store: Arc<dyn MetaStore>,
    gate: Arc<LeaderGate>,
    ts_path: Vec<u8>,
    slot: RwLock<Option<Arc<TsoSlot>>>,
    last_saved_ms: AtomicI64,
    lease_ms: i64,
}

impl TsoEngine {
    pub fn new(store: Arc<dyn MetaStore>, gate: Arc<LeaderGate>, root: &str) -> TsoEngine {
        let lease_ms = gate.lease_ttl().as_millis().min(i64::MAX as u128) as i64;
        TsoEngine {
            store,
            gate,
            ts_path: keys::timestamp_key(root),
            slot: RwLock::new(None),
            last_saved_ms: AtomicI64::new(0),
            lease_ms,
        }
    }

    async fn load_timestamp(&self) -> Result<i64> {
        let Some(kv) = self.store.get(&self.ts_path).await? else {
            return Ok(0);
        };
        let bytes: [u8; 8] = kv.value.as_slice().try_into().map_err(|_| {
            Error::Protocol(format!(
                "timestamp checkpoint must be 8 bytes, got {}",
                kv.value.len()
            ))
        })?;
        Ok(u64::from_be_bytes(bytes) as i64)
    }

    /// Persist `now` as the reservation upper bound, conditional on still
    /// holding leadership.
    async fn save_timestamp(&self, now: i64) -> Result<()> {
        let cmp = self.gate.leader_cmp()?;
        let committed = self
            .store
            .txn(
                vec![cmp],
                vec![TxnOp::put(
                    self.ts_path.clone(),
                    (now as u64).to_be_bytes().to_vec(),
                )],
            )
            .await?;
        if !committed {
            return Err(Error::LeaderLost);
        }
        self.last_saved_ms.store(now, Ordering::SeqCst);
        Ok(())
    }

    /// Bring the oracle up on a fresh leader.
    ///
    /// Waits until the wall clock is more than `2 * leader_lease` past the
    /// saved checkpoint: by then any previous leader's lease has expired and
    /// it can no longer issue timestamps, so everything we issue is strictly
    /// above anything already observable.
    pub async fn sync(&self) -> Result<()> {
        let last = self.load_timestamp().await?;
        let mut now = now_ms();
        loop {
            let since = now - last;
            if since <= 0 {
                tracing::warn!(
                    saved = last,
                    now,
                    "saved timestamp is ahead of the wall clock, waiting"
                );
                tokio::time::sleep(Duration::from_millis(100)).await;
                now = now_ms();
                continue;
            }
            let wait = 2 * self.lease_ms - since;
            if wait > 0 {
                tracing::warn!(
                    wait_ms = wait,
                    "waiting to guarantee the new leader's timestamps are valid"
                );
                tokio::time::sleep(Duration::from_millis(wait as u64)).await;
                now = now_ms();
                continue;
            }
            break;
        }

        self.save_timestamp(now).await?;
        *self.slot.write().unwrap() = Some(Arc::new(TsoSlot {
            physical_ms: now,
            logical: AtomicI64::new(0),
        }));
        tracing::debug!(physical = now, "timestamp synced and saved");
        Ok(())
    }

    /// One tick: advance the physical window to the wall clock, persisting a
    /// new checkpoint whenever the old one is within a lease of being
    /// overrun.
    pub async fn update(&self) -> Result<()> {
        let prev = self
            .slot
            .read()
            .unwrap()
            .clone()
            .ok_or(Error::TsoNotReady)?;
        let now = now_ms();
        let since = now - prev.physical_ms;
        if since > 2 * UPDATE_TIMESTAMP_STEP_MS {
            tracing::warn!(
                offset_ms = since,
                prev = prev.physical_ms,
                now,
                "clock offset larger than the update step"
            );
        }
        if since <= 0 {
            // Clock went backward; refuse to move and try again next tick.
            tracing::warn!(prev = prev.physical_ms, now, "wall clock did not advance");
            return Ok(());
        }

        if now - self.last_saved_ms.load(Ordering::SeqCst) > self.lease_ms {
            self.save_timestamp(now).await?;
        }

        *self.slot.write().unwrap() = Some(Arc::new(TsoSlot {
            physical_ms: now,
            logical: AtomicI64::new(0),
        }));
        Ok(())
    }

    /// Drop the in-memory window. Called on leadership loss so a stale
    /// process can never issue another timestamp.
    pub fn invalidate(&self) {
        *self.slot.write().unwrap() = None;
    }

    /// Issue `count` strictly increasing timestamps.
    pub async fn timestamps(&self, count: u32) -> Result<Vec<Timestamp>> {
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            out.push(self.next_ts().await?);
        }
        Ok(out)
    }

    async fn next_ts(&self) -> Result<Timestamp> {
        for _ in 0..MAX_ISSUE_RETRIES {
            let slot = self.slot.read().unwrap().clone();
            let Some(slot) = slot else {
                tracing::error!("timestamp oracle not synced yet, retrying");
                tokio::time::sleep(NOT_READY_BACKOFF).await;
                continue;
            };

            let logical = slot.logical.fetch_add(1, Ordering::SeqCst) + 1;
            if logical >= MAX_LOGICAL {
                tracing::error!(
                    physical = slot.physical_ms,
                    "logical clock saturated its physical window, check ntp"
                );
                tokio::time::sleep(LOGICAL_SATURATED_BACKOFF).await;
                continue;
            }
            return Ok(Timestamp {
                physical: slot.physical_ms,
                logical,
            });
        }
        Err(Error::TsoExhausted)
    }
}
