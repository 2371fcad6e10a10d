//! Cluster metadata: the node/store tables, the region directory, and
//! bootstrap.
//!
//! The source of truth is always the consensus KV; the in-memory tables are
//! flat id-keyed caches rebuilt at load and kept in step by the same writes
//! that persist.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use pilot_proto::meta::{ClusterMeta, Node, Region, Store};
use pilot_proto::rpc::BootstrapRequest;
use prost::Message;
use tokio::sync::mpsc;

use crate::election::LeaderGate;
use crate::error::{Error, Result};
use crate::id_alloc::IdAllocator;
use crate::keys;
use crate::metastore::{Compare, MetaStore, TxnOp};
use crate::node_conn::NodeConns;

/// How many nodes/stores a load scan fetches per round.
const LOAD_BATCH: usize = 1024;

#[derive(Default)]
struct Tables {
    nodes: HashMap<u64, Node>,
    stores: HashMap<u64, Store>,
}

pub struct Cluster {
    pub(crate) cluster_id: u64,
    pub(crate) root: String,
    pub(crate) store: Arc<dyn MetaStore>,
    pub(crate) gate: Arc<LeaderGate>,
    pub(crate) alloc: Arc<IdAllocator>,
    tables: RwLock<Tables>,
    ask_job_tx: mpsc::Sender<()>,
    pub(crate) conns: NodeConns,
}

impl Cluster {
    /// Load an existing cluster from the store. Returns `None` when nothing
    /// has been bootstrapped under this root yet.
    pub async fn load(
        root: &str,
        store: Arc<dyn MetaStore>,
        gate: Arc<LeaderGate>,
        alloc: Arc<IdAllocator>,
    ) -> Result<Option<(Arc<Cluster>, mpsc::Receiver<()>)>> {
        let Some(kv) = store.get(&keys::cluster_meta_key(root)).await? else {
            return Ok(None);
        };
        let meta = ClusterMeta::decode(kv.value.as_slice())?;

        // Job pulses collapse: one queued nudge is as good as many.
        let (ask_job_tx, ask_job_rx) = mpsc::channel(1);
        let cluster = Arc::new(Cluster {
            cluster_id: meta.cluster_id,
            root: root.to_string(),
            store,
            gate,
            alloc,
            tables: RwLock::new(Tables::default()),
            ask_job_tx,
            conns: NodeConns::new(),
        });
        cluster.reload_tables().await?;
        Ok(Some((cluster, ask_job_rx)))
    }

    /// Create the cluster in one guarded transaction: meta, the first node,
    /// its stores, and the initial full-keyspace region.
    pub async fn bootstrap(
        root: &str,
        store: &Arc<dyn MetaStore>,
        gate: &LeaderGate,
        meta: ClusterMeta,
        req: &BootstrapRequest,
    ) -> Result<()> {
        let node = req
            .node
            .as_ref()
            .ok_or_else(|| Error::Protocol("bootstrap request without a node".to_string()))?;
        let region = req
            .region
            .as_ref()
            .ok_or_else(|| Error::Protocol("bootstrap request without a region".to_string()))?;
        if req.stores.is_empty() {
            return Err(Error::Protocol(
                "bootstrap request without stores".to_string(),
            ));
        }
        for peer in &region.peers {
            if !req.stores.iter().any(|s| s.store_id == peer.store_id) {
                return Err(Error::Protocol(format!(
                    "bootstrap region peer {} references unknown store {}",
                    peer.peer_id, peer.store_id
                )));
            }
        }

        let meta_key = keys::cluster_meta_key(root);
        let encoded_end = keys::encode_end_key(&region.end_key);
        let mut ops = vec![
            TxnOp::put(meta_key.clone(), meta.encode_to_vec()),
            TxnOp::put(keys::node_key(root, node.node_id), node.encode_to_vec()),
            TxnOp::put(keys::region_key(root, region.region_id), encoded_end.clone()),
            TxnOp::put(
                keys::region_search_key(root, &encoded_end),
                region.encode_to_vec(),
            ),
        ];
        for s in &req.stores {
            ops.push(TxnOp::put(keys::store_key(root, s.store_id), s.encode_to_vec()));
        }

        let committed = store
            .txn(
                vec![
                    gate.leader_cmp()?,
                    Compare::CreateRevisionEq(meta_key.clone(), 0),
                ],
                ops,
            )
            .await?;
        if !committed {
            if store.get(&meta_key).await?.is_some() {
                return Err(Error::ClusterBootstrapped);
            }
            return Err(Error::LeaderLost);
        }
        tracing::info!(
            cluster_id = meta.cluster_id,
            node_id = node.node_id,
            region_id = region.region_id,
            "bootstrapped cluster"
        );
        Ok(())
    }

    /// Rebuild the node/store tables from the persisted records.
    pub async fn reload_tables(&self) -> Result<()> {
        let mut tables = Tables::default();

        let mut start = keys::node_prefix(&self.root);
        let end = keys::prefix_range_end(&start);
        loop {
            let batch = self.store.range(&start, &end, LOAD_BATCH).await?;
            let done = batch.len() < LOAD_BATCH;
            for kv in &batch {
                let node = Node::decode(kv.value.as_slice())?;
                tables.nodes.insert(node.node_id, node);
            }
            match batch.last() {
                Some(kv) if !done => {
                    start = kv.key.clone();
                    start.push(0x00);
                }
                _ => break,
            }
        }

        let mut start = keys::store_prefix(&self.root);
        let end = keys::prefix_range_end(&start);
        loop {
            let batch = self.store.range(&start, &end, LOAD_BATCH).await?;
            let done = batch.len() < LOAD_BATCH;
            for kv in &batch {
                let s = Store::decode(kv.value.as_slice())?;
                tables.stores.insert(s.store_id, s);
            }
            match batch.last() {
                Some(kv) if !done => {
                    start = kv.key.clone();
                    start.push(0x00);
                }
                _ => break,
            }
        }

        let mut guard = self.tables.write().unwrap();
        *guard = tables;
        Ok(())
    }

    pub async fn get_cluster_meta(&self) -> Result<ClusterMeta> {
        let kv = self
            .store
            .get(&keys::cluster_meta_key(&self.root))
            .await?
            .ok_or(Error::ClusterNotBootstrapped)?;
        Ok(ClusterMeta::decode(kv.value.as_slice())?)
    }

    pub async fn put_cluster_meta(&self, meta: ClusterMeta) -> Result<()> {
        if meta.cluster_id != self.cluster_id {
            return Err(Error::ClusterMismatch {
                got: meta.cluster_id,
                expected: self.cluster_id,
            });
        }
        self.leader_txn(
            vec![],
            vec![TxnOp::put(
                keys::cluster_meta_key(&self.root),
                meta.encode_to_vec(),
            )],
            "put cluster meta",
        )
        .await
    }

    pub async fn put_node(&self, node: Node) -> Result<()> {
        self.leader_txn(
            vec![],
            vec![TxnOp::put(
                keys::node_key(&self.root, node.node_id),
                node.encode_to_vec(),
            )],
            "put node",
        )
        .await?;
        self.tables
            .write()
            .unwrap()
            .nodes
            .insert(node.node_id, node);
        Ok(())
    }

    pub async fn put_store(&self, store: Store) -> Result<()> {
        self.leader_txn(
            vec![],
            vec![TxnOp::put(
                keys::store_key(&self.root, store.store_id),
                store.encode_to_vec(),
            )],
            "put store",
        )
        .await?;
        self.tables
            .write()
            .unwrap()
            .stores
            .insert(store.store_id, store);
        Ok(())
    }

    pub async fn get_node(&self, node_id: u64) -> Result<Node> {
        if let Some(node) = self.tables.read().unwrap().nodes.get(&node_id) {
            return Ok(node.clone());
        }
        // The table can trail another leader's writes; fall back to the store.
        let kv = self
            .store
            .get(&keys::node_key(&self.root, node_id))
            .await?
            .ok_or(Error::NodeNotFound(node_id))?;
        Ok(Node::decode(kv.value.as_slice())?)
    }

    /// Snapshot the store table for placement planning.
    pub(crate) fn stores_snapshot(&self) -> Vec<Store> {
        self.tables.read().unwrap().stores.values().cloned().collect()
    }

    /// Look up the region covering `key` by scanning the directory for the
    /// first end key past it.
    pub async fn get_region(&self, key: &[u8]) -> Result<Region> {
        let start = keys::region_search_key(&self.root, &keys::encode_search_start(key));
        let end = keys::prefix_range_end(&keys::region_search_prefix(&self.root));
        let Some(kv) = self.store.range_first(&start, &end).await? else {
            return Err(Error::RegionNotFound(key.to_vec()));
        };
        let region = Region::decode(kv.value.as_slice())?;
        if !region.end_key.is_empty() && key >= region.end_key.as_slice() {
            // Unreachable by scan order; kept as a directory-corruption guard.
            return Err(Error::RegionNotFound(key.to_vec()));
        }
        Ok(region)
    }

    /// Nudge the job worker. Lossy by design: a full channel already means a
    /// wakeup is pending.
    pub(crate) fn notify_job_worker(&self) {
        let _ = self.ask_job_tx.try_send(());
    }

    /// Run a transaction that must only apply while this process leads.
    pub(crate) async fn leader_txn(
        &self,
        mut cmps: Vec<Compare>,
        ops: Vec<TxnOp>,
        what: &'static str,
    ) -> Result<()> {
        cmps.insert(0, self.gate.leader_cmp()?);
        let extra_guards = cmps.len() > 1;
        let committed = self.store.txn(cmps, ops).await?;
        if committed {
            return Ok(());
        }
        if extra_guards {
            Err(Error::Txn(what))
        } else {
            Err(Error::LeaderLost)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_proto::meta::{LeaderInfo, Peer};
    use std::time::Duration;

    async fn leader_parts() -> (Arc<dyn MetaStore>, Arc<LeaderGate>, Arc<IdAllocator>) {
        let store: Arc<dyn MetaStore> = Arc::new(crate::metastore::MemStore::new());
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
        let alloc = Arc::new(IdAllocator::new(store.clone(), gate.clone(), "/pilot"));
        (store, gate, alloc)
    }

    fn bootstrap_request() -> BootstrapRequest {
        BootstrapRequest {
            node: Some(Node {
                node_id: 1,
                address: "127.0.0.1:20160".to_string(),
            }),
            stores: vec![Store {
                store_id: 10,
                node_id: 1,
            }],
            region: Some(Region {
                region_id: 100,
                start_key: vec![],
                end_key: vec![],
                max_peer_id: 1000,
                peers: vec![Peer {
                    peer_id: 1000,
                    node_id: 1,
                    store_id: 10,
                }],
            }),
        }
    }

    #[tokio::test]
    async fn bootstrap_is_exactly_once() {
        let (store, gate, alloc) = leader_parts().await;
        let meta = ClusterMeta {
            cluster_id: 1,
            max_peer_count: 3,
        };

        Cluster::bootstrap(root(), &store, &gate, meta.clone(), &bootstrap_request())
            .await
            .unwrap();
        let err = Cluster::bootstrap(root(), &store, &gate, meta, &bootstrap_request())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClusterBootstrapped));

        let (cluster, _rx) = Cluster::load(root(), store, gate, alloc)
            .await
            .unwrap()
            .expect("cluster exists");
        assert_eq!(cluster.cluster_id, 1);
        assert_eq!(cluster.get_node(1).await.unwrap().address, "127.0.0.1:20160");
        assert_eq!(cluster.stores_snapshot().len(), 1);
    }

    fn root() -> &'static str {
        "/pilot"
    }

    #[tokio::test]
    async fn region_lookup_follows_scan_order() {
        let (store, gate, alloc) = leader_parts().await;
        let meta = ClusterMeta {
            cluster_id: 1,
            max_peer_count: 3,
        };
        Cluster::bootstrap(root(), &store, &gate, meta, &bootstrap_request())
            .await
            .unwrap();
        let (cluster, _rx) = Cluster::load(root(), store.clone(), gate, alloc)
            .await
            .unwrap()
            .unwrap();

        // Replace the single unbounded region with ["", "b") and ["b", "").
        let left = Region {
            region_id: 100,
            start_key: vec![],
            end_key: b"b".to_vec(),
            max_peer_id: 1000,
            peers: vec![],
        };
        let right = Region {
            region_id: 101,
            start_key: b"b".to_vec(),
            end_key: vec![],
            max_peer_id: 1000,
            peers: vec![],
        };
        for region in [&left, &right] {
            let encoded = keys::encode_end_key(&region.end_key);
            store
                .put(
                    &keys::region_search_key(root(), &encoded),
                    region.encode_to_vec(),
                )
                .await
                .unwrap();
        }

        assert_eq!(cluster.get_region(b"a").await.unwrap().region_id, 100);
        // "b" is excluded from the left region.
        assert_eq!(cluster.get_region(b"b").await.unwrap().region_id, 101);
        assert_eq!(cluster.get_region(b"zzz").await.unwrap().region_id, 101);
        assert_eq!(cluster.get_region(b"").await.unwrap().region_id, 100);
    }
}
