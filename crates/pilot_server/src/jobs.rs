//! The durable job queue.
//!
//! Jobs live under `<root>/jobs/` with fixed-width ids, so an ascending
//! limit-1 scan always yields the oldest one. Every mutation is conditional
//! on the leader compare.

use pilot_proto::raft::{Job, JobStatus, RaftCmdRequest};
use prost::Message;
use uuid::Uuid;

use crate::cluster::Cluster;
use crate::error::{Error, Result};
use crate::keys;
use crate::metastore::TxnOp;

impl Cluster {
    /// Allocate an id for `request`, persist it as a pending job, and nudge
    /// the worker.
    pub(crate) async fn post_job(&self, mut request: RaftCmdRequest) -> Result<()> {
        let job_id = self.alloc.alloc().await?;
        if let Some(header) = request.header.as_mut() {
            header.uuid = Uuid::new_v4().as_bytes().to_vec();
        }
        let job = Job {
            job_id,
            status: JobStatus::Pending as i32,
            request: Some(request),
        };

        self.leader_txn(
            vec![],
            vec![TxnOp::put(
                keys::job_key(&self.root, job_id),
                job.encode_to_vec(),
            )],
            "post job",
        )
        .await?;
        tracing::debug!(job_id, "posted job");

        self.notify_job_worker();
        Ok(())
    }

    /// The oldest queued job, or `None` when the queue is empty.
    pub(crate) async fn first_job(&self) -> Result<Option<Job>> {
        let prefix = keys::job_prefix(&self.root);
        let end = keys::prefix_range_end(&prefix);
        match self.store.range_first(&prefix, &end).await? {
            Some(kv) => Ok(Some(Job::decode(kv.value.as_slice())?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn update_job_status(&self, job: &Job, status: JobStatus) -> Result<()> {
        let mut updated = job.clone();
        updated.status = status as i32;
        self.leader_txn(
            vec![],
            vec![TxnOp::put(
                keys::job_key(&self.root, job.job_id),
                updated.encode_to_vec(),
            )],
            "update job status",
        )
        .await
    }

    pub(crate) async fn pop_job(&self, job: &Job) -> Result<()> {
        // Only the queue head may be popped.
        match self.first_job().await? {
            Some(head) if head.job_id == job.job_id => {}
            _ => {
                return Err(Error::Protocol(format!(
                    "job {} is not the queue head",
                    job.job_id
                )))
            }
        }
        self.leader_txn(
            vec![],
            vec![TxnOp::delete(keys::job_key(&self.root, job.job_id))],
            "pop job",
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::LeaderGate;
    use crate::id_alloc::IdAllocator;
    use crate::metastore::{MemStore, MetaStore};
    use pilot_proto::meta::{ClusterMeta, LeaderInfo, Node, Peer, Region, Store};
    use pilot_proto::raft::RaftRequestHeader;
    use pilot_proto::rpc::BootstrapRequest;
    use std::sync::Arc;
    use std::time::Duration;

    async fn test_cluster() -> Arc<Cluster> {
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
        let alloc = Arc::new(IdAllocator::new(store.clone(), gate.clone(), "/pilot"));

        let req = BootstrapRequest {
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
        };
        Cluster::bootstrap(
            "/pilot",
            &store,
            &gate,
            ClusterMeta {
                cluster_id: 1,
                max_peer_count: 3,
            },
            &req,
        )
        .await
        .unwrap();
        let (cluster, _rx) = Cluster::load("/pilot", store, gate, alloc)
            .await
            .unwrap()
            .unwrap();
        cluster
    }

    fn request(region_id: u64) -> RaftCmdRequest {
        RaftCmdRequest {
            header: Some(RaftRequestHeader {
                uuid: vec![],
                region_id,
                peer: None,
            }),
            admin: None,
            status: None,
        }
    }

    #[tokio::test]
    async fn peek_returns_the_least_id_and_pop_restores_the_queue() {
        let cluster = test_cluster().await;
        assert!(cluster.first_job().await.unwrap().is_none());

        cluster.post_job(request(7)).await.unwrap();
        cluster.post_job(request(8)).await.unwrap();

        let head = cluster.first_job().await.unwrap().unwrap();
        let second = {
            let region = head.request.as_ref().unwrap().header.as_ref().unwrap();
            assert_eq!(region.region_id, 7);
            cluster.pop_job(&head).await.unwrap();
            cluster.first_job().await.unwrap().unwrap()
        };
        assert!(second.job_id > head.job_id);

        // Popping the head leaves the remaining queue intact; popping a
        // non-head is refused.
        let stale = head;
        assert!(cluster.pop_job(&stale).await.is_err());
        cluster.pop_job(&second).await.unwrap();
        assert!(cluster.first_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_updates_are_persisted_in_place() {
        let cluster = test_cluster().await;
        cluster.post_job(request(7)).await.unwrap();

        let job = cluster.first_job().await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Pending);

        cluster
            .update_job_status(&job, JobStatus::Running)
            .await
            .unwrap();
        let reread = cluster.first_job().await.unwrap().unwrap();
        assert_eq!(reread.job_id, job.job_id);
        assert_eq!(reread.status(), JobStatus::Running);
    }

    #[tokio::test]
    async fn job_writes_require_leadership() {
        let cluster = test_cluster().await;
        cluster.gate.demote();
        assert!(matches!(
            cluster.post_job(request(1)).await,
            Err(Error::NotLeader)
        ));
    }
}
