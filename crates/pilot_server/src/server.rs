//! The placement driver server: election loop, leader-side periodic tasks,
//! and the framed TCP surface that serves clients.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pilot_proto::codec::{Frame, FrameCodec};
use pilot_proto::meta::{ClusterMeta, LeaderInfo};
use pilot_proto::rpc::{
    AlreadyBootstrapped, CmdType, ErrorDetail, GetMetaResponse, IsBootstrappedResponse, MetaType,
    Request, Response, ResponseHeader, TsoResponse,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::cluster::Cluster;
use crate::config::Config;
use crate::election::LeaderGate;
use crate::error::{Error, Result};
use crate::id_alloc::IdAllocator;
use crate::metastore::MetaStore;
use crate::tso::{TsoEngine, UPDATE_TIMESTAMP_STEP};
use crate::worker;

pub struct Server {
    cfg: Config,
    store: Arc<dyn MetaStore>,
    gate: Arc<LeaderGate>,
    tso: Arc<TsoEngine>,
    alloc: Arc<IdAllocator>,
    cluster: RwLock<Option<Arc<Cluster>>>,
    leader_term: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn new(cfg: Config, store: Arc<dyn MetaStore>) -> Arc<Server> {
        let gate = Arc::new(LeaderGate::new(
            store.clone(),
            &cfg.root_path,
            cfg.leader_lease(),
        ));
        let tso = Arc::new(TsoEngine::new(store.clone(), gate.clone(), &cfg.root_path));
        let alloc = Arc::new(IdAllocator::new(store.clone(), gate.clone(), &cfg.root_path));
        Arc::new(Server {
            cfg,
            store,
            gate,
            tso,
            alloc,
            cluster: RwLock::new(None),
            leader_term: Mutex::new(None),
            shutdown: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Bind, campaign, and serve until [`Server::close`] is called.
    pub async fn run(self: &Arc<Server>) -> Result<()> {
        let listener = TcpListener::bind(&self.cfg.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap() = Some(local_addr);
        tracing::info!(addr = %local_addr, "placement driver listening");

        let this = self.clone();
        tokio::spawn(async move { this.election_loop().await });

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (socket, peer) = accepted?;
                    tracing::debug!(peer = %peer, "accepted client connection");
                    let this = self.clone();
                    tokio::spawn(async move { this.serve_conn(socket).await });
                }
            }
        }

        if let Some(term) = self.leader_term.lock().unwrap().take() {
            term.cancel();
        }
        self.tso.invalidate();
        self.gate.resign().await;
        tracing::info!("placement driver stopped");
        Ok(())
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_leader(&self) -> bool {
        self.gate.is_leader()
    }

    /// Bound address once [`Server::run`] has started listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    /// The in-memory cluster handle, present once bootstrapped and loaded.
    pub fn cluster(&self) -> Option<Arc<Cluster>> {
        self.cluster.read().unwrap().clone()
    }

    fn advertise_addr(&self) -> String {
        if let Some(addr) = &self.cfg.advertise_addr {
            return addr.clone();
        }
        self.local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| self.cfg.listen_addr.clone())
    }

    async fn election_loop(self: Arc<Server>) {
        let campaign_interval = self.cfg.leader_lease();
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            let info = LeaderInfo {
                addr: self.advertise_addr(),
            };
            match self.gate.campaign(&info).await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = time::sleep(campaign_interval) => continue,
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "leader campaign failed");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            }

            tracing::info!(addr = %info.addr, "elected placement driver leader");
            let term = self.shutdown.child_token();
            *self.leader_term.lock().unwrap() = Some(term.clone());

            // Keep the lease alive from the moment the campaign is won; the
            // timestamp sync below can legitimately wait out multiple lease
            // periods.
            {
                let this = self.clone();
                let term = term.clone();
                tokio::spawn(async move { this.keep_alive_loop(term).await });
            }

            match self.start_leading(&term).await {
                Ok(()) => self.lead(&term).await,
                Err(err) => {
                    tracing::error!(error = %err, "failed to start leader tasks");
                }
            }

            term.cancel();
            *self.leader_term.lock().unwrap() = None;
            self.tso.invalidate();
            self.gate.resign().await;
            tracing::info!("stepped down from placement driver leadership");
        }
    }

    /// Leader start: sync the timestamp oracle and bring up the cluster
    /// worker when a cluster already exists under this root.
    async fn start_leading(&self, term: &CancellationToken) -> Result<()> {
        self.tso.sync().await?;
        self.load_cluster(term).await?;
        Ok(())
    }

    async fn load_cluster(&self, term: &CancellationToken) -> Result<()> {
        let loaded = Cluster::load(
            &self.cfg.root_path,
            self.store.clone(),
            self.gate.clone(),
            self.alloc.clone(),
        )
        .await?;
        let Some((cluster, ask_job_rx)) = loaded else {
            return Ok(());
        };
        tracing::info!(cluster_id = cluster.cluster_id, "loaded cluster state");

        *self.cluster.write().unwrap() = Some(cluster.clone());
        let retry_delay = self.cfg.next_retry_delay();
        let worker_shutdown = term.clone();
        tokio::spawn(async move {
            worker::run_job_worker(cluster, ask_job_rx, retry_delay, worker_shutdown).await;
        });
        Ok(())
    }

    /// Refresh the election lease until the term ends; an unrefreshable
    /// lease ends the term itself.
    async fn keep_alive_loop(&self, term: CancellationToken) {
        let keep_alive = self.cfg.leader_lease() / 3;
        let mut lease_tick = time::interval(keep_alive.max(Duration::from_millis(100)));
        lease_tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = term.cancelled() => return,
                _ = lease_tick.tick() => {
                    match self.gate.keep_alive_once().await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::warn!("leader lease expired, stepping down");
                            term.cancel();
                            return;
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "leader keep-alive failed, stepping down");
                            term.cancel();
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Drive the timestamp tick until the lease is lost or the process shuts
    /// down.
    async fn lead(&self, term: &CancellationToken) {
        let mut tso_tick = time::interval(UPDATE_TIMESTAMP_STEP);
        tso_tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = term.cancelled() => return,
                _ = tso_tick.tick() => {
                    if let Err(err) = self.tso.update().await {
                        tracing::error!(error = %err, "timestamp update failed, stepping down");
                        return;
                    }
                }
            }
        }
    }

    async fn serve_conn(self: Arc<Server>, socket: TcpStream) {
        let mut framed = Framed::new(socket, FrameCodec::new());
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                frame = framed.next() => frame,
            };
            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    tracing::debug!(error = %err, "client framing error, closing connection");
                    return;
                }
                None => return,
            };

            let request: Request = match frame.decode() {
                Ok(request) => request,
                Err(err) => {
                    tracing::warn!(error = %err, "undecodable client request, closing connection");
                    return;
                }
            };

            let response = self.dispatch(request).await;
            if let Err(err) = framed.send(Frame::from_msg(frame.msg_id, &response)).await {
                tracing::debug!(error = %err, "failed to write response, closing connection");
                return;
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Response {
        let uuid = request
            .header
            .as_ref()
            .map(|h| h.uuid.clone())
            .unwrap_or_default();
        let cmd_type = request.cmd_type();
        let mut response = Response {
            header: Some(ResponseHeader { uuid, error: None }),
            cmd_type: request.cmd_type,
            ..Default::default()
        };

        if let Err(err) = self.apply(cmd_type, request, &mut response).await {
            tracing::warn!(cmd = ?cmd_type, error = %err, "request failed");
            let bootstrapped =
                matches!(err, Error::ClusterBootstrapped).then_some(AlreadyBootstrapped {});
            if let Some(header) = response.header.as_mut() {
                header.error = Some(ErrorDetail {
                    message: err.to_string(),
                    bootstrapped,
                });
            }
        }
        response
    }

    async fn apply(
        &self,
        cmd_type: CmdType,
        request: Request,
        response: &mut Response,
    ) -> Result<()> {
        if !self.gate.is_leader() {
            return Err(Error::NotLeader);
        }
        self.check_cluster_id(&request)?;

        match cmd_type {
            CmdType::Tso => {
                let count = request
                    .tso
                    .ok_or_else(|| Error::Protocol("tso request without a body".to_string()))?
                    .count;
                let timestamps = self.tso.timestamps(count).await?;
                response.tso = Some(TsoResponse { timestamps });
            }
            CmdType::GetMeta => {
                let get_meta = request
                    .get_meta
                    .ok_or_else(|| Error::Protocol("get meta request without a body".to_string()))?;
                match get_meta.meta_type() {
                    MetaType::RegionType => {
                        let region = self.require_cluster()?.get_region(&get_meta.region_key).await?;
                        response.get_meta = Some(GetMetaResponse {
                            meta_type: get_meta.meta_type,
                            region: Some(region),
                        });
                    }
                    MetaType::InvalidMeta => {
                        return Err(Error::Protocol("invalid meta type".to_string()));
                    }
                }
            }
            CmdType::AskChangePeer => {
                let ask = request.ask_change_peer.ok_or_else(|| {
                    Error::Protocol("ask change peer request without a body".to_string())
                })?;
                self.require_cluster()?.handle_ask_change_peer(ask).await?;
                response.ask_change_peer = Some(Default::default());
            }
            CmdType::AskSplit => {
                let ask = request
                    .ask_split
                    .ok_or_else(|| Error::Protocol("ask split request without a body".to_string()))?;
                self.require_cluster()?.handle_ask_split(ask).await?;
                response.ask_split = Some(Default::default());
            }
            CmdType::Bootstrap => {
                let bootstrap = request
                    .bootstrap
                    .ok_or_else(|| Error::Protocol("bootstrap request without a body".to_string()))?;
                let cluster_id = request
                    .header
                    .as_ref()
                    .map(|h| h.cluster_id)
                    .unwrap_or_default();
                self.handle_bootstrap(cluster_id, &bootstrap).await?;
                response.bootstrap = Some(Default::default());
            }
            CmdType::IsBootstrapped => {
                response.is_bootstrapped = Some(IsBootstrappedResponse {
                    bootstrapped: self.cluster().is_some(),
                });
            }
            CmdType::Invalid => {
                return Err(Error::Protocol("invalid command type".to_string()));
            }
        }
        Ok(())
    }

    async fn handle_bootstrap(
        &self,
        cluster_id: u64,
        request: &pilot_proto::rpc::BootstrapRequest,
    ) -> Result<()> {
        let meta = ClusterMeta {
            cluster_id,
            max_peer_count: self.cfg.max_peer_count,
        };
        Cluster::bootstrap(&self.cfg.root_path, &self.store, &self.gate, meta, request).await?;

        let term = self
            .leader_term
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::NotLeader)?;
        self.load_cluster(&term).await
    }

    fn require_cluster(&self) -> Result<Arc<Cluster>> {
        self.cluster().ok_or(Error::ClusterNotBootstrapped)
    }

    fn check_cluster_id(&self, request: &Request) -> Result<()> {
        let Some(cluster) = self.cluster() else {
            return Ok(());
        };
        let got = request
            .header
            .as_ref()
            .map(|h| h.cluster_id)
            .unwrap_or_default();
        if got != cluster.cluster_id {
            return Err(Error::ClusterMismatch {
                got,
                expected: cluster.cluster_id,
            });
        }
        Ok(())
    }
}
