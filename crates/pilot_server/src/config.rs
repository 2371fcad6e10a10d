//! Runtime configuration for a placement driver process.

use std::time::Duration;

use clap::Parser;

/// CLI options for running a placement driver.
#[derive(Clone, Debug, Parser)]
#[command(name = "pilot-server")]
pub struct Config {
    /// Root prefix for every key this driver persists.
    #[arg(long, env = "PILOT_ROOT_PATH", default_value = "/shardpilot")]
    pub root_path: String,

    /// Leader lease in seconds. Treated as the minimum lease the meta store
    /// guarantees; the timestamp oracle waits out twice this on failover.
    #[arg(long, env = "PILOT_LEADER_LEASE_SECS", default_value_t = 3)]
    pub leader_lease_secs: u64,

    /// Delay before retrying a failed coordination job, in milliseconds.
    #[arg(long, env = "PILOT_NEXT_RETRY_DELAY_MS", default_value_t = 1000)]
    pub next_retry_delay_ms: u64,

    /// Address the framed TCP server listens on.
    #[arg(long, env = "PILOT_LISTEN_ADDR", default_value = "127.0.0.1:1162")]
    pub listen_addr: String,

    /// Address published to clients in the leader record. Defaults to the
    /// listen address.
    #[arg(long, env = "PILOT_ADVERTISE_ADDR")]
    pub advertise_addr: Option<String>,

    /// Replica count the cluster worker drives every region toward at
    /// bootstrap.
    #[arg(long, env = "PILOT_MAX_PEER_COUNT", default_value_t = 3)]
    pub max_peer_count: u32,

    /// Endpoints of an external consensus store backend, when one is used
    /// instead of the embedded store.
    #[arg(long = "store-endpoint", env = "PILOT_STORE_ENDPOINTS", value_delimiter = ',')]
    pub store_endpoints: Vec<String>,
}

impl Config {
    pub fn leader_lease(&self) -> Duration {
        Duration::from_secs(self.leader_lease_secs.max(1))
    }

    pub fn next_retry_delay(&self) -> Duration {
        Duration::from_millis(self.next_retry_delay_ms.max(1))
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            root_path: "/shardpilot".to_string(),
            leader_lease_secs: 3,
            next_retry_delay_ms: 1000,
            listen_addr: "127.0.0.1:1162".to_string(),
            advertise_addr: None,
            max_peer_count: 3,
            store_endpoints: Vec::new(),
        }
    }
}
