//! Cache of open storage-node connections with idle-timeout eviction.
//!
//! Connections are checked out, used, and returned; an entry that has sat
//! idle past the timeout is dropped and redialed instead of reused.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::time;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) struct NodeConn {
    pub(crate) stream: TcpStream,
    touched: Instant,
}

pub(crate) struct NodeConns {
    conns: Mutex<HashMap<String, NodeConn>>,
    idle_timeout: Duration,
}

impl NodeConns {
    pub(crate) fn new() -> NodeConns {
        NodeConns::with_idle_timeout(DEFAULT_IDLE_TIMEOUT)
    }

    pub(crate) fn with_idle_timeout(idle_timeout: Duration) -> NodeConns {
        NodeConns {
            conns: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Check out a connection to `addr`, dialing a fresh one when none is
    /// cached or the cached one has gone idle.
    #[allow(dead_code)]
    pub(crate) async fn get(&self, addr: &str) -> io::Result<NodeConn> {
        let cached = self.conns.lock().unwrap().remove(addr);
        if let Some(conn) = cached {
            if conn.touched.elapsed() <= self.idle_timeout {
                return Ok(NodeConn {
                    stream: conn.stream,
                    touched: Instant::now(),
                });
            }
        }

        let stream = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, format!("connect to {addr} timed out"))
            })??;
        Ok(NodeConn {
            stream,
            touched: Instant::now(),
        })
    }

    /// Return a connection for reuse.
    #[allow(dead_code)]
    pub(crate) fn put(&self, addr: String, conn: NodeConn) {
        self.conns.lock().unwrap().insert(addr, conn);
    }

    /// Drop every cached connection.
    pub(crate) fn close(&self) {
        self.conns.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn reuses_a_fresh_connection_and_evicts_an_idle_one() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                // Park accepted connections so the cache owns their lifetime.
                tokio::spawn(async move {
                    let _stream = stream;
                    time::sleep(Duration::from_secs(60)).await;
                });
            }
        });

        let conns = NodeConns::with_idle_timeout(Duration::from_millis(50));
        let first = conns.get(&addr).await.unwrap();
        let first_peer = first.stream.local_addr().unwrap();
        conns.put(addr.clone(), first);

        // Within the idle window the same socket comes back.
        let again = conns.get(&addr).await.unwrap();
        assert_eq!(again.stream.local_addr().unwrap(), first_peer);
        conns.put(addr.clone(), again);

        // Past the idle window the cache dials a new socket.
        time::sleep(Duration::from_millis(80)).await;
        let fresh = conns.get(&addr).await.unwrap();
        assert_ne!(fresh.stream.local_addr().unwrap(), first_peer);

        conns.close();
    }
}
