use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use meshrpc_common::Result;

use crate::pool::{ConnectFn, ConnectFuture, Pool};

/// Factory dialing a connection to a specific peer address.
pub type PeerConnectFn = Arc<dyn Fn(String) -> ConnectFuture + Send + Sync>;

/// Maps peer address to its connection [`Pool`] and owns pool lifecycle.
///
/// At most one live pool exists per address: [`PeerRegistry::join`] for an
/// already-joined address closes the previous pool (draining its
/// connections) before installing a fresh one. Pool internals have their own
/// synchronization, so long-running calls on one peer never block
/// join/leave on another.
pub struct PeerRegistry {
    max_conns: usize,
    factory: PeerConnectFn,
    pools: RwLock<HashMap<String, Pool>>,
}

impl PeerRegistry {
    pub fn new(max_conns: usize, factory: PeerConnectFn) -> Self {
        PeerRegistry {
            max_conns,
            factory,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Installs a pool for `addr`, replacing (and closing) any existing one.
    /// Errors from closing the old pool propagate.
    pub async fn join(&self, addr: &str) -> Result<()> {
        let mut pools = self.pools.write().await;
        if let Some(old) = pools.remove(addr) {
            debug!(%addr, "replacing existing pool");
            old.close().await?;
        }

        let factory = self.factory.clone();
        let target = addr.to_string();
        let pool_factory: ConnectFn = Arc::new(move || (factory)(target.clone()));
        pools.insert(addr.to_string(), Pool::new(self.max_conns, pool_factory));
        Ok(())
    }

    /// Removes and closes the pool for `addr`. Succeeds if absent.
    pub async fn leave(&self, addr: &str) -> Result<()> {
        let pool = self.pools.write().await.remove(addr);
        match pool {
            Some(pool) => pool.close().await,
            None => Ok(()),
        }
    }

    /// Pure lookup; `None` if never joined.
    pub async fn get(&self, addr: &str) -> Option<Pool> {
        self.pools.read().await.get(addr).cloned()
    }

    /// Snapshot of joined peer addresses.
    pub async fn list(&self) -> Vec<String> {
        self.pools.read().await.keys().cloned().collect()
    }

    /// Closes every pool, reports the first error, and resets to empty.
    pub async fn leave_all(&self) -> Result<()> {
        let drained: Vec<Pool> = {
            let mut pools = self.pools.write().await;
            pools.drain().map(|(_, pool)| pool).collect()
        };

        let mut first_err = None;
        for pool in drained {
            if let Err(e) = pool.close().await {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshrpc_common::transport::Connection;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Factory producing inert duplex connections, counting dials per peer.
    fn test_factory(dials: Arc<AtomicUsize>) -> PeerConnectFn {
        Arc::new(move |_addr: String| {
            dials.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                let (client_side, server_side) = tokio::io::duplex(64);
                // Keep the far side alive so the stream stays open.
                tokio::spawn(async move {
                    let mut server = server_side;
                    let mut buf = [0u8; 64];
                    loop {
                        match tokio::io::AsyncReadExt::read(&mut server, &mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {}
                        }
                    }
                });
                Ok(Connection::with_timeout(
                    client_side,
                    Duration::from_secs(1),
                ))
            }) as ConnectFuture
        })
    }

    #[tokio::test]
    async fn join_get_list_leave() {
        let dials = Arc::new(AtomicUsize::new(0));
        let peers = PeerRegistry::new(2, test_factory(dials));

        peers.join("10.0.0.1:9000").await.unwrap();
        peers.join("10.0.0.2:9000").await.unwrap();

        assert!(peers.get("10.0.0.1:9000").await.is_some());
        assert!(peers.get("10.0.0.3:9000").await.is_none());

        let mut list = peers.list().await;
        list.sort();
        assert_eq!(list, vec!["10.0.0.1:9000", "10.0.0.2:9000"]);

        peers.leave("10.0.0.1:9000").await.unwrap();
        assert!(peers.get("10.0.0.1:9000").await.is_none());

        // Leaving an unknown address is not an error.
        peers.leave("10.0.0.9:9000").await.unwrap();
    }

    #[tokio::test]
    async fn rejoin_closes_the_previous_pool() {
        let dials = Arc::new(AtomicUsize::new(0));
        let peers = PeerRegistry::new(2, test_factory(dials.clone()));

        peers.join("10.0.0.1:9000").await.unwrap();
        let first_pool = peers.get("10.0.0.1:9000").await.unwrap();

        // Park an idle connection in the first pool.
        let client = first_pool.get().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 1);

        peers.join("10.0.0.1:9000").await.unwrap();
        assert!(first_pool.is_closed());

        // The replacement pool starts empty and dials fresh.
        let second_pool = peers.get("10.0.0.1:9000").await.unwrap();
        assert!(!second_pool.is_closed());
        let client = second_pool.get().await.unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 2);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn leave_all_resets_the_registry() {
        let dials = Arc::new(AtomicUsize::new(0));
        let peers = PeerRegistry::new(2, test_factory(dials));

        peers.join("10.0.0.1:9000").await.unwrap();
        peers.join("10.0.0.2:9000").await.unwrap();
        let pool = peers.get("10.0.0.1:9000").await.unwrap();

        peers.leave_all().await.unwrap();
        assert!(peers.list().await.is_empty());
        assert!(pool.is_closed());
    }
}
