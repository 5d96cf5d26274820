use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use meshrpc_common::transport::Connection;
use meshrpc_common::{Result, RpcError};

/// Future returned by a connection factory.
pub type ConnectFuture = Pin<Box<dyn Future<Output = Result<Connection>> + Send>>;

/// Factory invoked whenever the pool needs a fresh connection.
pub type ConnectFn = Arc<dyn Fn() -> ConnectFuture + Send + Sync>;

/// Bounded pool of lazily-created connections to one address.
///
/// The pool holds `max_conns` slots. A slot is either empty (no connection
/// yet) or holds an idle connection; connections are only dialed when a
/// checkout finds no idle one. [`Pool::get`] blocks while every slot is
/// checked out and fails with [`RpcError::PoolClosed`] once the pool is
/// closed.
///
/// Capacity invariant: checked-out clients plus idle connections never
/// exceed `max_conns` — each checkout holds a semaphore permit for its whole
/// lease.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<Connection>>,
    factory: ConnectFn,
    failures: AtomicU32,
}

impl Pool {
    pub fn new(max_conns: usize, factory: ConnectFn) -> Self {
        Pool {
            shared: Arc::new(PoolShared {
                semaphore: Arc::new(Semaphore::new(max_conns)),
                idle: Mutex::new(Vec::with_capacity(max_conns)),
                factory,
                failures: AtomicU32::new(0),
            }),
        }
    }

    /// Checks out a connection, dialing a new one if no idle connection is
    /// available. Blocks while the pool is at capacity.
    pub async fn get(&self) -> Result<Client> {
        let permit = self
            .shared
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RpcError::PoolClosed)?;

        let idle = self.shared.idle.lock().await.pop();
        let conn = match idle {
            Some(conn) => conn,
            // Factory failure releases the slot (permit drops) without
            // counting against capacity.
            None => (self.shared.factory)().await?,
        };

        Ok(Client {
            conn: Some(conn),
            prefix: None,
            shared: self.shared.clone(),
            _permit: permit,
        })
    }

    /// Checks out a connection scoped to one service: every call through the
    /// returned client is namespaced `prefix.method`.
    pub async fn get_service(&self, prefix: &str) -> Result<Client> {
        let mut client = self.get().await?;
        client.prefix = Some(format!("{prefix}."));
        Ok(client)
    }

    /// Closes the pool to further checkouts and drains all idle connections,
    /// closing each. Returns the first close error encountered.
    ///
    /// Connections still checked out are closed when their lease ends.
    pub async fn close(&self) -> Result<()> {
        self.shared.semaphore.close();

        let drained: Vec<Connection> = {
            let mut idle = self.shared.idle.lock().await;
            idle.drain(..).collect()
        };

        let mut first_err = None;
        for mut conn in drained {
            if let Err(e) = conn.close().await {
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

    pub fn is_closed(&self) -> bool {
        self.shared.semaphore.is_closed()
    }

    /// Consecutive checkout leases that ended with a retired connection.
    /// Reset to zero whenever a healthy connection is returned.
    pub fn failures(&self) -> u32 {
        self.shared.failures.load(Ordering::SeqCst)
    }
}

/// A leased, failure-classifying view over one pooled connection.
///
/// The wrapper tracks its own validity: an application-level error from the
/// remote handler leaves the connection reusable, while any transport-class
/// failure retires it on the spot. [`Client::close`] then either returns the
/// connection for reuse or leaves the slot empty so the next checkout dials
/// fresh.
pub struct Client {
    conn: Option<Connection>,
    prefix: Option<String>,
    shared: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("valid", &self.conn.is_some())
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl Client {
    /// Invokes `method` on the underlying connection.
    pub async fn call(&mut self, method: &str, args: Value) -> Result<Value> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| RpcError::Transport("connection already retired".to_string()))?;

        let namespaced;
        let method = match &self.prefix {
            Some(prefix) => {
                namespaced = format!("{prefix}{method}");
                namespaced.as_str()
            }
            None => method,
        };

        match conn.call(method, args).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_application() => Err(e),
            Err(e) => {
                debug!(error = %e, "retiring connection after transport failure");
                if let Some(mut conn) = self.conn.take() {
                    let _ = conn.close().await;
                }
                Err(e)
            }
        }
    }

    /// Whether the underlying connection is still considered healthy.
    pub fn is_valid(&self) -> bool {
        self.conn.is_some()
    }

    /// Releases the lease: a healthy connection goes back to the pool, a
    /// retired one leaves the slot empty for lazy reconnect. A connection
    /// returned to an already-closed pool is closed immediately.
    pub async fn close(mut self) -> Result<()> {
        match self.conn.take() {
            Some(mut conn) => {
                let mut idle = self.shared.idle.lock().await;
                if self.shared.semaphore.is_closed() {
                    drop(idle);
                    conn.close().await?;
                } else {
                    self.shared.failures.store(0, Ordering::SeqCst);
                    idle.push(conn);
                }
            }
            None => {
                self.shared.failures.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

/// A batch of clients, one per provider, as returned by a service fan-out.
pub struct Clients(Vec<Client>);

impl std::fmt::Debug for Clients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Clients").field(&self.0.len()).finish()
    }
}

impl Clients {
    pub fn new(clients: Vec<Client>) -> Self {
        Clients(clients)
    }

    /// Closes every client, reporting the first error.
    pub async fn close(self) -> Result<()> {
        let mut first_err = None;
        for client in self.0 {
            if let Err(e) = client.close().await {
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

impl std::ops::Deref for Clients {
    type Target = Vec<Client>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::DerefMut for Clients {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl IntoIterator for Clients {
    type Item = Client;
    type IntoIter = std::vec::IntoIter<Client>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
