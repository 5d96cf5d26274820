use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use meshrpc_client::{Client, Clients, PeerConnectFn, PeerRegistry, Pool};
use meshrpc_common::transport::{connect, serve_stream, Connection, RpcServer};
use meshrpc_common::{Request, Response, Result, RpcError};

use crate::naming::{NamingDirectory, NamingService, RegisterInfo, NAMING_SERVICE};
use crate::registry::{Service, ServiceRegistry};

/// Name the node's own control surface registers under.
pub const NODE_SERVICE: &str = "NodeService";

/// Factory producing a fresh client to the cluster's naming directory.
pub type NamingFactory =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<Client>> + Send>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Per-peer connection pool capacity.
    pub max_conns: usize,
    /// Base heartbeat period; also the backoff unit.
    pub heartbeat_interval: Duration,
    /// Ceiling for the backed-off heartbeat period.
    pub heartbeat_max: Duration,
    /// Deadline for each outbound call.
    pub call_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            max_conns: 2,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_max: Duration::from_secs(60),
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// One process's identity in the cluster.
///
/// A node owns its local [`ServiceRegistry`], a [`PeerRegistry`] with one
/// connection pool per remote address, and a heartbeat task that keeps the
/// cluster's naming directory informed of what this node provides. Its own
/// address is joined at startup and resolves to an in-process loopback, so
/// a node addresses itself exactly like any other peer.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    self_addr: String,
    config: NodeConfig,
    services: RwLock<ServiceRegistry>,
    peers: PeerRegistry,
    naming_factory: RwLock<Option<NamingFactory>>,
    activate_tx: mpsc::Sender<()>,
    shutdown_tx: watch::Sender<bool>,
    heartbeat: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Node {
    pub async fn new(self_addr: impl Into<String>, config: NodeConfig) -> Result<Node> {
        let self_addr = self_addr.into();
        let (activate_tx, activate_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let call_timeout = config.call_timeout;
        let max_conns = config.max_conns;
        let loop_addr = self_addr.clone();

        let inner = Arc::new_cyclic(|weak: &Weak<NodeInner>| {
            let weak = weak.clone();
            // Peers dial over TCP, except the node's own address, which
            // short-circuits to an in-process loopback stream.
            let factory: PeerConnectFn = Arc::new(move |addr: String| {
                let weak = weak.clone();
                let loop_addr = loop_addr.clone();
                Box::pin(async move {
                    if addr == loop_addr {
                        Ok(loopback_connection(weak, call_timeout))
                    } else {
                        connect(&addr, call_timeout).await
                    }
                })
                    as Pin<Box<dyn Future<Output = Result<Connection>> + Send>>
            });

            NodeInner {
                self_addr: self_addr.clone(),
                config,
                services: RwLock::new(ServiceRegistry::new()),
                peers: PeerRegistry::new(max_conns, factory),
                naming_factory: RwLock::new(None),
                activate_tx,
                shutdown_tx,
                heartbeat: Mutex::new(None),
            }
        });

        let node = Node { inner };
        node.inner.peers.join(&node.inner.self_addr).await?;
        node.register(Arc::new(NodeService {
            node: Arc::downgrade(&node.inner),
        }))
        .await;

        let handle = tokio::spawn(heartbeat_loop(
            node.inner.clone(),
            activate_rx,
            shutdown_rx,
        ));
        *node.inner.heartbeat.lock().await = Some(handle);

        Ok(node)
    }

    pub fn self_addr(&self) -> &str {
        &self.inner.self_addr
    }

    /// Registers a service under its declared name.
    pub async fn register(&self, service: Arc<dyn Service>) {
        self.inner.services.write().await.register(service);
    }

    /// Registers a service under an alias.
    pub async fn register_name(&self, name: impl Into<String>, service: Arc<dyn Service>) {
        self.inner.services.write().await.register_name(name, service);
    }

    /// Names this node advertises, in registration order.
    pub async fn provides(&self) -> Vec<String> {
        self.inner.services.read().await.list()
    }

    /// Adds `addr` to the peer registry. A no-op for an already-joined
    /// address: existing pooled connections are kept.
    pub async fn join(&self, addr: &str) -> Result<()> {
        if self.inner.peers.get(addr).await.is_some() {
            return Ok(());
        }
        self.inner.peers.join(addr).await
    }

    /// Removes `addr` from the peer registry, closing its pool.
    pub async fn leave(&self, addr: &str) -> Result<()> {
        self.inner.peers.leave(addr).await
    }

    /// Closes every peer pool (the loopback included) and empties the
    /// registry.
    pub async fn leave_all(&self) -> Result<()> {
        self.inner.peers.leave_all().await
    }

    /// Snapshot of joined peer addresses (the node's own included).
    pub async fn peers(&self) -> Vec<String> {
        self.inner.peers.list().await
    }

    /// Pool for a joined peer.
    pub async fn get(&self, addr: &str) -> Result<Pool> {
        self.inner
            .peers
            .get(addr)
            .await
            .ok_or_else(|| RpcError::PeerNotFound(addr.to_string()))
    }

    /// Points this node's heartbeat at a naming directory.
    pub async fn set_naming_factory(&self, factory: NamingFactory) {
        *self.inner.naming_factory.write().await = Some(factory);
    }

    /// Factory producing naming clients through the pool for `addr`,
    /// joining the address first if this node has not seen it yet.
    pub fn naming_factory_for(&self, addr: impl Into<String>) -> NamingFactory {
        let weak = Arc::downgrade(&self.inner);
        let addr = addr.into();
        Arc::new(move || {
            let weak = weak.clone();
            let addr = addr.clone();
            Box::pin(async move {
                let inner = weak.upgrade().ok_or(RpcError::PoolClosed)?;
                let node = Node { inner };
                node.join(&addr).await?;
                let pool = node.get(&addr).await?;
                pool.get_service(NAMING_SERVICE).await
            })
        })
    }

    /// Makes this node host the cluster's naming directory: the directory's
    /// RPC surface joins the local registry and the heartbeat registers
    /// through the loopback, so the host appears in its own directory.
    ///
    /// The host's own record is seeded directly; a provider query has to
    /// find at least one directory before the first heartbeat can land.
    pub async fn host_directory(&self, directory: Arc<NamingDirectory>) {
        self.register(Arc::new(NamingService::new(directory.clone())))
            .await;
        directory
            .register(&self.inner.self_addr, self.provides().await)
            .await;
        self.set_naming_factory(self.naming_factory_for(self.inner.self_addr.clone()))
            .await;
        self.activate();
    }

    /// Requests an immediate heartbeat. Coalesces with one already pending.
    pub fn activate(&self) {
        let _ = self.inner.activate_tx.try_send(());
    }

    /// Clients to every reachable provider of `name`, per the directory.
    ///
    /// Unknown providers are joined on the fly. Providers whose connection
    /// cannot be established are skipped rather than failing the whole
    /// fan-out, so one dead node never masks the healthy ones.
    pub async fn get_services(&self, name: &str) -> Result<Clients> {
        let factory = self.inner.naming_factory.read().await.clone().ok_or_else(|| {
            RpcError::DirectoryUnavailable("no naming factory configured".to_string())
        })?;

        // Failing to reach the directory at all is its own error class,
        // distinct from any one provider being down.
        let mut ns = factory()
            .await
            .map_err(|e| RpcError::DirectoryUnavailable(e.to_string()))?;
        let queried = ns.call("Query", Value::String(name.to_string())).await;
        let _ = ns.close().await;
        let providers: Vec<String> = serde_json::from_value(
            queried.map_err(|e| RpcError::DirectoryUnavailable(e.to_string()))?,
        )?;

        let attempts = providers.into_iter().map(|addr| {
            let node = self.clone();
            let name = name.to_string();
            async move {
                if let Err(e) = node.join(&addr).await {
                    debug!(%addr, error = %e, "skipping provider: join failed");
                    return None;
                }
                let pool = node.get(&addr).await.ok()?;
                match pool.get_service(&name).await {
                    Ok(client) => Some(client),
                    Err(e) => {
                        debug!(%addr, error = %e, "skipping provider: checkout failed");
                        None
                    }
                }
            }
        });

        let clients: Vec<Client> = join_all(attempts).await.into_iter().flatten().collect();
        Ok(Clients::new(clients))
    }

    /// Binds the node's RPC endpoint at its own address and serves forever.
    pub async fn serve(&self) -> Result<()> {
        let server = RpcServer::bind(&self.inner.self_addr).await?;
        self.serve_on(server).await
    }

    /// Serves on a pre-bound listener. Useful when the caller binds port 0
    /// first and constructs the node from the resolved address.
    pub async fn serve_on(&self, server: RpcServer) -> Result<()> {
        let node = self.clone();
        server
            .run(move |request| {
                let node = node.clone();
                async move { dispatch_request(&node.inner, request).await }
            })
            .await
    }

    /// Stops the heartbeat and closes every peer pool. The node drops out of
    /// the directory once its liveness deadline passes.
    pub async fn close(&self) -> Result<()> {
        let _ = self.inner.shutdown_tx.send(true);
        let handle = self.inner.heartbeat.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.peers.leave_all().await
    }
}

/// Routes one request to the owning service handler.
///
/// Lookup failures and handler errors all become error responses; they are
/// the remote caller's application errors, never transport failures.
async fn dispatch_request(inner: &Arc<NodeInner>, request: Request) -> Response {
    let Some((service_name, method)) = request.method.split_once('.') else {
        return Response::error(
            request.id,
            format!("malformed method '{}': expected Service.Method", request.method),
        );
    };

    let service = inner.services.read().await.lookup(service_name);
    let Some(service) = service else {
        return Response::error(request.id, format!("unknown service: {service_name}"));
    };

    match service.dispatch(method, request.args).await {
        Ok(value) => Response::success(request.id, value),
        Err(e) => Response::error(request.id, e.to_string()),
    }
}

/// In-process connection pair: the far half is served by the node's own
/// dispatcher. Holds only a weak handle so the serve task cannot keep a
/// shut-down node alive.
fn loopback_connection(node: Weak<NodeInner>, call_timeout: Duration) -> Connection {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let _ = serve_stream(server_side, move |request| {
            let node = node.clone();
            async move {
                match node.upgrade() {
                    Some(inner) => dispatch_request(&inner, request).await,
                    None => Response::error(request.id, "node is shutting down"),
                }
            }
        })
        .await;
    });
    Connection::with_timeout(client_side, call_timeout)
}

/// Heartbeat period after `failures` consecutive failed registrations:
/// grows linearly from `base`, capped at `max`.
pub(crate) fn backoff_interval(base: Duration, max: Duration, failures: u32) -> Duration {
    base.saturating_mul(failures.saturating_add(1)).min(max)
}

/// Periodically re-registers this node with the naming directories.
///
/// Runs until shutdown. An `activate` message forces an immediate attempt;
/// otherwise the timer fires at the base interval, stretched by the linear
/// backoff while registrations keep failing and snapped back to the base on
/// the first success.
async fn heartbeat_loop(
    inner: Arc<NodeInner>,
    mut activate_rx: mpsc::Receiver<()>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let base = inner.config.heartbeat_interval;
    let max = inner.config.heartbeat_max;
    let mut failures: u32 = 0;

    let timer = tokio::time::sleep(base);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            _ = activate_rx.recv() => {}
            _ = &mut timer => {}
        }

        match register_with_directory(&inner).await {
            Ok(()) => {
                if failures > 0 {
                    info!(addr = %inner.self_addr, "directory registration recovered");
                }
                failures = 0;
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                warn!(addr = %inner.self_addr, %failures, error = %e, "directory registration failed");
            }
        }

        timer
            .as_mut()
            .reset(Instant::now() + backoff_interval(base, max, failures));
    }
}

/// One registration attempt: `Register` with every reachable directory
/// provider, so replicated directories all learn about this node.
///
/// Providers are resolved through the usual fan-out, which consults the
/// configured naming factory for the `NamingService` name. Clients are
/// released best-effort; the first registration error wins.
async fn register_with_directory(inner: &Arc<NodeInner>) -> Result<()> {
    let node = Node {
        inner: inner.clone(),
    };

    let info = RegisterInfo {
        addr: inner.self_addr.clone(),
        provides: inner.services.read().await.list(),
    };
    let args = serde_json::to_value(&info)?;

    let clients = node.get_services(NAMING_SERVICE).await?;
    if clients.is_empty() {
        return Err(RpcError::DirectoryUnavailable(
            "no reachable directory providers".to_string(),
        ));
    }

    let mut first_err = None;
    for mut client in clients {
        let called = client.call("Register", args.clone()).await;
        let _ = client.close().await;
        if let Err(e) = called {
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

/// The node's control surface, reachable as `NodeService.*` from peers.
///
/// `Invite(addr)` pulls this node into the inviter's cluster: join the
/// inviter, adopt its directory, register immediately. `Bye(addr)` drops a
/// departing peer's pool.
struct NodeService {
    node: Weak<NodeInner>,
}

#[async_trait]
impl Service for NodeService {
    fn name(&self) -> &str {
        NODE_SERVICE
    }

    async fn dispatch(&self, method: &str, args: Value) -> Result<Value> {
        let inner = self
            .node
            .upgrade()
            .ok_or_else(|| RpcError::Application("node is shutting down".to_string()))?;
        let node = Node { inner };

        match method {
            "Invite" => {
                let inviter: String = serde_json::from_value(args)
                    .map_err(|e| RpcError::Application(format!("invalid inviter addr: {e}")))?;
                info!(%inviter, "joining cluster");
                node.join(&inviter).await?;
                node.set_naming_factory(node.naming_factory_for(inviter)).await;
                node.activate();
                Ok(Value::Null)
            }
            "Bye" => {
                let addr: String = serde_json::from_value(args)
                    .map_err(|e| RpcError::Application(format!("invalid peer addr: {e}")))?;
                info!(%addr, "peer departing");
                node.leave(&addr).await?;
                Ok(Value::Null)
            }
            other => Err(RpcError::Application(format!(
                "unknown method: NodeService.{other}"
            ))),
        }
    }
}
