use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use meshrpc_common::{Result, RpcError};

use crate::monitor::{Monitor, MonitorConfig};
use crate::registry::Service;

/// Conventional name the directory's RPC surface registers under.
pub const NAMING_SERVICE: &str = "NamingService";

/// Payload of a `NamingService.Register` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterInfo {
    pub addr: String,
    pub provides: Vec<String>,
}

type NameDigest = [u8; 32];

/// Content hash over an advertised name list, used to detect no-op
/// re-registrations.
fn digest_of(provides: &[String]) -> NameDigest {
    let mut hasher = Sha256::new();
    for name in provides {
        hasher.update(name.as_bytes());
        // NUL separator keeps ["ab","c"] distinct from ["a","bc"].
        hasher.update([0u8]);
    }
    hasher.finalize().into()
}

struct RecordEntry {
    digest: NameDigest,
    provides: Vec<String>,
}

#[derive(Default)]
struct DirState {
    records: HashMap<String, RecordEntry>,
    /// Set by every mutation; the derived view is rebuilt lazily on the
    /// next query.
    modified: bool,
    view: HashMap<String, Vec<String>>,
}

/// The naming directory: registration records plus liveness tracking.
///
/// Registration content (what a provider offers, deduplicated by digest)
/// and liveness (is the provider still heartbeating) are tracked
/// separately: a re-registration with unchanged content skips all record
/// and view work but still refreshes the liveness timestamp, so a provider
/// whose service list never changes stays alive. Providers that stop
/// refreshing are evicted by the [`Monitor`] within one deadline window.
pub struct NamingDirectory {
    state: Arc<Mutex<DirState>>,
    monitor: Monitor,
    reaper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl NamingDirectory {
    pub fn new(config: MonitorConfig) -> Arc<Self> {
        let (monitor, mut dead_rx) = Monitor::spawn(config);
        let state = Arc::new(Mutex::new(DirState {
            modified: true,
            ..DirState::default()
        }));

        // Consume the monitor's dead reports until end-of-stream.
        let reaper_state = state.clone();
        let reaper = tokio::spawn(async move {
            while let Some(addr) = dead_rx.recv().await {
                let mut state = reaper_state.lock().await;
                if state.records.remove(&addr).is_some() {
                    state.modified = true;
                    info!(%addr, "evicted stale provider");
                }
            }
        });

        Arc::new(NamingDirectory {
            state,
            monitor,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    /// Creates or refreshes the registration record for `addr`.
    ///
    /// Identical content is a no-op for the record and the derived view;
    /// liveness is refreshed either way, since unchanged re-registrations
    /// arrive on every heartbeat.
    pub async fn register(&self, addr: &str, provides: Vec<String>) {
        let digest = digest_of(&provides);
        let changed = {
            let mut state = self.state.lock().await;
            match state.records.get(addr) {
                Some(entry) if entry.digest == digest => false,
                _ => {
                    state
                        .records
                        .insert(addr.to_string(), RecordEntry { digest, provides });
                    state.modified = true;
                    true
                }
            }
        };
        self.monitor.touch(addr).await;
        if changed {
            debug!(%addr, "registration updated");
        }
    }

    /// Deletes the record for `addr` and cancels its liveness tracking so
    /// no duplicate eviction fires later. Idempotent.
    pub async fn remove(&self, addr: &str) {
        {
            let mut state = self.state.lock().await;
            if state.records.remove(addr).is_some() {
                state.modified = true;
            }
        }
        self.monitor.forget(addr).await;
    }

    /// Provider addresses for a service name, derived from the active
    /// records. The view is cached and rebuilt only after a mutation, so a
    /// reader always sees its own writes.
    pub async fn query(&self, name: &str) -> Vec<String> {
        let mut state = self.state.lock().await;
        if state.modified {
            let mut view: HashMap<String, Vec<String>> = HashMap::new();
            for (addr, entry) in &state.records {
                for service in &entry.provides {
                    view.entry(service.clone()).or_default().push(addr.clone());
                }
            }
            state.view = view;
            state.modified = false;
        }
        state.view.get(name).cloned().unwrap_or_default()
    }

    /// Shuts down the monitor loop and the eviction consumer.
    pub async fn close(&self) {
        self.monitor.close().await;
        let reaper = self.reaper.lock().await.take();
        if let Some(reaper) = reaper {
            let _ = reaper.await;
        }
    }
}

/// RPC surface of the directory: `Register(RegisterInfo)` and
/// `Query(name) -> [addr]`.
pub struct NamingService {
    directory: Arc<NamingDirectory>,
}

impl NamingService {
    pub fn new(directory: Arc<NamingDirectory>) -> Self {
        NamingService { directory }
    }
}

#[async_trait]
impl Service for NamingService {
    fn name(&self) -> &str {
        NAMING_SERVICE
    }

    async fn dispatch(&self, method: &str, args: Value) -> Result<Value> {
        match method {
            "Register" => {
                let info: RegisterInfo = serde_json::from_value(args)
                    .map_err(|e| RpcError::Application(format!("invalid RegisterInfo: {e}")))?;
                self.directory.register(&info.addr, info.provides).await;
                Ok(Value::Null)
            }
            "Query" => {
                let name: String = serde_json::from_value(args)
                    .map_err(|e| RpcError::Application(format!("invalid query name: {e}")))?;
                Ok(serde_json::to_value(self.directory.query(&name).await)?)
            }
            other => Err(RpcError::Application(format!(
                "unknown method: NamingService.{other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn test_config() -> MonitorConfig {
        MonitorConfig {
            tick: Duration::from_millis(50),
            deadline: Duration::from_millis(120),
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn register_and_query() {
        let dir = NamingDirectory::new(MonitorConfig::default());
        dir.register("n1:9000", names(&["NodeService", "Compute"]))
            .await;
        dir.register("n2:9000", names(&["NodeService"])).await;

        let mut providers = dir.query("NodeService").await;
        providers.sort();
        assert_eq!(providers, vec!["n1:9000", "n2:9000"]);
        assert_eq!(dir.query("Compute").await, vec!["n1:9000"]);
        assert!(dir.query("Unknown").await.is_empty());

        dir.close().await;
    }

    #[tokio::test]
    async fn identical_reregistration_leaves_the_view_unchanged() {
        let dir = NamingDirectory::new(MonitorConfig::default());
        dir.register("n1:9000", names(&["a", "b"])).await;
        assert_eq!(dir.query("a").await, vec!["n1:9000"]);

        // No-op: same content, no view invalidation.
        dir.register("n1:9000", names(&["a", "b"])).await;
        assert!(!dir.state.lock().await.modified);
        assert_eq!(dir.query("a").await, vec!["n1:9000"]);
        assert_eq!(dir.query("b").await, vec!["n1:9000"]);

        dir.close().await;
    }

    #[tokio::test]
    async fn changed_content_replaces_the_record() {
        let dir = NamingDirectory::new(MonitorConfig::default());
        dir.register("n1:9000", names(&["a", "b"])).await;
        dir.register("n1:9000", names(&["a", "c"])).await;

        assert_eq!(dir.query("a").await, vec!["n1:9000"]);
        assert!(dir.query("b").await.is_empty());
        assert_eq!(dir.query("c").await, vec!["n1:9000"]);

        dir.close().await;
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_clears_the_view() {
        let dir = NamingDirectory::new(MonitorConfig::default());
        dir.register("n1:9000", names(&["a"])).await;
        dir.remove("n1:9000").await;
        dir.remove("n1:9000").await;
        assert!(dir.query("a").await.is_empty());
        dir.close().await;
    }

    #[tokio::test]
    async fn stale_provider_is_evicted() {
        let dir = NamingDirectory::new(test_config());
        dir.register("n1:9000", names(&["a"])).await;
        assert_eq!(dir.query("a").await, vec!["n1:9000"]);

        // Never refreshed: gone within a few ticks past the deadline.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(dir.query("a").await.is_empty());

        dir.close().await;
    }

    #[tokio::test]
    async fn unchanged_heartbeats_keep_a_provider_alive() {
        let dir = NamingDirectory::new(test_config());

        // Identical content every 40ms for a full second: the record dedup
        // must not starve the liveness refresh.
        for _ in 0..25 {
            dir.register("n1:9000", names(&["a"])).await;
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        assert_eq!(dir.query("a").await, vec!["n1:9000"]);

        dir.close().await;
    }

    #[tokio::test]
    async fn digest_distinguishes_name_boundaries() {
        assert_ne!(digest_of(&names(&["ab", "c"])), digest_of(&names(&["a", "bc"])));
        assert_ne!(digest_of(&names(&["a", "b"])), digest_of(&names(&["b", "a"])));
        assert_eq!(digest_of(&names(&["a", "b"])), digest_of(&names(&["a", "b"])));
    }

    #[tokio::test]
    async fn naming_service_dispatch() {
        let dir = NamingDirectory::new(MonitorConfig::default());
        let svc = NamingService::new(dir.clone());

        svc.dispatch(
            "Register",
            json!({"addr": "n1:9000", "provides": ["NodeService"]}),
        )
        .await
        .unwrap();

        let value = svc.dispatch("Query", json!("NodeService")).await.unwrap();
        assert_eq!(value, json!(["n1:9000"]));

        let err = svc.dispatch("Register", json!(42)).await.unwrap_err();
        assert!(err.is_application());

        let err = svc.dispatch("Evict", json!(null)).await.unwrap_err();
        assert!(err.is_application());

        dir.close().await;
    }
}
