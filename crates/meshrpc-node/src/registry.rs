use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use meshrpc_common::Result;

/// A callable service exposed by a node.
///
/// Handler-logic failures are returned as `RpcError::Application` so they
/// reach the remote caller verbatim without retiring the connection that
/// carried them.
#[async_trait]
pub trait Service: Send + Sync {
    /// Name the service registers under by default.
    fn name(&self) -> &str;

    /// Invokes `method` (already stripped of the service prefix).
    async fn dispatch(&self, method: &str, args: Value) -> Result<Value>;
}

/// Ordered mapping of service name to handler, local to one node.
///
/// One structure serves both needs: the entry list preserves registration
/// order (duplicates included) for the "what I provide" advertisement, while
/// the index makes the latest registration under a name authoritative for
/// dispatch. Registries are built at node startup; there is no removal.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: Vec<(String, Arc<dyn Service>)>,
    index: HashMap<String, Arc<dyn Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service under its declared name.
    pub fn register(&mut self, service: Arc<dyn Service>) {
        let name = service.name().to_string();
        self.register_name(name, service);
    }

    /// Registers a service under an alias distinct from its declared name.
    pub fn register_name(&mut self, name: impl Into<String>, service: Arc<dyn Service>) {
        let name = name.into();
        self.entries.push((name.clone(), service.clone()));
        self.index.insert(name, service);
    }

    /// All registered names in registration order. This is exactly what the
    /// node advertises in its registration payloads.
    pub fn list(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.index.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
