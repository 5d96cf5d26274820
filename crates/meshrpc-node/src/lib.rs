//! Node-side runtime for meshrpc.
//!
//! A [`Node`] owns one process's identity in the cluster: its local
//! [`ServiceRegistry`], a peer registry with one connection pool per remote
//! address, and a heartbeat loop that keeps the cluster's
//! [`NamingDirectory`] informed of what this node provides. The directory
//! itself (hosted by whichever node carries the [`NamingService`]) pairs the
//! registration records with a [`Monitor`] that evicts providers that stop
//! refreshing.

mod monitor;
mod naming;
mod node;
mod registry;

pub use monitor::{Monitor, MonitorConfig};
pub use naming::{NamingDirectory, NamingService, RegisterInfo, NAMING_SERVICE};
pub use node::{NamingFactory, Node, NodeConfig, NODE_SERVICE};
pub use registry::{Service, ServiceRegistry};
