//! meshrpc — a peer-to-peer RPC runtime.
//!
//! Every process ("node") exposes callable services, discovers other nodes
//! through a shared naming directory, and keeps pooled, failure-classified
//! connections to its peers. The workspace is split into three crates:
//!
//! - [`meshrpc_common`] — wire protocol, error taxonomy, framed transport
//! - [`meshrpc_client`] — connection pool, wrapper client, peer registry
//! - [`meshrpc_node`] — service registry, naming directory, node orchestrator
//!
//! This facade crate re-exports the pieces most applications need.

pub use meshrpc_common::{Request, Response, Result, RpcError};

pub use meshrpc_client::{Client, Clients, PeerRegistry, Pool};

pub use meshrpc_node::{
    Monitor, MonitorConfig, NamingDirectory, NamingService, Node, NodeConfig, RegisterInfo,
    Service, ServiceRegistry, NAMING_SERVICE, NODE_SERVICE,
};
