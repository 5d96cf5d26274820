//! Pooled RPC clients for meshrpc.
//!
//! [`Pool`] keeps a bounded set of lazily-created connections to one peer;
//! [`Client`] is the leased, failure-classifying view over one of them; and
//! [`PeerRegistry`] owns one pool per joined peer address.

mod peers;
mod pool;

pub use peers::{PeerConnectFn, PeerRegistry};
pub use pool::{Client, Clients, ConnectFn, ConnectFuture, Pool};
