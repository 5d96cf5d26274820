//! meshrpc protocol types and transport.
//!
//! This crate provides the shared wire protocol and the framed stream
//! transport used by every meshrpc component:
//!
//! - **Protocol layer**: [`Request`]/[`Response`] types and the [`RpcError`]
//!   taxonomy whose application/transport split drives connection reuse.
//! - **Transport layer**: a length-prefixed JSON frame codec that works over
//!   any full-duplex byte stream — a TCP socket for remote peers, or an
//!   in-process duplex pair for a node calling itself.
//!
//! # Wire format
//!
//! Every message is `[4-byte length prefix as u32 big-endian] + [JSON data]`.
//! Frames are capped at 1 MB to bound allocations.

pub mod protocol;
pub mod transport;

pub use protocol::error::{Result, RpcError};
pub use protocol::{Request, Response};
