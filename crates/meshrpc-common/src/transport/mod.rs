//! Framed stream transport.
//!
//! The transport is deliberately stream-agnostic: [`Connection`] and
//! [`serve_stream`] work over anything that is `AsyncRead + AsyncWrite`, so
//! the in-process loopback path a node uses to call itself exercises the
//! identical codec and dispatch logic as a real TCP peer.

mod codec;
mod frame;
mod server;
mod stream;

pub use codec::JsonCodec;
pub use frame::{read_frame, write_frame, MAX_FRAME_SIZE};
pub use server::{serve_stream, RpcServer};
pub use stream::{connect, Connection, RpcStream, DEFAULT_CALL_TIMEOUT};
