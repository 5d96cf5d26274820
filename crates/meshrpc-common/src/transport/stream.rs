use std::net::ToSocketAddrs;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::error::{Result, RpcError};
use crate::protocol::Request;
use crate::transport::codec::JsonCodec;
use crate::transport::frame::{read_frame, write_frame};

/// Default deadline for a single outbound call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Any full-duplex byte stream a [`Connection`] can run over.
pub trait RpcStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RpcStream for T {}

/// A client-side RPC connection over one full-duplex stream.
///
/// Calls are strictly request/response: one frame out, one frame in. The
/// stream may be a TCP socket or an in-process duplex half — the framing and
/// classification logic is identical either way.
pub struct Connection {
    stream: Box<dyn RpcStream>,
    call_timeout: Duration,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl Connection {
    pub fn new(stream: impl RpcStream + 'static) -> Self {
        Self::with_timeout(stream, DEFAULT_CALL_TIMEOUT)
    }

    pub fn with_timeout(stream: impl RpcStream + 'static, call_timeout: Duration) -> Self {
        Connection {
            stream: Box::new(stream),
            call_timeout,
        }
    }

    /// Invokes `method` with `args` and waits for the reply.
    ///
    /// A `success = false` reply maps to [`RpcError::Application`]; frame,
    /// decode, and deadline failures map to transport-class errors. Callers
    /// use that distinction to decide whether this connection is still worth
    /// keeping.
    pub async fn call(&mut self, method: &str, args: Value) -> Result<Value> {
        let request = Request::new(method, args);
        let stream = &mut self.stream;

        let exchange = async {
            let encoded = JsonCodec::encode_request(&request)?;
            write_frame(stream, &encoded).await?;
            let data = read_frame(stream).await?;
            JsonCodec::decode_response(&data)
        };

        let response = tokio::time::timeout(self.call_timeout, exchange)
            .await
            .map_err(|_| RpcError::Timeout(self.call_timeout.as_millis() as u64))??;

        if response.id != request.id {
            return Err(RpcError::Transport(format!(
                "response id {} does not match request id {}",
                response.id, request.id
            )));
        }

        if response.success {
            Ok(response.result.unwrap_or(Value::Null))
        } else {
            Err(RpcError::Application(
                response
                    .error
                    .unwrap_or_else(|| "unknown remote error".to_string()),
            ))
        }
    }

    /// Shuts the underlying stream down.
    pub async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// TCP connection factory: resolves `addr` and tries each candidate address
/// until one connects.
pub async fn connect(addr: &str, call_timeout: Duration) -> Result<Connection> {
    let socket_addrs = addr
        .to_socket_addrs()
        .map_err(|e| RpcError::Transport(format!("invalid address '{addr}': {e}")))?;

    let mut last_err = None;
    for socket_addr in socket_addrs {
        match TcpStream::connect(socket_addr).await {
            Ok(stream) => return Ok(Connection::with_timeout(stream, call_timeout)),
            Err(e) => last_err = Some(e),
        }
    }

    Err(RpcError::Transport(format!(
        "failed to connect to {addr}: {}",
        last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no addresses resolved".to_string())
    )))
}
