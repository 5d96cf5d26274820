use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::debug;

use crate::protocol::error::{Result, RpcError};
use crate::protocol::{Request, Response};
use crate::transport::codec::JsonCodec;
use crate::transport::frame::{read_frame, write_frame};
use crate::transport::stream::RpcStream;

/// Serves request/response frames on one stream until the peer hangs up.
///
/// Connections are keep-alive: a single stream carries any number of
/// sequential exchanges. Requests that fail to decode are answered with an
/// error response (id 0, since the real id is unknown) and the stream is
/// kept open.
pub async fn serve_stream<S, F, Fut>(mut stream: S, handler: F) -> Result<()>
where
    S: RpcStream,
    F: Fn(Request) -> Fut,
    Fut: Future<Output = Response>,
{
    loop {
        let data = match read_frame(&mut stream).await {
            Ok(data) => data,
            Err(RpcError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let response = match JsonCodec::decode_request(&data) {
            Ok(request) => handler(request).await,
            Err(e) => {
                debug!(error = %e, "failed to decode request");
                Response::error(0, e.to_string())
            }
        };

        let encoded = JsonCodec::encode_response(&response)?;
        write_frame(&mut stream, &encoded).await?;
    }
}

/// TCP accept loop for a node's RPC endpoint.
///
/// Binds eagerly so callers can learn the ephemeral port before the accept
/// loop starts, then spawns one [`serve_stream`] task per connection.
pub struct RpcServer {
    listener: TcpListener,
}

impl RpcServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RpcError::Transport(format!("failed to bind to {addr}: {e}")))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| RpcError::Transport(format!("failed to get local addr: {e}")))
    }

    /// Accepts connections forever, dispatching each request through
    /// `handler`.
    pub async fn run<F, Fut>(self, handler: F) -> Result<()>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        let handler = Arc::new(handler);
        loop {
            let (stream, peer_addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| RpcError::Transport(format!("accept failed: {e}")))?;
            debug!(%peer_addr, "connection accepted");

            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_stream(stream, move |request| (*handler)(request)).await {
                    debug!(error = %e, "connection ended with error");
                }
            });
        }
    }
}
