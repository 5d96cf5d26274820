use thiserror::Error;

/// Error taxonomy for the meshrpc runtime.
///
/// The split that matters is [`RpcError::Application`] versus everything
/// else: an application error is a well-formed reply from a remote handler's
/// own logic and leaves the connection that carried it perfectly healthy.
/// Every other failure is treated as transport-class and retires the
/// connection it occurred on.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Operation attempted after the pool was closed.
    #[error("pool is closed")]
    PoolClosed,

    /// Lookup for an address that was never joined.
    #[error("not found node: {0}")]
    PeerNotFound(String),

    /// Connection-level failure: refused, reset, bad frame, handshake error.
    #[error("transport error: {0}")]
    Transport(String),

    /// An outbound call exceeded its deadline.
    #[error("call timed out after {0}ms")]
    Timeout(u64),

    /// Error returned by the remote handler itself. Propagated verbatim;
    /// never retires the connection.
    #[error("{0}")]
    Application(String),

    /// No naming directory factory configured, or the directory unreachable.
    #[error("naming directory unavailable: {0}")]
    DirectoryUnavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// Whether this error came from the remote handler's own logic rather
    /// than the machinery carrying the call.
    pub fn is_application(&self) -> bool {
        matches!(self, RpcError::Application(_))
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_errors_are_classified() {
        assert!(RpcError::Application("not found".into()).is_application());
        assert!(!RpcError::Transport("reset".into()).is_application());
        assert!(!RpcError::Timeout(5000).is_application());
        assert!(!RpcError::PoolClosed.is_application());
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: RpcError = io.into();
        assert!(matches!(err, RpcError::Io(_)));
    }
}
