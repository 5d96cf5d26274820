//! Core protocol types: requests, responses, and errors.

pub mod error;

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

pub type RequestId = u64;

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A named-method invocation sent from a client to a node.
///
/// Methods are addressed as `Service.Method` (e.g. `NamingService.Register`);
/// arguments travel as a single JSON value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub args: serde_json::Value,
}

impl Request {
    pub fn new(method: impl Into<String>, args: serde_json::Value) -> Self {
        Request {
            id: next_request_id(),
            method: method.into(),
            args,
        }
    }
}

/// Combine a timestamp with a process-wide counter so ids stay unique even
/// when the clock is coarse.
fn next_request_id() -> RequestId {
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let counter = REQUEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst);
    (timestamp & 0xFFFF_FFFF_0000_0000) | (counter & 0xFFFF_FFFF)
}

/// The reply to a [`Request`].
///
/// `success == false` means the remote handler itself rejected the call — an
/// application-level error that says nothing about the health of the
/// connection that carried it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    /// Request identifier this response corresponds to.
    pub id: RequestId,
    /// Result value (present on success).
    pub result: Option<serde_json::Value>,
    /// Error message (present on failure).
    pub error: Option<String>,
    /// Whether the handler succeeded.
    pub success: bool,
}

impl Response {
    pub fn success(id: RequestId, result: serde_json::Value) -> Self {
        Response {
            id,
            result: Some(result),
            error: None,
            success: true,
        }
    }

    pub fn error(id: RequestId, error: impl Into<String>) -> Self {
        Response {
            id,
            result: None,
            error: Some(error.into()),
            success: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_ids_are_unique() {
        let a = Request::new("Svc.Method", json!(null));
        let b = Request::new("Svc.Method", json!(null));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn response_constructors() {
        let ok = Response::success(7, json!({"x": 1}));
        assert!(ok.success);
        assert_eq!(ok.result, Some(json!({"x": 1})));
        assert!(ok.error.is_none());

        let err = Response::error(7, "boom");
        assert!(!err.success);
        assert_eq!(err.error, Some("boom".to_string()));
        assert!(err.result.is_none());
    }

    #[test]
    fn request_serialization_round_trip() {
        let request = Request::new("NodeService.Invite", json!("127.0.0.1:9000"));
        let bytes = serde_json::to_vec(&request).unwrap();
        let decoded: Request = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(request, decoded);
    }
}
