use crate::protocol::error::Result;
use crate::protocol::{Request, Response};

/// JSON codec for encoding/decoding RPC messages.
///
/// The payload inside each frame is plain JSON so that `serde_json::Value`
/// arguments and results pass through untouched.
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(request)?)
    }

    pub fn decode_request(data: &[u8]) -> Result<Request> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn encode_response(response: &Response) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(response)?)
    }

    pub fn decode_response(data: &[u8]) -> Result<Response> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trip() {
        let request = Request::new("NamingService.Query", json!("NodeService"));
        let encoded = JsonCodec::encode_request(&request).unwrap();
        let decoded = JsonCodec::decode_request(&encoded).unwrap();
        assert_eq!(request, decoded);
    }

    #[test]
    fn response_round_trip() {
        let response = Response::success(42, json!(["127.0.0.1:9001"]));
        let encoded = JsonCodec::encode_response(&response).unwrap();
        let decoded = JsonCodec::decode_response(&encoded).unwrap();
        assert_eq!(response, decoded);
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(JsonCodec::decode_request(b"not json").is_err());
        assert!(JsonCodec::decode_response(b"{\"partial\":").is_err());
    }
}
