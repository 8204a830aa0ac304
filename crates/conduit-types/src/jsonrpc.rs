//! JSON-RPC 2.0 envelope types.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// JSON-RPC version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// A request identifier: JSON-RPC allows either a string or a number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self::Number(id)
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self::String(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self::String(id.to_string())
    }
}

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 response. Exactly one of `result` / `error` is set.
///
/// `id` is `None` (serialized as `null`) only for errors that could not be
/// attributed to a request, e.g. a parse error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, error: ErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Build a response from a handler outcome.
    pub fn from_outcome(id: RequestId, outcome: Result<Value, ErrorObject>) -> Self {
        match outcome {
            Ok(result) => Self::success(id, result),
            Err(error) => Self::failure(Some(id), error),
        }
    }

    /// Get the result, or the error object if this is an error response.
    ///
    /// A response carrying neither is treated as a `null` result.
    pub fn into_result(self) -> Result<Value, ErrorObject> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// Standard JSON-RPC error codes
impl ErrorObject {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// MCP: the requested resource does not exist.
    pub const RESOURCE_NOT_FOUND: i64 = -32002;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(Self::PARSE_ERROR, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }

    pub fn resource_not_found(uri: &str) -> Self {
        Self::new(Self::RESOURCE_NOT_FOUND, format!("Resource not found: {uri}"))
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Any inbound JSON-RPC message, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

impl JsonRpcMessage {
    /// Classify a parsed JSON value.
    ///
    /// A `method` with a non-null `id` is a request, a `method` without one is
    /// a notification, and `result`/`error` with an `id` is a response. On
    /// failure the id (when recoverable) is returned alongside the error so the
    /// caller can answer with `invalid request`.
    pub fn classify(value: Value) -> Result<Self, (Option<RequestId>, DecodeError)> {
        let id = match value.get("id") {
            None | Some(Value::Null) => None,
            Some(raw) => match serde_json::from_value::<RequestId>(raw.clone()) {
                Ok(id) => Some(id),
                Err(_) => {
                    return Err((
                        None,
                        DecodeError::InvalidMessage("id must be a string or number".to_string()),
                    ));
                }
            },
        };

        if value.get("method").is_some() {
            let shape = if id.is_some() {
                serde_json::from_value(value).map(Self::Request)
            } else {
                serde_json::from_value(value).map(Self::Notification)
            };
            return shape.map_err(|e| (id, DecodeError::InvalidMessage(e.to_string())));
        }

        if value.get("result").is_some() || value.get("error").is_some() {
            return serde_json::from_value(value)
                .map(Self::Response)
                .map_err(|e| (id, DecodeError::InvalidMessage(e.to_string())));
        }

        Err((
            id,
            DecodeError::InvalidMessage("expected a request, notification or response".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serialize_request_with_params() {
        let req = JsonRpcRequest::new(1, "tools/call", Some(json!({"name": "read"})));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 1);
        assert_eq!(json["method"], "tools/call");
        assert!(json["params"].is_object());
    }

    #[test]
    fn serialize_request_without_params() {
        let req = JsonRpcRequest::new("abc", "tools/list", None);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["id"], "abc");
        assert!(json.get("params").is_none());
    }

    #[test]
    fn serialize_notification_has_no_id() {
        let notif = JsonRpcNotification::new("notifications/initialized", None);
        let json = serde_json::to_value(&notif).unwrap();
        assert_eq!(json["method"], "notifications/initialized");
        assert!(json.get("id").is_none());
        assert!(json.get("params").is_none());
    }

    #[test]
    fn error_response_serializes_error_object() {
        let resp = JsonRpcResponse::failure(
            Some(RequestId::Number(7)),
            ErrorObject::method_not_found("bogus"),
        );
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["error"]["code"], -32601);
        assert!(json.get("result").is_none());
    }

    #[test]
    fn parse_error_response_has_null_id() {
        let resp = JsonRpcResponse::failure(None, ErrorObject::parse_error("bad json"));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"id\":null"));
    }

    #[test]
    fn into_result_prefers_error() {
        let json = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32600,"message":"Invalid","data":"extra"}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.code, ErrorObject::INVALID_REQUEST);
        assert_eq!(err.data.unwrap(), "extra");
    }

    #[test]
    fn classify_request_notification_response() {
        let req = JsonRpcMessage::classify(json!({"jsonrpc":"2.0","id":"x","method":"ping"})).unwrap();
        assert!(matches!(req, JsonRpcMessage::Request(r) if r.id == RequestId::from("x")));

        let notif =
            JsonRpcMessage::classify(json!({"jsonrpc":"2.0","method":"notifications/progress"}))
                .unwrap();
        assert!(matches!(notif, JsonRpcMessage::Notification(_)));

        let resp = JsonRpcMessage::classify(json!({"jsonrpc":"2.0","id":3,"result":{}})).unwrap();
        assert!(matches!(resp, JsonRpcMessage::Response(r) if r.id == Some(RequestId::Number(3))));
    }

    #[test]
    fn classify_null_id_with_method_is_notification() {
        let msg =
            JsonRpcMessage::classify(json!({"jsonrpc":"2.0","id":null,"method":"x"})).unwrap();
        assert!(matches!(msg, JsonRpcMessage::Notification(_)));
    }

    #[test]
    fn classify_garbage_keeps_id_for_reply() {
        let (id, err) = JsonRpcMessage::classify(json!({"jsonrpc":"2.0","id":5})).unwrap_err();
        assert_eq!(id, Some(RequestId::Number(5)));
        assert!(matches!(err, DecodeError::InvalidMessage(_)));
    }

    #[test]
    fn request_id_display() {
        assert_eq!(RequestId::Number(42).to_string(), "42");
        assert_eq!(RequestId::from("req-1").to_string(), "req-1");
    }
}
