//! Decode errors for inbound protocol messages.

use crate::jsonrpc::ErrorObject;
use thiserror::Error;

/// Failure to turn a `(method, params)` pair into one of the typed message unions.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Unknown method: {method}")]
    UnknownMethod { method: String },

    #[error("Invalid params for '{method}': {source}")]
    InvalidParams {
        method: String,
        source: serde_json::Error,
    },

    #[error("Invalid JSON-RPC message: {0}")]
    InvalidMessage(String),
}

impl DecodeError {
    /// The method name this error refers to, if any.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::UnknownMethod { method } | Self::InvalidParams { method, .. } => Some(method),
            Self::InvalidMessage(_) => None,
        }
    }
}

impl From<&DecodeError> for ErrorObject {
    fn from(err: &DecodeError) -> Self {
        match err {
            DecodeError::UnknownMethod { method } => ErrorObject::method_not_found(method),
            DecodeError::InvalidParams { .. } => ErrorObject::invalid_params(err.to_string()),
            DecodeError::InvalidMessage(msg) => ErrorObject::invalid_request(msg.clone()),
        }
    }
}

impl From<DecodeError> for ErrorObject {
    fn from(err: DecodeError) -> Self {
        ErrorObject::from(&err)
    }
}
