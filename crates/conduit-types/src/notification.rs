//! Params for notifications shared by both directions.

use crate::jsonrpc::RequestId;
use crate::meta::{Meta, ProgressToken};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressParams {
    pub progress_token: ProgressToken,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUpdatedParams {
    pub uri: String,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn progress_wire_shape() {
        let params = ProgressParams {
            progress_token: ProgressToken::String("tok".into()),
            progress: 0.5,
            total: None,
            meta: None,
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json, json!({"progressToken": "tok", "progress": 0.5}));
    }

    #[test]
    fn cancelled_accepts_numeric_id() {
        let params: CancelledParams =
            serde_json::from_value(json!({"requestId": 4, "reason": "timeout"})).unwrap();
        assert_eq!(params.request_id, RequestId::Number(4));
        assert_eq!(params.reason.as_deref(), Some("timeout"));
    }
}
