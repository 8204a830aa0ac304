//! The reserved `_meta` sub-object and progress tokens.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Caller-chosen identifier attached to a request so the peer can report progress.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressToken {
    Number(i64),
    String(String),
}

impl fmt::Display for ProgressToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// The `_meta` object. On requests it may carry a progress token; anywhere
/// else it is free-form. Unknown keys are preserved in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_token: Option<ProgressToken>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Params for messages that carry nothing but an optional `_meta`
/// (list-changed notifications, `initialized`, `roots/list`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmptyParams {
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

/// Read `_meta.progressToken` out of raw request params.
pub fn progress_token(params: Option<&Value>) -> Option<ProgressToken> {
    let token = params?.get("_meta")?.get("progressToken")?;
    serde_json::from_value(token.clone()).ok()
}

/// Set `_meta.progressToken` on raw request params, keeping every other key.
///
/// `null` params become an object. Returns `false` if params are some other
/// non-object value, which cannot carry `_meta`.
pub fn attach_progress_token(params: &mut Value, token: &ProgressToken) -> bool {
    if params.is_null() {
        *params = Value::Object(Map::new());
    }
    let Some(object) = params.as_object_mut() else {
        return false;
    };
    let meta = object
        .entry("_meta")
        .or_insert_with(|| Value::Object(Map::new()));
    if !meta.is_object() {
        *meta = Value::Object(Map::new());
    }
    if let Some(meta) = meta.as_object_mut() {
        meta.insert(
            "progressToken".to_string(),
            serde_json::to_value(token).unwrap_or(Value::Null),
        );
    }
    true
}
