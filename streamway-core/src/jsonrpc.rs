//! JSON-RPC 2.0 envelopes used on the wire between clients, the gateway and
//! the child process.
//!
//! Client bodies and child output lines are handled as raw `serde_json::Value`
//! so that they can be forwarded verbatim. The types here cover the envelopes
//! the gateway itself produces: normalized replies, broadcast notifications
//! and gateway-synthesized errors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Request body could not be parsed as a JSON object.
pub const PARSE_ERROR: i64 = -32700;
/// Generic gateway error (missing session, timeout, bad method, ...).
pub const GATEWAY_ERROR: i64 = -32000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// Normalized reply envelope built from a child output line that carries an
/// `id`. `result` is always present (possibly null), `error` only when the
/// child actually reported one, and `id` is the child's id verbatim so the
/// original string/number type is preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub id: Value,
}

impl JsonRpcResponse {
    pub fn from_child(message: &Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: message.get("result").cloned().unwrap_or(Value::Null),
            error: message.get("error").filter(|e| !e.is_null()).cloned(),
            id: message.get("id").cloned().unwrap_or(Value::Null),
        }
    }
}

/// Notification envelope broadcast to SSE streams when a child output line
/// carries no `id`. `params` is dropped entirely when null.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn from_child(message: &Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: message
                .get("method")
                .and_then(|m| m.as_str())
                .unwrap_or_default()
                .to_string(),
            params: message.get("params").filter(|p| !p.is_null()).cloned(),
        }
    }
}

/// Error envelope the gateway synthesizes itself (parse errors, unknown
/// sessions, timeouts). Unlike [`JsonRpcResponse`] it carries no `result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorResponse {
    pub jsonrpc: String,
    pub error: JsonRpcError,
    pub id: Value,
}

impl JsonRpcErrorResponse {
    pub fn new(code: i64, message: impl Into<String>, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            error: JsonRpcError {
                code,
                message: message.into(),
            },
            id,
        }
    }
}

/// The `id` of a message, if it carries a usable one. A null id counts as
/// absent; only the gateway itself puts null ids on the wire, in error
/// envelopes.
pub fn request_id(message: &Value) -> Option<&Value> {
    message.get("id").filter(|id| !id.is_null())
}

/// Stringified form of a JSON-RPC id, used as the correlation key for
/// pending requests and response slots.
///
/// String ids map to their bare contents, so numeric `1` and string `"1"`
/// share a key and the later registration overwrites the earlier one.
/// Callers must not mix the two forms for concurrent requests.
pub fn correlation_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
