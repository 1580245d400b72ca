//! JSON-RPC 2.0 framing: one JSON object per line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Error code returned for agent requests the client does not implement.
pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to one of our requests.
    Response {
        id: u64,
        result: Result<Value, RpcError>,
    },
    /// Agent notification, e.g. `session/update`.
    Notification { method: String, params: Value },
    /// Agent-to-client request; needs a reply with the same id.
    Request { id: Value, method: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("invalid json: {0}")]
    Json(String),
    #[error("frame is not an object")]
    NotAnObject,
    #[error("unrecognized frame shape")]
    UnknownShape,
    #[error("response id is not a non-negative integer: {0}")]
    BadId(String),
}

fn parse_id(id: &Value) -> Result<u64, FrameError> {
    match id {
        Value::Number(n) => n.as_u64().ok_or_else(|| FrameError::BadId(n.to_string())),
        Value::String(s) => s.parse().map_err(|_| FrameError::BadId(s.clone())),
        other => Err(FrameError::BadId(other.to_string())),
    }
}

/// Decode one line.
pub fn parse_frame(line: &str) -> Result<Inbound, FrameError> {
    let value: Value = serde_json::from_str(line).map_err(|e| FrameError::Json(e.to_string()))?;
    let Value::Object(mut obj) = value else {
        return Err(FrameError::NotAnObject);
    };

    let id = obj.remove("id").filter(|v| !v.is_null());

    if let Some(Value::String(method)) = obj.remove("method") {
        return Ok(match id {
            Some(id) => Inbound::Request { id, method },
            None => Inbound::Notification {
                method,
                params: obj.remove("params").unwrap_or(Value::Null),
            },
        });
    }

    let Some(id) = id else {
        return Err(FrameError::UnknownShape);
    };
    let id = parse_id(&id)?;

    if let Some(err) = obj.remove("error") {
        let err: RpcError =
            serde_json::from_value(err).map_err(|e| FrameError::Json(e.to_string()))?;
        return Ok(Inbound::Response { id, result: Err(err) });
    }
    match obj.remove("result") {
        Some(result) => Ok(Inbound::Response { id, result: Ok(result) }),
        None => Err(FrameError::UnknownShape),
    }
}

fn line(value: Value) -> String {
    let mut s = value.to_string();
    s.push('\n');
    s
}

pub fn encode_request(id: u64, method: &str, params: Value) -> String {
    line(serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method,
        "params": params,
    }))
}

pub fn encode_notification(method: &str, params: Value) -> String {
    line(serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
        "params": params,
    }))
}

pub fn encode_error_response(id: &Value, code: i64, message: &str) -> String {
    line(serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": { "code": code, "message": message },
    }))
}
