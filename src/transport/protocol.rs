//! JSON-RPC message types.
//!
//! One message per line in both directions. A frame with `method` and `id`
//! is a request, `method` without `id` a notification, and `id` with
//! `result` or `error` a response.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Correlation id pairing a request with its response.
///
/// Ids we mint are numeric; a peer may use strings, which are echoed back
/// untouched. `Null` only appears on error responses to requests whose id
/// could not be read, which never match a pending call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Str(String),
    Null,
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Null => f.write_str("null"),
        }
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self::Number(id)
    }
}

/// Structured error carried in a response's `error` member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message} (code {code})")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("method not found: {method}"))
            .with_data(Value::String(method.to_string()))
    }

    pub fn invalid_params(detail: impl fmt::Display) -> Self {
        Self::new(Self::INVALID_PARAMS, format!("invalid params: {detail}"))
    }

    pub fn internal_error(detail: impl fmt::Display) -> Self {
        Self::new(Self::INTERNAL_ERROR, detail.to_string())
    }
}

/// Outbound call expecting a response.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

/// Reply to a [`Request`], matched by `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub outcome: Result<Value, RpcError>,
}

/// One-way message, never answered.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// Any frame that can cross the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

/// Serialized shape of every outbound frame.
#[derive(Serialize)]
struct Envelope<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a RpcError>,
}

impl Message {
    /// Serialize to a single-line JSON string (no trailing newline).
    pub fn to_json(&self) -> serde_json::Result<String> {
        let mut envelope = Envelope {
            jsonrpc: "2.0",
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        };
        match self {
            Self::Request(req) => {
                envelope.id = Some(&req.id);
                envelope.method = Some(&req.method);
                envelope.params = req.params.as_ref();
            }
            Self::Notification(n) => {
                envelope.method = Some(&n.method);
                envelope.params = n.params.as_ref();
            }
            Self::Response(resp) => {
                envelope.id = Some(&resp.id);
                match &resp.outcome {
                    Ok(result) => envelope.result = Some(result),
                    Err(error) => envelope.error = Some(error),
                }
            }
        }
        serde_json::to_string(&envelope)
    }

    /// Classify a parsed JSON value as a request, response or notification.
    ///
    /// The error string says why the frame was rejected.
    pub fn from_value(value: Value) -> Result<Self, String> {
        let Value::Object(mut obj) = value else {
            return Err("frame is not a JSON object".into());
        };

        let id = take_id(&mut obj)?;
        let params = obj.remove("params");

        if let Some(method) = obj.remove("method") {
            let Value::String(method) = method else {
                return Err("`method` must be a string".into());
            };
            return Ok(match id {
                Some(id) => Self::Request(Request { id, method, params }),
                None => Self::Notification(Notification { method, params }),
            });
        }

        let outcome = if let Some(error) = obj.remove("error") {
            let error: RpcError =
                serde_json::from_value(error).map_err(|e| format!("invalid `error`: {e}"))?;
            Err(error)
        } else if let Some(result) = obj.remove("result") {
            Ok(result)
        } else if id.is_some() {
            return Err("response carries neither `result` nor `error`".into());
        } else {
            return Err("frame has neither `method` nor `id`".into());
        };

        // A response without a usable id is still a response; it just
        // cannot be matched to a call.
        Ok(Self::Response(Response {
            id: id.unwrap_or(RequestId::Null),
            outcome,
        }))
    }

    /// Method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(req) => Some(&req.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }
}

fn take_id(obj: &mut Map<String, Value>) -> Result<Option<RequestId>, String> {
    match obj.remove("id") {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => serde_json::from_value(raw)
            .map(Some)
            .map_err(|e| format!("invalid `id`: {e}")),
    }
}
