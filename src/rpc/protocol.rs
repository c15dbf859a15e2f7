//! JSON-RPC 2.0 message model
//!
//! Implements the message shapes exchanged by the engine: requests,
//! notifications and responses, plus the standard and LSP error codes.
//! Decoding classifies one inbound JSON document into a [`Message`].

use std::fmt;

use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC version constant
pub const JSONRPC_VERSION: &str = "2.0";

/// Request id: JSON number or string
///
/// Numeric ids must be integers that fit in an `i64`. Fractional ids and
/// larger numbers are refused with InvalidRequest; LSP clients only send
/// integer or string ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId::String(id)
    }
}

/// Standard JSON-RPC and LSP error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    // LSP-specific error codes
    ServerNotInitialized,
    UnknownErrorCode,
    RequestCancelled,
    ContentModified,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::ServerNotInitialized => -32002,
            ErrorCode::UnknownErrorCode => -32001,
            ErrorCode::RequestCancelled => -32800,
            ErrorCode::ContentModified => -32801,
        }
    }

    /// Name used as the default error message on the wire
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "ParseError",
            ErrorCode::InvalidRequest => "InvalidRequest",
            ErrorCode::MethodNotFound => "MethodNotFound",
            ErrorCode::InvalidParams => "InvalidParams",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::ServerNotInitialized => "ServerNotInitialized",
            ErrorCode::UnknownErrorCode => "UnknownErrorCode",
            ErrorCode::RequestCancelled => "RequestCancelled",
            ErrorCode::ContentModified => "ContentModified",
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        [
            ErrorCode::ParseError,
            ErrorCode::InvalidRequest,
            ErrorCode::MethodNotFound,
            ErrorCode::InvalidParams,
            ErrorCode::InternalError,
            ErrorCode::ServerNotInitialized,
            ErrorCode::UnknownErrorCode,
            ErrorCode::RequestCancelled,
            ErrorCode::ContentModified,
        ]
        .into_iter()
        .find(|c| c.code() == code)
    }
}

/// JSON-RPC error object
///
/// Handlers return this to have their own code and message sent back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn parse_error() -> Self {
        ErrorCode::ParseError.into()
    }

    pub fn invalid_request() -> Self {
        ErrorCode::InvalidRequest.into()
    }

    pub fn method_not_found() -> Self {
        ErrorCode::MethodNotFound.into()
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams.code(), message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError.code(), message)
    }

    pub fn known_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }
}

impl From<ErrorCode> for ResponseError {
    fn from(code: ErrorCode) -> Self {
        Self::new(code.code(), code.name())
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for ResponseError {}

/// JSON-RPC request message (expects a response)
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Value,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

impl Serialize for Request {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        map.serialize_entry("id", &self.id)?;
        map.serialize_entry("method", &self.method)?;
        if !self.params.is_null() {
            map.serialize_entry("params", &self.params)?;
        }
        map.end()
    }
}

/// JSON-RPC notification (no id, no response expected)
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

impl Serialize for Notification {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        map.serialize_entry("method", &self.method)?;
        if !self.params.is_null() {
            map.serialize_entry("params", &self.params)?;
        }
        map.end()
    }
}

/// Exactly one of `result` / `error`
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Result(Value),
    Error(ResponseError),
}

/// JSON-RPC response
///
/// `id` is `None` only when the offending request's id could not be read
/// (it is then sent as `null`).
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Option<RequestId>,
    pub payload: ResponsePayload,
}

impl Response {
    /// Create a success response
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            payload: ResponsePayload::Result(result),
        }
    }

    /// Create an error response
    pub fn error(id: Option<RequestId>, error: ResponseError) -> Self {
        Self {
            id,
            payload: ResponsePayload::Error(error),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload, ResponsePayload::Error(_))
    }

    /// Get the result, or error if present
    pub fn into_result(self) -> Result<Value, ResponseError> {
        match self.payload {
            ResponsePayload::Result(value) => Ok(value),
            ResponsePayload::Error(error) => Err(error),
        }
    }
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        map.serialize_entry("id", &self.id)?;
        match &self.payload {
            ResponsePayload::Result(result) => map.serialize_entry("result", result)?,
            ResponsePayload::Error(error) => map.serialize_entry("error", error)?,
        }
        map.end()
    }
}

/// Any JSON-RPC message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Message {
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            Message::Response(_) => None,
        }
    }

    /// Serialize to the JSON body (no framing)
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Message::Request(r) => r.serialize(serializer),
            Message::Notification(n) => n.serialize(serializer),
            Message::Response(r) => r.serialize(serializer),
        }
    }
}

impl From<Request> for Message {
    fn from(r: Request) -> Self {
        Message::Request(r)
    }
}

impl From<Notification> for Message {
    fn from(n: Notification) -> Self {
        Message::Notification(n)
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Message::Response(r)
    }
}

/// Why an inbound document could not be turned into a [`Message`]
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeError {
    /// Id of the offending message, when it could be read
    pub id: Option<RequestId>,
    pub error: ResponseError,
}

impl DecodeError {
    pub fn into_response(self) -> Response {
        Response::error(self.id, self.error)
    }
}

/// Wire shape shared by every message kind
#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ResponseError>,
}

/// Distinguishes `"result": null` (Some(Null)) from an absent key (None)
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// Decode one JSON document into a message
pub fn decode(body: &[u8]) -> Result<Message, DecodeError> {
    let raw: RawMessage = serde_json::from_slice(body).map_err(|e| DecodeError {
        id: None,
        error: ResponseError::parse_error().with_data(e.to_string()),
    })?;
    raw.classify()
}

impl RawMessage {
    fn classify(self) -> Result<Message, DecodeError> {
        let id = match self.id {
            None | Some(Value::Null) => None,
            Some(value) => match serde_json::from_value::<RequestId>(value) {
                Ok(id) => Some(id),
                Err(_) => {
                    return Err(DecodeError {
                        id: None,
                        error: ResponseError::new(
                            ErrorCode::InvalidRequest.code(),
                            "id must be a number or a string",
                        ),
                    })
                }
            },
        };

        if self.jsonrpc.as_deref() != Some(JSONRPC_VERSION) {
            return Err(DecodeError {
                id,
                error: ResponseError::new(
                    ErrorCode::InvalidRequest.code(),
                    "jsonrpc must be \"2.0\"",
                ),
            });
        }

        let params = self.params.unwrap_or(Value::Null);
        match (self.method, id) {
            (Some(method), Some(id)) => Ok(Message::Request(Request { id, method, params })),
            (Some(method), None) => Ok(Message::Notification(Notification { method, params })),
            (None, id) => match (self.result, self.error) {
                (Some(result), None) => match id {
                    Some(id) => Ok(Message::Response(Response::success(id, result))),
                    None => Err(DecodeError {
                        id: None,
                        error: ResponseError::new(
                            ErrorCode::InvalidRequest.code(),
                            "result without id",
                        ),
                    }),
                },
                (None, Some(error)) => Ok(Message::Response(Response::error(id, error))),
                _ => Err(DecodeError {
                    id,
                    error: ResponseError::invalid_request(),
                }),
            },
        }
    }
}
