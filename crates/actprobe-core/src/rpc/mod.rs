//! JSON-RPC 2.0 wire types and the line codec.
//!
//! One JSON object per line, UTF-8, newline-terminated. Requests always
//! carry an integer `id`; responses must echo it and carry exactly one of
//! `result` or `error`.
//!
//! ```text
//! -> {"jsonrpc":"2.0","method":"run","id":7,"params":{"tenant":"test"}}
//! <- {"jsonrpc":"2.0","id":7,"result":{"execution_trn":"..."}}
//! <- {"jsonrpc":"2.0","id":7,"error":{"code":-32603,"message":"..."}}
//! ```

pub mod codes;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

/// The only protocol version this harness speaks.
pub const JSONRPC_VERSION: &str = "2.0";

/// Named parameters of a request.
pub type Params = Map<String, Value>;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A single outbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
}

impl Request {
    pub fn new(method: impl Into<String>, id: u64, params: Option<Params>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            id,
            params,
        }
    }

    /// Serialize to a single line without the trailing terminator.
    ///
    /// `serde_json` escapes control characters inside strings, so the
    /// output never contains a raw newline.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let line = serde_json::to_string(self)?;
        debug_assert!(!line.contains('\n'));
        Ok(line)
    }

    /// Parse a request line. Used by fakes and round-trip checks.
    pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// The params as a JSON value (`{}` when absent), for reports.
    pub fn params_value(&self) -> Value {
        self.params
            .clone()
            .map(Value::Object)
            .unwrap_or_else(|| Value::Object(Map::new()))
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
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

    /// The error object as it appears on the wire. `data` is omitted when absent.
    pub fn to_value(&self) -> Value {
        let mut obj = json!({
            "code": self.code,
            "message": self.message,
        });
        if let (Some(data), Value::Object(map)) = (&self.data, &mut obj) {
            map.insert("data".to_string(), data.clone());
        }
        obj
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Either the result value or the error object, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Result(Value),
    Error(RpcError),
}

/// A decoded response line.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub jsonrpc: Option<String>,
    pub id: u64,
    pub outcome: ResponseOutcome,
}

/// Reasons a line is not a valid response.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("line is not valid UTF-8")]
    InvalidUtf8,

    #[error("line is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("response is not a JSON object")]
    NotAnObject,

    #[error("response has no id")]
    MissingId,

    #[error("response id is not a non-negative integer: {0}")]
    InvalidId(Value),

    #[error("response carries both result and error")]
    BothResultAndError,

    #[error("response carries neither result nor error")]
    NeitherResultNorError,

    #[error("response error object is malformed: {0}")]
    InvalidErrorObject(#[source] serde_json::Error),
}

/// Intermediate shape that keeps "field absent" distinct from "field null".
#[derive(Deserialize)]
struct RawResponse {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default, deserialize_with = "present")]
    id: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    error: Option<Value>,
}

/// Maps any present value (including `null`) to `Some`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Response {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id,
            outcome: ResponseOutcome::Result(result),
        }
    }

    pub fn failure(id: u64, error: RpcError) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id,
            outcome: ResponseOutcome::Error(error),
        }
    }

    /// Decode one response line.
    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(line).map_err(DecodeError::InvalidJson)?;
        if !value.is_object() {
            return Err(DecodeError::NotAnObject);
        }
        let raw: RawResponse = serde_json::from_value(value).map_err(DecodeError::InvalidJson)?;

        let id = match raw.id {
            None | Some(Value::Null) => return Err(DecodeError::MissingId),
            Some(v) => v.as_u64().ok_or(DecodeError::InvalidId(v))?,
        };

        let outcome = match (raw.result, raw.error) {
            (Some(_), Some(_)) => return Err(DecodeError::BothResultAndError),
            (None, None) => return Err(DecodeError::NeitherResultNorError),
            (Some(result), None) => ResponseOutcome::Result(result),
            (None, Some(error)) => ResponseOutcome::Error(
                serde_json::from_value(error).map_err(DecodeError::InvalidErrorObject)?,
            ),
        };

        Ok(Self {
            jsonrpc: raw.jsonrpc,
            id,
            outcome,
        })
    }

    /// Encode to a single line without the trailing terminator.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_value())
    }

    /// The response as it appeared on the wire, for diagnostics.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        if let Some(ref v) = self.jsonrpc {
            obj.insert("jsonrpc".to_string(), Value::String(v.clone()));
        }
        obj.insert("id".to_string(), Value::from(self.id));
        match &self.outcome {
            ResponseOutcome::Result(result) => {
                obj.insert("result".to_string(), result.clone());
            }
            ResponseOutcome::Error(error) => {
                obj.insert("error".to_string(), error.to_value());
            }
        }
        Value::Object(obj)
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            ResponseOutcome::Result(v) => Some(v),
            ResponseOutcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&RpcError> {
        match &self.outcome {
            ResponseOutcome::Result(_) => None,
            ResponseOutcome::Error(e) => Some(e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ResponseOutcome::Result(_))
    }
}

/// Build a [`Params`] map from a `json!({...})` object literal.
///
/// Non-object values yield an empty map.
pub fn params(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_encodes_fields_in_wire_order() {
        let req = Request::new("run", 7, Some(params(json!({"tenant": "test"}))));
        assert_eq!(
            req.encode().unwrap(),
            r#"{"jsonrpc":"2.0","method":"run","id":7,"params":{"tenant":"test"}}"#
        );
    }

    #[test]
    fn request_without_params_omits_field() {
        let req = Request::new("health", 1, None);
        assert_eq!(
            req.encode().unwrap(),
            r#"{"jsonrpc":"2.0","method":"health","id":1}"#
        );
    }

    #[test]
    fn request_with_embedded_newline_stays_on_one_line() {
        let req = Request::new(
            "auth.pat",
            3,
            Some(params(json!({"access_token": "line1\nline2"}))),
        );
        let line = req.encode().unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(Request::decode(&line).unwrap(), req);
    }

    #[test]
    fn request_roundtrips_through_wire_format() {
        let req = Request::new(
            "execution.list",
            42,
            Some(params(json!({"tenant": "test", "limit": 10, "offset": 0}))),
        );
        let line = req.encode().unwrap();
        assert_eq!(Request::decode(&line).unwrap().encode().unwrap(), line);
    }

    #[test]
    fn decode_success_response() {
        let resp =
            Response::decode(r#"{"jsonrpc":"2.0","id":1,"result":{"status":"healthy"}}"#).unwrap();
        assert_eq!(resp.id, 1);
        assert!(resp.is_success());
        assert_eq!(resp.result().unwrap()["status"], "healthy");
    }

    #[test]
    fn decode_null_result_counts_as_present() {
        let resp = Response::decode(r#"{"jsonrpc":"2.0","id":4,"result":null}"#).unwrap();
        assert_eq!(resp.outcome, ResponseOutcome::Result(Value::Null));
    }

    #[test]
    fn decode_error_response() {
        let resp = Response::decode(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"Method not found"}}"#,
        )
        .unwrap();
        let err = resp.error().unwrap();
        assert_eq!(err.code, codes::METHOD_NOT_FOUND);
        assert_eq!(err.message, "Method not found");
        assert!(err.data.is_none());
    }

    #[test]
    fn decode_rejects_both_result_and_error() {
        let err = Response::decode(
            r#"{"jsonrpc":"2.0","id":2,"result":{},"error":{"code":1,"message":"x"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, DecodeError::BothResultAndError));
    }

    #[test]
    fn decode_rejects_neither_result_nor_error() {
        let err = Response::decode(r#"{"jsonrpc":"2.0","id":2}"#).unwrap_err();
        assert!(matches!(err, DecodeError::NeitherResultNorError));
    }

    #[test]
    fn decode_rejects_missing_or_null_id() {
        let err = Response::decode(r#"{"jsonrpc":"2.0","result":{}}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MissingId));

        let err = Response::decode(
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, DecodeError::MissingId));
    }

    #[test]
    fn decode_rejects_non_integer_id() {
        let err = Response::decode(r#"{"jsonrpc":"2.0","id":"abc","result":{}}"#).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidId(_)));
    }

    #[test]
    fn decode_rejects_invalid_json_and_non_objects() {
        assert!(matches!(
            Response::decode("this is not json").unwrap_err(),
            DecodeError::InvalidJson(_)
        ));
        assert!(matches!(
            Response::decode("[1,2,3]").unwrap_err(),
            DecodeError::NotAnObject
        ));
    }

    #[test]
    fn decode_rejects_malformed_error_object() {
        let err =
            Response::decode(r#"{"jsonrpc":"2.0","id":2,"error":"boom"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidErrorObject(_)));
    }

    #[test]
    fn response_encode_matches_decode() {
        let resp = Response::failure(
            9,
            RpcError::new(codes::NOT_FOUND_ERROR, "Binding not found")
                .with_data(json!({"kind": "not_found"})),
        );
        let line = resp.encode().unwrap();
        assert_eq!(Response::decode(&line).unwrap(), resp);
    }

    #[test]
    fn error_response_value_carries_code_and_message() {
        let bare = Response::failure(4, RpcError::new(codes::CONFIG_ERROR, "bad spec"));
        assert_eq!(
            bare.to_value(),
            json!({
                "jsonrpc": "2.0",
                "id": 4,
                "error": {"code": codes::CONFIG_ERROR, "message": "bad spec"},
            })
        );

        let detailed = Response::failure(
            5,
            RpcError::new(codes::NOT_FOUND_ERROR, "Binding not found").with_data(json!("tenant test")),
        );
        assert_eq!(detailed.to_value()["error"]["data"], json!("tenant test"));
        assert_eq!(detailed.to_value()["error"]["code"], json!(codes::NOT_FOUND_ERROR));
    }
}
