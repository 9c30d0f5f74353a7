//! Structural checks on responses.
//!
//! Fields are looked up at the top level of the result first, then inside
//! the `{"ok": true, "data": {...}}` envelope some methods wrap their
//! payload in. Any failed check becomes a [`HarnessError`] carrying the
//! request and response.

use serde_json::{Map, Value};

use crate::error::HarnessError;
use crate::rpc::ResponseOutcome;
use crate::transport::Exchange;
use crate::workflow::Step;

/// The unwrapped payload: `data` inside an `{ok, data}` envelope, else the
/// result itself.
pub fn payload(result: &Value) -> &Value {
    match (result.get("ok"), result.get("data")) {
        (Some(Value::Bool(_)), Some(data)) => data,
        _ => result,
    }
}

/// Look `name` up at the top level, then inside the envelope.
pub fn field<'a>(result: &'a Value, name: &str) -> Option<&'a Value> {
    result.get(name).or_else(|| payload(result).get(name))
}

fn assertion(step: Step, exchange: &Exchange, field: &str, expectation: &str) -> HarnessError {
    HarnessError::Assertion {
        step,
        field: field.to_string(),
        expectation: expectation.to_string(),
        request: exchange.request.clone(),
        response: exchange.response.to_value(),
    }
}

/// The result value, or a protocol error if the call failed.
///
/// An envelope with `"ok": false` is treated as a failed assertion.
pub fn require_success(step: Step, exchange: &Exchange) -> Result<&Value, HarnessError> {
    match &exchange.response.outcome {
        ResponseOutcome::Error(error) => Err(HarnessError::Protocol {
            step,
            request: exchange.request.clone(),
            response: exchange.response.to_value(),
            error: error.clone(),
        }),
        ResponseOutcome::Result(result) => {
            if result.get("ok") == Some(&Value::Bool(false)) {
                return Err(assertion(step, exchange, "ok", "true"));
            }
            Ok(result)
        }
    }
}

/// A non-empty string at `name`.
pub fn require_handle(step: Step, exchange: &Exchange, name: &str) -> Result<String, HarnessError> {
    let result = require_success(step, exchange)?;
    match field(result, name).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Ok(s.to_string()),
        _ => Err(assertion(step, exchange, name, "a non-empty string")),
    }
}

/// An object at `name`.
pub fn require_object<'a>(
    step: Step,
    exchange: &'a Exchange,
    name: &str,
) -> Result<&'a Map<String, Value>, HarnessError> {
    let result = require_success(step, exchange)?;
    field(result, name)
        .and_then(Value::as_object)
        .ok_or_else(|| assertion(step, exchange, name, "an object"))
}

/// An array at `name`. Empty arrays pass.
pub fn require_array<'a>(
    step: Step,
    exchange: &'a Exchange,
    name: &str,
) -> Result<&'a Vec<Value>, HarnessError> {
    let result = require_success(step, exchange)?;
    field(result, name)
        .and_then(Value::as_array)
        .ok_or_else(|| assertion(step, exchange, name, "an array"))
}

/// True if `items` holds `handle` either as a bare string or as the value
/// of `key` in an object.
pub fn contains_handle(items: &[Value], key: &str, handle: &str) -> bool {
    items.iter().any(|item| match item {
        Value::String(s) => s == handle,
        Value::Object(obj) => obj.get(key).and_then(Value::as_str) == Some(handle),
        _ => false,
    })
}
