//! Envelope types and the message codec.
//!
//! Every frame on the wire is one JSON object in one of three shapes:
//!
//! ```text
//! Request:  {"id": <uint>, "method": <string>, "params"?: <any>}
//! Response: {"id": <uint>, "success"?: <any>} | {"id": <uint>, "error": {...}}
//! Event:    {"method": <string>, "params"?: <any>}
//! ```
//!
//! Events are decoded into a closed set of known kinds with an explicit
//! [`Event::Unknown`] fallback, so nothing downstream matches on raw method
//! strings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DecodeError;

pub const METHOD_EXECUTE: &str = "execute";
pub const METHOD_INIT: &str = "init";
pub const METHOD_DEINIT: &str = "deinit";
pub const METHOD_REFRESH_PLUGINS: &str = "refreshPlugins";
pub const METHOD_GET_PLUGINS: &str = "getPlugins";
pub const METHOD_GET_BACKGROUND_PLUGINS: &str = "getBackgroundPlugins";
pub const METHOD_IS_METHOD_SUPPORTED: &str = "isMethodSupported";

/// Error name used when the local side has no handler for a request.
pub const METHOD_NOT_FOUND: &str = "MethodNotFound";

/// Error object carried by error responses and device error reports.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub stacktrace: String,
}

impl ErrorPayload {
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: name.into(),
            stacktrace: String::new(),
        }
    }

    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Unknown method: {method}"))
    }

    fn from_value(value: Value) -> Result<Self, DecodeError> {
        match value {
            Value::Object(_) => serde_json::from_value(value).map_err(|e| {
                DecodeError::invalid_field("error", e.to_string())
            }),
            Value::String(message) => Ok(Self {
                message,
                ..Self::default()
            }),
            other => Err(DecodeError::invalid_field(
                "error",
                format!("expected object or string, got {other}"),
            )),
        }
    }

    fn to_value(&self) -> Value {
        serde_json::json!({
            "message": self.message,
            "name": self.name,
            "stacktrace": self.stacktrace,
        })
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

/// A plugin-scoped call: the params of an `execute` envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginCall {
    pub api: String,
    pub method: String,
    pub params: Option<Value>,
    /// Any other keys the app sent alongside, re-encoded after `params`
    pub extra: Map<String, Value>,
}

impl PluginCall {
    #[must_use]
    pub fn new(api: impl Into<String>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            api: api.into(),
            method: method.into(),
            params,
            extra: Map::new(),
        }
    }

    fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Object(mut obj) = value else {
            return Err(DecodeError::invalid_field("params", "execute params must be an object"));
        };
        let api = take_string(&mut obj, "api")?
            .ok_or_else(|| DecodeError::invalid_field("api", "missing"))?;
        let method = take_string(&mut obj, "method")?
            .ok_or_else(|| DecodeError::invalid_field("method", "missing"))?;
        let params = obj.remove("params");
        Ok(Self {
            api,
            method,
            params,
            extra: obj,
        })
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("api".to_string(), Value::String(self.api.clone()));
        obj.insert("method".to_string(), Value::String(self.method.clone()));
        if let Some(params) = &self.params {
            obj.insert("params".to_string(), params.clone());
        }
        obj.extend(self.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        Value::Object(obj)
    }
}

/// Outcome of a response envelope: exactly one of `success` or `error`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Success(Value),
    Error(ErrorPayload),
}

/// Unsolicited messages (no `id`).
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Plugin-scoped event, routed by `api`
    Execute(PluginCall),
    /// Ask the remote to start a plugin
    Init { plugin: String },
    /// Ask the remote to stop a plugin
    Deinit { plugin: String },
    /// The remote's plugin set changed
    RefreshPlugins,
    /// Error reported by the device outside any request
    DeviceError {
        method: Option<String>,
        error: ErrorPayload,
    },
    Unknown {
        method: String,
        params: Option<Value>,
    },
}

impl Event {
    fn from_parts(method: String, params: Option<Value>) -> Result<Self, DecodeError> {
        match method.as_str() {
            METHOD_EXECUTE => {
                let params = params
                    .ok_or_else(|| DecodeError::invalid_field("params", "execute expects params"))?;
                Ok(Self::Execute(PluginCall::from_value(params)?))
            }
            METHOD_INIT | METHOD_DEINIT => {
                let plugin = match params {
                    Some(Value::Object(mut obj)) => take_string(&mut obj, "plugin")?,
                    _ => None,
                }
                .ok_or_else(|| DecodeError::invalid_field("plugin", "missing"))?;
                if method == METHOD_INIT {
                    Ok(Self::Init { plugin })
                } else {
                    Ok(Self::Deinit { plugin })
                }
            }
            METHOD_REFRESH_PLUGINS => Ok(Self::RefreshPlugins),
            _ => Ok(Self::Unknown { method, params }),
        }
    }

    /// Wire method name of this event, if it has one.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Execute(_) => Some(METHOD_EXECUTE),
            Self::Init { .. } => Some(METHOD_INIT),
            Self::Deinit { .. } => Some(METHOD_DEINIT),
            Self::RefreshPlugins => Some(METHOD_REFRESH_PLUGINS),
            Self::DeviceError { method, .. } => method.as_deref(),
            Self::Unknown { method, .. } => Some(method),
        }
    }
}

/// One decoded wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request {
        id: u64,
        method: String,
        params: Option<Value>,
    },
    Response {
        id: u64,
        outcome: ResponseOutcome,
    },
    Event(Event),
}

impl Envelope {
    #[must_use]
    pub fn request(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request {
            id,
            method: method.into(),
            params,
        }
    }

    #[must_use]
    pub fn success(id: u64, result: Value) -> Self {
        Self::Response {
            id,
            outcome: ResponseOutcome::Success(result),
        }
    }

    #[must_use]
    pub fn error(id: u64, error: ErrorPayload) -> Self {
        Self::Response {
            id,
            outcome: ResponseOutcome::Error(error),
        }
    }

    #[must_use]
    pub fn execute(api: impl Into<String>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Event(Event::Execute(PluginCall::new(api, method, params)))
    }

    /// Build an event envelope from a raw method name, classifying it the same
    /// way the decoder does.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] if a known method carries malformed params.
    pub fn event(method: impl Into<String>, params: Option<Value>) -> Result<Self, DecodeError> {
        Ok(Self::Event(Event::from_parts(method.into(), params)?))
    }

    /// Correlation id, for requests and responses.
    #[must_use]
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => Some(*id),
            Self::Event(_) => None,
        }
    }

    /// Classify a parsed JSON value.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] for anything that is not a well-formed
    /// request, response or event object.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Object(mut obj) = value else {
            return Err(DecodeError::NotAnObject);
        };

        let id = match obj.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(raw.as_u64().ok_or_else(|| DecodeError::InvalidId(raw.to_string()))?),
        };
        let method = take_string(&mut obj, "method")?;
        let params = obj.remove("params");
        let success = obj.remove("success");
        let error = obj.remove("error").filter(|e| !e.is_null());

        match (id, method) {
            (Some(id), Some(method)) => Ok(Self::Request { id, method, params }),
            (Some(id), None) => {
                let outcome = match (success, error) {
                    (Some(_), Some(_)) => return Err(DecodeError::AmbiguousResponse(id)),
                    (None, Some(error)) => ResponseOutcome::Error(ErrorPayload::from_value(error)?),
                    (Some(result), None) => ResponseOutcome::Success(result),
                    (None, None) => ResponseOutcome::Success(Value::Null),
                };
                Ok(Self::Response { id, outcome })
            }
            (None, method) => {
                if let Some(error) = error {
                    return Ok(Self::Event(Event::DeviceError {
                        method,
                        error: ErrorPayload::from_value(error)?,
                    }));
                }
                let method = method.ok_or(DecodeError::MissingMethod)?;
                Ok(Self::Event(Event::from_parts(method, params)?))
            }
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        match self {
            Self::Request { id, method, params } => {
                obj.insert("id".to_string(), Value::from(*id));
                obj.insert("method".to_string(), Value::String(method.clone()));
                if let Some(params) = params {
                    obj.insert("params".to_string(), params.clone());
                }
            }
            Self::Response { id, outcome } => {
                obj.insert("id".to_string(), Value::from(*id));
                match outcome {
                    ResponseOutcome::Success(result) => {
                        obj.insert("success".to_string(), result.clone());
                    }
                    ResponseOutcome::Error(error) => {
                        obj.insert("error".to_string(), error.to_value());
                    }
                }
            }
            Self::Event(event) => match event {
                Event::Execute(call) => {
                    obj.insert("method".to_string(), Value::from(METHOD_EXECUTE));
                    obj.insert("params".to_string(), call.to_value());
                }
                Event::Init { plugin } | Event::Deinit { plugin } => {
                    let method = if matches!(event, Event::Init { .. }) {
                        METHOD_INIT
                    } else {
                        METHOD_DEINIT
                    };
                    obj.insert("method".to_string(), Value::from(method));
                    obj.insert("params".to_string(), serde_json::json!({ "plugin": plugin }));
                }
                Event::RefreshPlugins => {
                    obj.insert("method".to_string(), Value::from(METHOD_REFRESH_PLUGINS));
                }
                Event::DeviceError { method, error } => {
                    if let Some(method) = method {
                        obj.insert("method".to_string(), Value::String(method.clone()));
                    }
                    obj.insert("error".to_string(), error.to_value());
                }
                Event::Unknown { method, params } => {
                    obj.insert("method".to_string(), Value::String(method.clone()));
                    if let Some(params) = params {
                        obj.insert("params".to_string(), params.clone());
                    }
                }
            },
        }
        Value::Object(obj)
    }
}

fn take_string(obj: &mut Map<String, Value>, field: &'static str) -> Result<Option<String>, DecodeError> {
    match obj.remove(field) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(DecodeError::invalid_field(
            field,
            format!("expected string, got {other}"),
        )),
    }
}

/// Decode one frame.
///
/// # Errors
///
/// Returns [`DecodeError::Json`] for invalid JSON and the errors of
/// [`Envelope::from_value`] for valid JSON of the wrong shape.
pub fn decode(raw: &str) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_str(raw)?;
    Envelope::from_value(value)
}

/// Encode one frame. Encoding a well-formed envelope cannot fail.
#[must_use]
pub fn encode(envelope: &Envelope) -> String {
    envelope.to_value().to_string()
}
