//! Wire protocol types for host-worker communication.
//!
//! Two directions over the worker's standard streams:
//! - **stdin**: one JSON object per line ([`WorkerRequest`])
//! - **stdout**: free-form text carrying sentinel-delimited response frames,
//!   each frame normally holding a [`ResponseEnvelope`]

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key under which the worker echoes the correlation id.
pub const RESPONSE_ID_KEY: &str = "request_id";

/// Key carrying the worker's success flag.
pub const SUCCESS_KEY: &str = "hasSucceeded";

/// Correlation id for one logical call.
///
/// UUID v4 keeps ids unique among concurrently pending calls without a shared counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single function invocation, written to the worker as one line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub request_id: RequestId,
    pub module_name: String,
    /// Absolute path of the module file the worker should load.
    pub module_path: PathBuf,
    pub function_name: String,
    pub function_arguments: Value,
}

/// Shutdown signal: `{"exit": true}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitSignal {
    pub exit: bool,
}

/// Messages from host to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerRequest {
    Call(RequestEnvelope),
    Exit(ExitSignal),
}

impl WorkerRequest {
    pub fn exit() -> Self {
        Self::Exit(ExitSignal { exit: true })
    }
}

/// Worker result as delivered to the caller: the response object without `request_id`.
///
/// The payload is kept exactly as the worker sent it, `hasSucceeded` included.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallResponse {
    payload: Map<String, Value>,
}

impl CallResponse {
    pub fn new(payload: Map<String, Value>) -> Self {
        Self { payload }
    }

    pub fn succeeded(fields: Map<String, Value>) -> Self {
        Self::with_flag(fields, true)
    }

    pub fn failed(fields: Map<String, Value>) -> Self {
        Self::with_flag(fields, false)
    }

    fn with_flag(mut payload: Map<String, Value>, has_succeeded: bool) -> Self {
        payload.insert(SUCCESS_KEY.to_string(), Value::Bool(has_succeeded));
        Self { payload }
    }

    /// Only a boolean `true` counts; a missing or non-boolean flag is failure.
    pub fn has_succeeded(&self) -> bool {
        self.payload
            .get(SUCCESS_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.payload)
    }
}

/// Response frame payload as produced by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub request_id: String,
    #[serde(flatten)]
    pub response: CallResponse,
}

impl ResponseEnvelope {
    /// Split a decoded frame object into correlation id and caller payload.
    ///
    /// Returns None when the object has no string `request_id`.
    pub fn from_object(object: &Map<String, Value>) -> Option<Self> {
        let request_id = object.get(RESPONSE_ID_KEY)?.as_str()?.to_string();
        let payload = object
            .iter()
            .filter(|(key, _)| key.as_str() != RESPONSE_ID_KEY)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Some(Self {
            request_id,
            response: CallResponse::new(payload),
        })
    }
}
