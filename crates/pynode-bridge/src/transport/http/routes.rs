//! HTTP route handlers.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{ConnectInfo, Path, Query, Request, State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{any, post},
};
use serde::Serialize;
use serde_json::{Value, json};

use crate::client::FunctionBridge;
use crate::error::BridgeError;

pub const API_VERSION: &str = "1.0";
pub const POWERED_BY: &str = "PyNode Bridge";

const PING_BODY_LIMIT: usize = 1024 * 1024;

/// Response behaviour switches.
#[derive(Debug, Clone, Copy)]
pub struct ApiOptions {
    /// Attach the error source chain as `data.stackTrace` on 5xx responses.
    pub include_error_stack: bool,
}

impl Default for ApiOptions {
    fn default() -> Self {
        Self {
            include_error_stack: true,
        }
    }
}

#[derive(Clone)]
struct AppState {
    bridge: Arc<dyn FunctionBridge>,
    options: ApiOptions,
}

/// Envelope wrapped around every response body.
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    /// RFC 7231 date, e.g. `Tue, 15 Nov 1994 08:12:31 GMT`.
    pub date: String,
    pub status: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ApiResponse {
    pub fn new(status: StatusCode, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            date: chrono::Utc::now()
                .format("%a, %d %b %Y %H:%M:%S GMT")
                .to_string(),
            status: status.as_u16(),
            message: message.into(),
            data,
        }
    }
}

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

fn error_status(error: &BridgeError) -> StatusCode {
    match error {
        BridgeError::AtCapacity(_) | BridgeError::WorkerUnavailable | BridgeError::NotInitialized => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        BridgeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: &BridgeError, options: ApiOptions) -> ApiResponse {
    let data = options
        .include_error_stack
        .then(|| json!({ "stackTrace": error.chain() }));
    ApiResponse::new(error_status(error), error.to_string(), data)
}

/// Module names map to files in the scripts directory; no path components allowed.
fn is_valid_module_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

async fn invoke_function(
    State(state): State<AppState>,
    Path((module, function)): Path<(String, String)>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResponse {
    if !is_valid_module_name(&module) {
        return ApiResponse::new(StatusCode::BAD_REQUEST, "Invalid module name.", None);
    }

    let arguments = match payload {
        Ok(Json(Value::Null)) | Err(JsonRejection::MissingJsonContentType(_)) => json!({}),
        Ok(Json(value @ Value::Object(_))) => value,
        Ok(Json(_)) => {
            return ApiResponse::new(
                StatusCode::BAD_REQUEST,
                "Request body must be a JSON object.",
                None,
            );
        }
        Err(rejection) => {
            return ApiResponse::new(StatusCode::BAD_REQUEST, rejection.body_text(), None);
        }
    };

    let module_name = format!("{module}.py");
    match state.bridge.call(&module_name, &function, arguments).await {
        Ok(response) if response.has_succeeded() => ApiResponse::new(
            StatusCode::OK,
            "Request has been processed successfully.",
            Some(response.into_value()),
        ),
        Ok(response) => ApiResponse::new(
            StatusCode::BAD_REQUEST,
            "An error occurred while processing the request.",
            Some(response.into_value()),
        ),
        Err(e) => {
            tracing::error!(module = %module_name, function = %function, error = %e, "Call rejected");
            error_response(&e, state.options)
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PingData {
    /// Version segment of the request path, e.g. `v1.0`.
    api_version: String,
    http_method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_agent: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    query_parameters: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_body: Option<Value>,
}

async fn ping(Query(query_parameters): Query<BTreeMap<String, String>>, request: Request) -> ApiResponse {
    let (parts, body) = request.into_parts();

    let ip_address = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        });
    let user_agent = parts
        .headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let headers = parts
        .headers
        .iter()
        .filter(|(name, _)| *name != header::USER_AGENT)
        .map(|(name, value)| {
            (
                name.to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    let request_body = match axum::body::to_bytes(body, PING_BODY_LIMIT).await {
        Ok(bytes) => serde_json::from_slice::<Value>(&bytes)
            .ok()
            .filter(|value| match value {
                Value::Null => false,
                Value::Object(map) => !map.is_empty(),
                _ => true,
            }),
        Err(e) => {
            tracing::debug!(error = %e, "Failed to read ping body");
            None
        }
    };

    let data = PingData {
        api_version: format!("v{API_VERSION}"),
        http_method: parts.method.to_string(),
        ip_address,
        user_agent,
        headers,
        query_parameters,
        request_body,
    };
    ApiResponse::new(
        StatusCode::OK,
        "Ping request processed successfully.",
        serde_json::to_value(data).ok(),
    )
}

async fn not_found() -> ApiResponse {
    ApiResponse::new(StatusCode::NOT_FOUND, "Resource not found.", None)
}

async fn powered_by(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert("x-powered-by", HeaderValue::from_static(POWERED_BY));
    response
}

/// Build the router. Routes live under `/api/v{API_VERSION}`.
pub fn routes(bridge: Arc<dyn FunctionBridge>, options: ApiOptions) -> Router {
    let api = Router::new()
        .route("/ping", any(ping))
        .route("/pynode-bridge/{module}/{function}", post(invoke_function));

    Router::new()
        .nest(&format!("/api/v{API_VERSION}"), api)
        .fallback(not_found)
        .layer(middleware::map_response(powered_by))
        .with_state(AppState { bridge, options })
}
