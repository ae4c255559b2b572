use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use pgrole_driver::{ConnectionManager, SqlTemplates};
use serde::Serialize;
use tracing::Instrument;
use ulid::Ulid;

use crate::config::{GatewayConfig, StartupError};

mod gate;
mod payload;
mod roles;

const REQUEST_ID_HEADER: &str = "x-pgrole-request-id";
const LOCAL_AUTH_SECRET_HEADER: &str = "x-pgrole-local-auth-secret";

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    connections: ConnectionManager,
    templates: Arc<SqlTemplates>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let connections = ConnectionManager::from_servers(&config.servers, config.pool_settings())
        .map_err(|err| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("failed to configure server pools: {}", err),
        })?;

    let state = AppState {
        config,
        connections,
        templates: Arc::new(SqlTemplates::new()),
    };

    Ok(Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .merge(roles::routes())
        .with_state(state))
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<String, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    for server_id in state.connections.server_ids() {
        let ready = state.connections.ping(server_id).await;
        checks.insert(format!("server_{}", server_id), ready);
    }

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if state.config.metrics_require_auth
        && let Err(err) = validate_local_auth_shared_secret(
            &headers,
            state.config.local_auth_shared_secret.as_deref(),
        )
    {
        return err.into_response();
    }

    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Runs a handler body inside its span, records latency and outcome, and
/// echoes the request id on whatever response comes out.
async fn instrumented<T, F>(
    route: &'static str,
    method: &'static str,
    request_id: &str,
    span: tracing::Span,
    handler: F,
) -> Response
where
    T: IntoResponse,
    F: Future<Output = Result<T, ApiError>>,
{
    let started = Instant::now();

    let result = async move {
        let result = handler.await;
        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::Span::current().record("latency_ms", latency_ms);
        tracing::Span::current().record("outcome", if result.is_ok() { "ok" } else { "error" });
        result
    }
    .instrument(span)
    .await;

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request(route, method, status.as_u16(), started.elapsed());

    let mut response = result.into_response();
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn validate_local_auth_shared_secret(
    headers: &HeaderMap,
    expected_secret: Option<&str>,
) -> Result<(), ApiError> {
    let Some(expected_secret) = expected_secret else {
        return Ok(());
    };

    let provided_secret = headers
        .get(LOCAL_AUTH_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            json_error(
                StatusCode::UNAUTHORIZED,
                "ERR_AUTH_REQUIRED",
                "missing local auth secret",
            )
        })?;

    if provided_secret != expected_secret {
        return Err(json_error(
            StatusCode::UNAUTHORIZED,
            "ERR_AUTH_INVALID",
            "invalid local auth secret",
        ));
    }

    Ok(())
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    success: u8,
    code: String,
    errormsg: String,
    info: String,
}

fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            success: 0,
            code: code.into(),
            errormsg: message.into(),
            info: String::new(),
        }),
    )
}

/// Success wrapper used by the tree and preview endpoints.
#[derive(Debug, Serialize)]
struct Envelope<T> {
    success: u8,
    errormsg: &'static str,
    info: &'static str,
    result: Option<serde_json::Value>,
    data: T,
}

fn envelope<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: 1,
        errormsg: "",
        info: "",
        result: None,
        data,
    })
}
