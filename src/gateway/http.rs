//! HTTP surface: liveness, status, and the proxy fallback that feeds [`Gateway::handle`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use super::engine::{Gateway, GatewayResponse, GatewayStatus, generate_request_id};
use super::upstream::{ResponseBody, UpstreamErrorKind};
use super::{Clock, GatewayError, RateLimitInfo};

const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone)]
pub struct GatewayHttpState {
    gateway: Arc<Gateway>,
    max_body_bytes: usize,
}

impl GatewayHttpState {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes.max(1);
        self
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }
}

pub fn router(state: GatewayHttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .fallback(handle_proxy)
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn status(State(state): State<GatewayHttpState>) -> Json<GatewayStatus> {
    Json(state.gateway.status())
}

async fn handle_proxy(
    State(state): State<GatewayHttpState>,
    req: axum::http::Request<Body>,
) -> Response {
    let (parts, body) = req.into_parts();
    let request_id = parts
        .headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);
    let clock = state.gateway.clock().clone();

    let body = match to_bytes(body, state.max_body_bytes).await {
        Ok(body) => body,
        Err(err) => {
            let err = GatewayError::InvalidRequest {
                reason: format!("request body rejected: {err}"),
            };
            return error_response(&request_id, &err, clock.as_ref());
        }
    };

    let client_ip = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|value| value.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let inbound = super::context::InboundRequest::new(
        request_id.clone(),
        parts.method,
        path_and_query,
        parts.headers,
        body,
    )
    .with_client_ip(client_ip);

    match state.gateway.handle(inbound).await {
        Ok(response) => proxy_response(response),
        Err(err) => error_response(&request_id, &err, clock.as_ref()),
    }
}

fn proxy_response(response: GatewayResponse) -> Response {
    let GatewayResponse {
        request_id,
        status,
        headers,
        body,
        channel_id,
        cache,
        attempts: _,
    } = response;

    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = forwardable_headers(headers);
    insert_header(&mut headers, "x-request-id", &request_id);
    if let Some(channel_id) = channel_id {
        insert_header(&mut headers, "x-conduit-channel", &channel_id);
    }
    if let Some(cache) = cache {
        let label = match cache {
            super::context::CacheStatus::Hit => "hit",
            super::context::CacheStatus::Miss => "miss",
            super::context::CacheStatus::Bypass => "bypass",
        };
        insert_header(&mut headers, "x-conduit-cache", label);
    }

    let body = match body {
        ResponseBody::Full(bytes) => Body::from(bytes),
        ResponseBody::Stream(stream) => Body::from_stream(stream),
    };
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn forwardable_headers(mut headers: HeaderMap) -> HeaderMap {
    for name in ["content-length", "transfer-encoding", "connection", "keep-alive"] {
        headers.remove(name);
    }
    headers
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

pub fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
        GatewayError::Disabled { .. }
        | GatewayError::IpNotAllowed { .. }
        | GatewayError::ForbiddenModel { .. } => StatusCode::FORBIDDEN,
        GatewayError::InsufficientBalance { .. } | GatewayError::QuotaExceeded { .. } => {
            StatusCode::PAYMENT_REQUIRED
        }
        GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::UnknownModel { .. } => StatusCode::NOT_FOUND,
        GatewayError::MissingModel | GatewayError::InvalidRequest { .. } => {
            StatusCode::BAD_REQUEST
        }
        GatewayError::NoAvailableChannel { .. } => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::Upstream(upstream) => match upstream.kind {
            UpstreamErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            UpstreamErrorKind::Provider4xx | UpstreamErrorKind::Throttled => upstream
                .status
                .and_then(|status| StatusCode::from_u16(status).ok())
                .filter(|status| status.is_client_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            _ => StatusCode::BAD_GATEWAY,
        },
        GatewayError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_response(request_id: &str, err: &GatewayError, clock: &dyn Clock) -> Response {
    let status = status_for(err);

    let mut response = match err {
        GatewayError::Upstream(upstream) if status.is_client_error() && upstream.body.is_some() => {
            let body = upstream.body.clone().unwrap_or_default();
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            response.headers_mut().insert(
                axum::http::header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
        _ => (
            status,
            Json(ErrorBody {
                error: ErrorDetail {
                    code: err.code(),
                    message: err.to_string(),
                    kind: err.category().as_str(),
                },
            }),
        )
            .into_response(),
    };

    let headers = response.headers_mut();
    insert_header(headers, "x-request-id", request_id);
    if let GatewayError::RateLimited(info) = err {
        insert_rate_limit_headers(headers, info, clock.now_epoch_seconds());
    }
    response
}

fn insert_rate_limit_headers(headers: &mut HeaderMap, info: &RateLimitInfo, now: u64) {
    insert_header(headers, "x-ratelimit-limit", &info.limit.to_string());
    insert_header(headers, "x-ratelimit-remaining", &info.remaining.to_string());
    insert_header(
        headers,
        "x-ratelimit-reset",
        &info.reset_epoch_seconds.to_string(),
    );
    let retry_after = info.reset_epoch_seconds.saturating_sub(now).max(1);
    insert_header(headers, "retry-after", &retry_after.to_string());
}
