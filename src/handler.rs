//! HTTP surface of the gateway.
//!
//! `GET /_render?url=...` renders a page through the worker pool; the render
//! result is checked against HTTP semantics before it is turned into a
//! response. Failures become a 500 carrying a simplified `{error, stack}`.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::api::RenderApi;
use crate::environment::RenderResult;
use crate::error::{ErrorInfo, RenderError};
use crate::logging::Logger;
use crate::pool::RenderPool;

/// Header carrying the shared render secret
pub const SECRET_HEADER: &str = "x-render-secret";

/// Statuses that must come with a `Location` header
const REDIRECT_STATUSES: [u16; 5] = [301, 302, 303, 307, 308];

#[derive(Clone)]
pub struct AppState {
    pool: Arc<RenderPool>,
    logger: Arc<dyn Logger>,
    secret: Option<Arc<str>>,
}

impl AppState {
    pub fn new(pool: Arc<RenderPool>, logger: Arc<dyn Logger>, secret: Option<String>) -> Self {
        Self {
            pool,
            logger,
            secret: secret.map(Arc::from),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/_render", get(render))
        .route("/_api/ping", get(ping))
        .route("/_api/version", get(version))
        .with_state(state)
}

async fn ping() -> &'static str {
    "pong"
}

async fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[derive(Debug, Deserialize)]
struct RenderQuery {
    url: Option<String>,
}

async fn render(
    State(state): State<AppState>,
    Query(query): Query<RenderQuery>,
    headers: HeaderMap,
) -> Response {
    if let Some(secret) = state.secret.as_deref() {
        let presented = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
        if presented != Some(secret) {
            return client_error(StatusCode::FORBIDDEN, "Invalid render secret");
        }
    }

    let Some(raw_url) = query.url else {
        return client_error(StatusCode::BAD_REQUEST, "Missing url query parameter");
    };
    let url = match Url::parse(&raw_url) {
        Ok(url) => url,
        Err(err) => {
            return client_error(
                StatusCode::BAD_REQUEST,
                &format!("Invalid url {:?}: {}", raw_url, err),
            )
        }
    };

    let api = RenderApi::new(
        headers
            .iter()
            .filter(|(name, _)| name.as_str() != SECRET_HEADER)
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            }),
        Arc::clone(&state.logger),
    );

    match state
        .pool
        .render(url.clone(), api)
        .await
        .and_then(result_response)
    {
        Ok(response) => response,
        Err(err) => error_response(state.logger.as_ref(), &url, &err),
    }
}

fn client_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorInfo {
            error: message.to_string(),
            stack: None,
        }),
    )
        .into_response()
}

/// Turn a render result into a response, rejecting results that are not
/// valid HTTP.
pub fn result_response(result: RenderResult) -> Result<Response, RenderError> {
    let status = StatusCode::from_u16(result.status)
        .ok()
        .filter(|status| status.as_u16() < 600)
        .ok_or_else(|| {
            RenderError::MalformedResult(format!("{} is not a valid HTTP status", result.status))
        })?;

    let mut headers = HeaderMap::new();
    for (name, value) in &result.headers {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
            RenderError::MalformedResult(format!("{:?} is not a valid header name", name))
        })?;
        if header_name == header::VARY {
            return Err(RenderError::MalformedResult(
                "the Vary header is managed by the gateway and must not be set".to_string(),
            ));
        }
        let header_value = HeaderValue::from_str(value).map_err(|_| {
            RenderError::MalformedResult(format!("invalid value for header {}", name))
        })?;
        headers.append(header_name, header_value);
    }

    if REDIRECT_STATUSES.contains(&status.as_u16()) && !headers.contains_key(header::LOCATION) {
        return Err(RenderError::MalformedResult(format!(
            "status {} requires a Location header",
            status.as_u16()
        )));
    }
    if !headers.contains_key(header::CONTENT_TYPE) {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
    }

    let mut response = Response::new(Body::from(result.body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Log a failed render and answer with a 500 carrying the simplified error.
pub fn error_response(logger: &dyn Logger, url: &Url, err: &RenderError) -> Response {
    let info = ErrorInfo::from(err);
    logger.error(
        &format!("Render failed: {}", info.error),
        Some(&json!({
            "url": url.as_str(),
            "kind": err.kind(),
            "stack": info.stack,
        })),
    );
    (StatusCode::INTERNAL_SERVER_ERROR, Json(info)).into_response()
}
