use crate::api::AppState;
use crate::utils::request_id;
use crate::{PlatformError, Result};
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use log::info;
use std::time::Instant;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Token identity attached to the request once the bearer gate passes
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub id: i64,
    pub name: String,
}

/// Outermost layer: propagate or mint a request id, mirror it on the
/// response, and emit one access-log line per request
pub async fn request_context(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(request_id);

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let mut response = next.run(request).await;

    info!(
        "{} {} -> {} in {:?} [{}]",
        method,
        path,
        response.status().as_u16(),
        started.elapsed(),
        id
    );

    if let Ok(value) = HeaderValue::try_from(id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

/// Baseline security headers on every response; HSTS only when the server
/// actually runs in production behind TLS
pub async fn security_headers(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    let static_pairs: &[(&str, &str)] = &[
        ("x-frame-options", "DENY"),
        ("x-content-type-options", "nosniff"),
        ("referrer-policy", "no-referrer"),
        ("x-xss-protection", "1; mode=block"),
        (
            "content-security-policy",
            "default-src 'self'; script-src 'self' 'unsafe-inline'; style-src 'self' 'unsafe-inline'; img-src 'self' data:",
        ),
        (
            "permissions-policy",
            "geolocation=(), microphone=(), camera=()",
        ),
    ];
    for (name, value) in static_pairs {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }

    if state.config.production {
        headers.insert(
            HeaderName::from_static("strict-transport-security"),
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
    }

    response
}

/// Bearer gate for write/admin endpoints. Public surfaces (served sites,
/// WebSockets, health) never pass through here.
pub async fn require_bearer(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let secret = bearer_secret(&request)?;

    let tokens = state.tokens.clone();
    let validated = tokio::task::spawn_blocking(move || tokens.validate(&secret))
        .await
        .map_err(|e| PlatformError::Internal(e.to_string()))??;

    match validated {
        Some((id, name)) => {
            request.extensions_mut().insert(AuthToken { id, name });
            Ok(next.run(request).await)
        }
        None => Err(PlatformError::Unauthorized(
            "unknown deploy token".to_string(),
        )),
    }
}

fn bearer_secret(request: &Request) -> Result<String> {
    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            PlatformError::Unauthorized("missing Authorization header".to_string())
        })?;

    let secret = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| PlatformError::Unauthorized("expected Bearer authorization".to_string()))?
        .trim();
    if secret.is_empty() {
        return Err(PlatformError::Unauthorized("empty bearer token".to_string()));
    }
    Ok(secret.to_string())
}
