use crate::api::AppState;
use crate::hub::HubHandle;
use crate::runtime::{ScriptRequest, ScriptResponse};
use crate::utils::validate_subdomain;
use crate::vfs::FileEntry;
use crate::MAIN_SCRIPT_PATH;
use axum::body::Body;
use axum::extract::ws::WebSocket;
use axum::extract::{Extension, Request, State, WebSocketUpgrade};
use axum::http::header::{CONTENT_TYPE, ETAG, HOST, IF_NONE_MATCH, ORIGIN};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use std::collections::HashMap;

/// What a request's `Host` header resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostClass {
    /// Main domain (or a bare local address): dashboard + admin API
    Dashboard,
    /// One tenant site, by subdomain label
    Site(String),
}

/// Site id carried through the request extensions once the host is classified
#[derive(Debug, Clone)]
pub struct SiteId(pub String);

/// Strip the port from a `Host` header value, bracketed IPv6 included
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    // More than one colon without brackets means a raw IPv6 address
    if host.matches(':').count() > 1 {
        return host;
    }
    match host.split_once(':') {
        Some((name, _port)) => name,
        None => host,
    }
}

/// Classify a `Host` header against the configured main domain.
///
/// `<label>.<domain>` and `<label>.localhost` resolve to a site when the
/// label is a valid subdomain with no further dots; everything else falls
/// back to the dashboard.
pub fn classify_host(host_header: &str, main_domain: &str) -> HostClass {
    let host = strip_port(host_header).to_ascii_lowercase();

    if host == main_domain || host == "localhost" || host == "127.0.0.1" {
        return HostClass::Dashboard;
    }

    for base in [main_domain, "localhost"] {
        if let Some(label) = host.strip_suffix(base).and_then(|h| h.strip_suffix('.')) {
            if !label.contains('.') && validate_subdomain(label).is_ok() {
                return HostClass::Site(label.to_string());
            }
        }
    }

    HostClass::Dashboard
}

/// Thin seam to the analytics collaborator: one structured visit record per
/// site request
fn record_visit(site_id: &str, path: &str) {
    info!(target: "visits", "site={} path={}", site_id, path);
}

/// 404 page for a subdomain with no deployed site
fn site_not_found(site_id: &str, domain: &str) -> Response {
    let body = format!(
        "<!doctype html>\n<html>\n<head><title>404 - {site}.{domain}</title></head>\n\
         <body>\n<h1>404</h1>\n<p>No site is deployed at <code>{site}.{domain}</code>.</p>\n\
         </body>\n</html>\n",
        site = site_id,
        domain = domain,
    );
    (StatusCode::NOT_FOUND, Html(body)).into_response()
}

/// WebSocket upgrade for `<site>/ws`
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Extension(SiteId(site_id)): Extension<SiteId>,
    ws: WebSocketUpgrade,
    request_headers: axum::http::HeaderMap,
) -> Response {
    if !origin_allowed(&request_headers) {
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    match state.vfs.site_exists(&site_id) {
        Ok(true) => {}
        Ok(false) => return site_not_found(&site_id, &state.config.domain),
        Err(e) => return e.into_response(),
    }

    let hub = state.hubs.handle(&site_id);
    ws.on_upgrade(move |socket| connection_loop(hub, socket))
}

/// Accept when there is no Origin, the origin host matches the request host,
/// or the origin is local
fn origin_allowed(headers: &axum::http::HeaderMap) -> bool {
    let origin = match headers.get(ORIGIN).and_then(|v| v.to_str().ok()) {
        Some(origin) => origin,
        None => return true,
    };
    let origin_host = match url::Url::parse(origin) {
        Ok(url) => match url.host_str() {
            Some(host) => host.to_ascii_lowercase(),
            None => return false,
        },
        Err(_) => return false,
    };
    if origin_host == "localhost" || origin_host == "127.0.0.1" {
        return true;
    }

    let request_host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(strip_port)
        .unwrap_or_default()
        .to_ascii_lowercase();
    origin_host == request_host
}

/// Forward hub frames into the socket and watch the client side; either
/// direction ending detaches the connection
async fn connection_loop(hub: HubHandle, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (id, mut outbound) = hub.register();

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(message) => {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                // Hub shut down; close our side
                None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(_)) => {} // inbound frames are not part of the surface
                _ => break,
            },
        }
    }

    hub.unregister(id);
}

/// Static or serverless dispatch for everything that is not `/ws`
pub async fn site_content(
    State(state): State<AppState>,
    Extension(SiteId(site_id)): Extension<SiteId>,
    request: Request,
) -> Response {
    match state.vfs.site_exists(&site_id) {
        Ok(true) => {}
        Ok(false) => return site_not_found(&site_id, &state.config.domain),
        Err(e) => return e.into_response(),
    }

    record_visit(&site_id, request.uri().path());

    // A main script makes the whole site serverless; its dispatch is
    // authoritative even when it writes nothing
    match state.vfs.read(&site_id, MAIN_SCRIPT_PATH) {
        Ok(Some(script)) => run_site_script(&state, &site_id, script, request).await,
        Ok(None) => serve_static(&state, &site_id, &request),
        Err(e) => e.into_response(),
    }
}

async fn run_site_script(
    state: &AppState,
    site_id: &str,
    script: FileEntry,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();

    let mut headers = HashMap::new();
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            headers
                .entry(name.as_str().to_ascii_lowercase())
                .or_insert_with(|| value.to_string());
        }
    }

    let raw_body = match axum::body::to_bytes(body, crate::SCRIPT_BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Dropping oversized script request body for '{}': {}", site_id, e);
            Default::default()
        }
    };

    let script_request = ScriptRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().unwrap_or_default().to_string(),
        headers,
        body: ScriptRequest::clamp_body(&raw_body),
    };

    let env_vars = match state.env.snapshot(site_id) {
        Ok(vars) => vars,
        Err(e) => return e.into_response(),
    };
    let hub = state.hubs.handle(site_id);
    let runtime = state.runtime.clone();
    let site = site_id.to_string();
    let source = String::from_utf8_lossy(&script.content).into_owned();

    let outcome = tokio::task::spawn_blocking(move || {
        runtime.execute(&site, &source, script_request, env_vars, hub)
    })
    .await;

    match outcome {
        Ok(response) => script_response_into_http(response),
        Err(e) => {
            warn!("Script worker for '{}' failed: {}", site_id, e);
            crate::PlatformError::Internal("script worker failed".to_string()).into_response()
        }
    }
}

fn script_response_into_http(script: ScriptResponse) -> Response {
    let status = StatusCode::from_u16(script.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::builder().status(status);
    if let Some(headers) = response.headers_mut() {
        for (name, value) in &script.headers {
            let name = match HeaderName::try_from(name.as_str()) {
                Ok(name) => name,
                Err(_) => continue,
            };
            let value = match HeaderValue::try_from(value.as_str()) {
                Ok(value) => value,
                Err(_) => continue,
            };
            headers.insert(name, value);
        }
    }
    response
        .body(Body::from(script.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Candidate VFS paths for a request path, emulating directory semantics
fn static_candidates(request_path: &str) -> Vec<String> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return vec!["index.html".to_string()];
    }
    if let Some(dir) = trimmed.strip_suffix('/') {
        return vec![format!("{}/index.html", dir)];
    }
    vec![trimmed.to_string(), format!("{}/index.html", trimmed)]
}

fn serve_static(state: &AppState, site_id: &str, request: &Request) -> Response {
    let mut entry = None;
    for candidate in static_candidates(request.uri().path()) {
        match state.vfs.read(site_id, &candidate) {
            Ok(Some(found)) => {
                entry = Some(found);
                break;
            }
            Ok(None) => continue,
            Err(e) => return e.into_response(),
        }
    }

    let entry = match entry {
        Some(entry) => entry,
        None => {
            return (StatusCode::NOT_FOUND, "file not found").into_response();
        }
    };

    let etag = format!("\"{}\"", entry.hash);
    if let Some(tags) = request
        .headers()
        .get(IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        if tags.contains(&entry.hash) {
            return Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .header(ETAG, etag.as_str())
                .body(Body::empty())
                .unwrap_or_else(|_| StatusCode::NOT_MODIFIED.into_response());
        }
    }

    let mime = if entry.mime_type.is_empty() {
        crate::vfs::mime_for_path(&entry.path)
    } else {
        entry.mime_type.clone()
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, mime)
        .header(ETAG, etag.as_str())
        .body(Body::from(entry.content))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
