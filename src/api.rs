use crate::config::AppConfig;
use crate::deploy::{DeployOutcome, DeployPipeline, DeployRateLimiter, DeploymentRecord};
use crate::hub::HubRegistry;
use crate::kv::{EnvStore, KvStore};
use crate::middleware::{self, AuthToken};
use crate::outbound::OutboundClient;
use crate::router::{self, HostClass, SiteId};
use crate::runtime::ScriptRuntime;
use crate::store::Store;
use crate::tls::ChallengeStash;
use crate::tokens::{IssuedToken, TokenInfo, TokenStore};
use crate::utils::validate_subdomain;
use crate::vfs::{SiteSummary, Vfs};
use crate::{PlatformError, Result, DEPLOYS_PER_MINUTE, MAX_DEPLOY_BYTES, MAX_REQUEST_BODY_BYTES};
use axum::extract::{ConnectInfo, DefaultBodyLimit, Extension, Multipart, Path, Request, State};
use axum::http::header::HOST;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use log::{info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers; constructed once at startup,
/// read-only afterwards
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<Store>,
    pub vfs: Vfs,
    pub kv: KvStore,
    pub env: EnvStore,
    pub tokens: TokenStore,
    pub pipeline: DeployPipeline,
    pub runtime: ScriptRuntime,
    pub hubs: Arc<HubRegistry>,
    pub deploy_limiter: Arc<DeployRateLimiter>,
    pub acme: Arc<ChallengeStash>,
}

impl AppState {
    /// Wire every component around one store handle. Must run inside the
    /// tokio runtime (the outbound client captures its handle).
    pub fn new(config: AppConfig, store: Arc<Store>) -> Self {
        let kv = KvStore::new(store.clone());
        let outbound = OutboundClient::new(tokio::runtime::Handle::current());

        AppState {
            config: Arc::new(config),
            vfs: Vfs::new(store.clone()),
            kv: kv.clone(),
            env: EnvStore::new(store.clone()),
            tokens: TokenStore::new(store.clone()),
            pipeline: DeployPipeline::new(store.clone()),
            runtime: ScriptRuntime::new(kv, outbound),
            hubs: Arc::new(HubRegistry::new()),
            deploy_limiter: Arc::new(DeployRateLimiter::new(DEPLOYS_PER_MINUTE)),
            acme: Arc::new(ChallengeStash::new()),
            store,
        }
    }
}

#[derive(Clone)]
struct Dispatcher {
    domain: String,
    dashboard: Router,
    sites: Router,
}

/// Build the full application: one listener multiplexing dashboard/admin,
/// tenant sites, serverless dispatch and WebSocket upgrades by `Host` header
pub fn create_app(state: AppState) -> Router {
    let dispatcher = Dispatcher {
        domain: state.config.domain.clone(),
        dashboard: dashboard_router(state.clone()),
        sites: site_router(state.clone()),
    };

    let app = Router::new()
        .fallback(dispatch)
        .with_state(dispatcher)
        // Innermost first: each layer wraps everything added before it
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TimeoutLayer::new(Duration::from_secs(15)))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::security_headers,
        ))
        .layer(CatchPanicLayer::new())
        .layer(axum::middleware::from_fn(middleware::request_context));

    if state.config.dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

async fn dispatch(State(dispatcher): State<Dispatcher>, request: Request) -> Response {
    let host = request
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    match router::classify_host(host, &dispatcher.domain) {
        HostClass::Dashboard => route_oneshot(dispatcher.dashboard.clone(), request).await,
        HostClass::Site(label) => {
            let mut request = request;
            request.extensions_mut().insert(SiteId(label));
            route_oneshot(dispatcher.sites.clone(), request).await
        }
    }
}

async fn route_oneshot(router: Router, request: Request) -> Response {
    match router.oneshot(request).await {
        Ok(response) => response,
        Err(infallible) => match infallible {},
    }
}

fn dashboard_router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/api/deploy",
            post(deploy).layer(DefaultBodyLimit::max(
                MAX_DEPLOY_BYTES as usize + 1024 * 1024,
            )),
        )
        .route("/api/sites", get(list_sites))
        .route("/api/sites/:site_id", delete(delete_site))
        .route("/api/keys", get(list_keys).post(create_key))
        .route("/api/keys/:id", delete(revoke_key))
        .route("/api/envvars/:site_id", get(list_env_vars).post(set_env_var))
        .route("/api/envvars/:site_id/:name", delete(delete_env_var))
        .route("/api/deployments", get(list_deployments))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_bearer,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/.well-known/acme-challenge/:token", get(acme_challenge))
        .route("/", get(dashboard))
        .merge(protected)
        .with_state(state)
}

fn site_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(router::ws_upgrade))
        .fallback(router::site_content)
        .with_state(state)
}

/// Dashboard collaborator stand-in: the real admin UI is served by a
/// separate frontend; this keeps the main-domain dispatch contract alive
async fn dashboard(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        "<!doctype html>\n<html>\n<head><title>cartridge</title></head>\n<body>\n\
         <h1>cartridge</h1>\n<p>Personal PaaS running on <code>{}</code>. \
         Deploy with <code>POST /api/deploy</code>.</p>\n</body>\n</html>\n",
        state.config.domain
    ))
}

async fn health(State(state): State<AppState>) -> Response {
    match state.store.health() {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(e) => {
            warn!("Health probe failed: {}", e);
            PlatformError::Unavailable("store unreachable".to_string()).into_response()
        }
    }
}

async fn acme_challenge(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Response {
    match state.acme.answer(&token) {
        Some(key_auth) => (StatusCode::OK, key_auth).into_response(),
        None => (StatusCode::NOT_FOUND, "unknown challenge").into_response(),
    }
}

async fn deploy(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    Extension(token): Extension<AuthToken>,
    mut multipart: Multipart,
) -> Result<Json<DeployOutcome>> {
    let ip = connect
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    state.deploy_limiter.check(ip)?;

    let mut site_name = None;
    let mut archive = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| PlatformError::BadRequest(e.to_string()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("site_name") => {
                site_name = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| PlatformError::BadRequest(e.to_string()))?,
                );
            }
            Some("file") => {
                archive = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| PlatformError::PayloadTooLarge(e.to_string()))?,
                );
            }
            _ => {}
        }
    }

    let site_name = site_name
        .ok_or_else(|| PlatformError::BadRequest("missing field 'site_name'".to_string()))?;
    let archive =
        archive.ok_or_else(|| PlatformError::BadRequest("missing field 'file'".to_string()))?;

    let pipeline = state.pipeline.clone();
    let deployed_by = token.name.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        pipeline.deploy(site_name.trim(), &archive, &deployed_by)
    })
    .await
    .map_err(|e| PlatformError::Internal(e.to_string()))??;

    Ok(Json(outcome))
}

async fn list_sites(State(state): State<AppState>) -> Result<Json<Vec<SiteSummary>>> {
    Ok(Json(state.vfs.list_sites()?))
}

async fn delete_site(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    validate_subdomain(&site_id)?;
    if !state.vfs.site_exists(&site_id)? {
        return Err(PlatformError::NotFound(format!("site '{}'", site_id)));
    }

    state.store.purge_site(&site_id).map_err(PlatformError::from)?;
    state.hubs.remove_site(&site_id);
    info!("Deleted site '{}'", site_id);

    Ok(Json(serde_json::json!({ "success": true, "site": site_id })))
}

async fn list_keys(State(state): State<AppState>) -> Result<Json<Vec<TokenInfo>>> {
    Ok(Json(state.tokens.list()?))
}

#[derive(Debug, Deserialize)]
struct CreateKeyRequest {
    name: String,
    #[serde(default)]
    scopes: Option<String>,
}

async fn create_key(
    State(state): State<AppState>,
    Json(request): Json<CreateKeyRequest>,
) -> Result<Json<IssuedToken>> {
    let tokens = state.tokens.clone();
    // bcrypt hashing is deliberately slow; keep it off the async workers
    let issued = tokio::task::spawn_blocking(move || {
        tokens.issue(&request.name, request.scopes.as_deref())
    })
    .await
    .map_err(|e| PlatformError::Internal(e.to_string()))??;
    Ok(Json(issued))
}

async fn revoke_key(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>> {
    state.tokens.revoke(id)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn list_env_vars(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> Result<Json<HashMap<String, String>>> {
    validate_subdomain(&site_id)?;
    Ok(Json(state.env.snapshot(&site_id)?))
}

#[derive(Debug, Deserialize)]
struct SetEnvVarRequest {
    name: String,
    value: String,
}

async fn set_env_var(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    Json(request): Json<SetEnvVarRequest>,
) -> Result<Json<serde_json::Value>> {
    validate_subdomain(&site_id)?;
    state.env.set(&site_id, &request.name, &request.value)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn delete_env_var(
    State(state): State<AppState>,
    Path((site_id, name)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>> {
    validate_subdomain(&site_id)?;
    state.env.delete(&site_id, &name)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn list_deployments(State(state): State<AppState>) -> Result<Json<Vec<DeploymentRecord>>> {
    Ok(Json(state.pipeline.list_deployments()?))
}

/// Run the server until SIGINT/SIGTERM, then drain and clean up
pub async fn start_server(state: AppState) -> Result<()> {
    let app = create_app(state.clone());
    let addr = state.config.listen_addr();

    write_pid_file(&state.config)?;
    info!(
        "Listening on {} (domain '{}', tls {})",
        addr,
        state.config.domain,
        if state.config.tls_enabled { "on" } else { "off" }
    );

    let served = if state.config.tls_enabled {
        crate::tls::serve_tls(state.clone(), app).await
    } else {
        serve_plain(addr, app).await
    };

    state.hubs.shutdown_all();
    remove_pid_file(&state.config);
    info!("Server shutdown complete");
    served
}

async fn serve_plain(addr: SocketAddr, app: Router) -> Result<()> {
    let handle = axum_server::Handle::new();
    let watcher = handle.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        // Stop accepting, drain in-flight work, then force-close
        watcher.graceful_shutdown(Some(Duration::from_secs(30)));
    });

    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(PlatformError::from)
}

pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Received shutdown signal, draining in-flight requests");
}

fn write_pid_file(config: &AppConfig) -> Result<()> {
    std::fs::write(config.pid_path(), std::process::id().to_string())
        .map_err(PlatformError::from)
}

fn remove_pid_file(config: &AppConfig) {
    if let Err(e) = std::fs::remove_file(config.pid_path()) {
        warn!("Could not remove PID file: {}", e);
    }
}
