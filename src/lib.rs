//! # Cartridge
//!
//! A self-hosted, single-binary personal PaaS. One executable accepts
//! content bundles from a CLI client, stores them in a single SQLite file,
//! and serves them publicly under per-tenant subdomains. A site is either
//! pure static content or a serverless script executed on demand inside a
//! sandboxed interpreter on every request.
//!
//! This crate provides the whole platform plane:
//! - Embedded SQLite store (WAL) owning every persistent byte
//! - Virtual file system keyed by `(site_id, path)` with SHA-256 ETags
//! - Authenticated ZIP deploys with atomic site replacement
//! - Deploy tokens: bcrypt-hashed bearer secrets, constant-time validation
//! - Per-request sandboxed script runtime with `req`/`res`/`db`/`socket`/
//!   `fetch`/`console`/`process.env` capabilities and a 100 ms deadline
//! - Per-site WebSocket hubs with bounded, lossy broadcast
//! - Host-header router multiplexing dashboard, static serving, serverless
//!   dispatch and WebSocket upgrades onto one listener
//! - Optional automatic TLS via ACME, persisted through the store
//!
//! ## Architecture
//!
//! The project follows a modular architecture with clear separation of
//! concerns:
//!
//! - **Store**: SQLite handle, migrations, writer/reader discipline
//! - **VFS**: content-addressed file rows, the only definition of a "site"
//! - **Deploy**: archive ingestion, sanitisation, clean-slate replacement
//! - **Tokens**: deploy-token issuance and validation
//! - **KV / Env**: site-scoped stores surfaced to scripts
//! - **Runtime**: per-request script execution and capability binding
//! - **Outbound**: SSRF-guarded `fetch`
//! - **Hub**: in-memory per-site WebSocket fan-out
//! - **Router / Middleware / API**: HTTP surface and server lifecycle
//! - **TLS**: ACME issuance and renewal

pub mod api;
pub mod config;
pub mod deploy;
pub mod error;
pub mod hub;
pub mod kv;
pub mod middleware;
pub mod outbound;
pub mod router;
pub mod runtime;
pub mod store;
pub mod tls;
pub mod tokens;
pub mod utils;
pub mod vfs;

// Re-export main types for easy access
pub use api::{create_app, start_server, AppState};
pub use config::AppConfig;
pub use deploy::{DeployOutcome, DeployPipeline, DeployRateLimiter, DeploymentRecord};
pub use error::{PlatformError, Result};
pub use hub::{HubHandle, HubRegistry};
pub use kv::{EnvStore, KvStore};
pub use outbound::OutboundClient;
pub use router::{classify_host, HostClass};
pub use runtime::{ScriptRequest, ScriptResponse, ScriptRuntime};
pub use store::Store;
pub use tokens::{IssuedToken, TokenInfo, TokenStore};
pub use vfs::{SiteSummary, Vfs};

use std::time::Duration;

/// Current version of the platform
pub const PLATFORM_VERSION: &str = "0.1.0";

/// Default listen port
pub const DEFAULT_PORT: u16 = 4698;

/// VFS path of the serverless entry point; its presence makes a site
/// serverless
pub const MAIN_SCRIPT_PATH: &str = "main.js";

/// Maximum accepted deploy archive (and per-entry) size
pub const MAX_DEPLOY_BYTES: u64 = 100 * 1024 * 1024; // 100 MiB

/// Default request body cap outside the deploy endpoint
pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024; // 1 MiB

/// Request body visible to scripts, truncated past this point
pub const SCRIPT_BODY_LIMIT: usize = 1024 * 1024; // 1 MiB

/// Wall-clock budget for one script execution
pub const SCRIPT_DEADLINE: Duration = Duration::from_millis(100);

/// Total timeout for one outbound `fetch`
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound response bytes surfaced to scripts; the rest is discarded
pub const FETCH_MAX_RESPONSE_BYTES: usize = 1024 * 1024; // 1 MiB

/// Broadcast queue capacity per WebSocket hub
pub const HUB_QUEUE_CAPACITY: usize = 256;

/// Accepted deploys per source IP per minute
pub const DEPLOYS_PER_MINUTE: u32 = 5;
