use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use std::fmt;

/// Custom error types for the platform
#[derive(Debug, Clone)]
pub enum PlatformError {
    /// Malformed input: bad subdomain, missing field, invalid JSON
    BadRequest(String),
    /// Missing or invalid bearer token
    Unauthorized(String),
    /// Path traversal or disallowed access
    Forbidden(String),
    /// Site or file missing
    NotFound(String),
    /// Request body over the configured cap
    PayloadTooLarge(String),
    /// Too many deploys from one address
    RateLimited(String),
    /// Invalid path handed to the VFS
    BadPath(String),
    /// Archive ingestion failed and was rolled back
    DeployFailed(String),
    /// Script raised an uncaught error
    ScriptError(String),
    /// Script hit the wall-clock deadline
    ScriptTimeout,
    /// Storage-level failure
    StorageError(String),
    /// TLS issuance failure
    TlsError(String),
    /// Internal fault
    Internal(String),
    /// Store unreachable on the health probe
    Unavailable(String),
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            PlatformError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            PlatformError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            PlatformError::NotFound(msg) => write!(f, "Not found: {}", msg),
            PlatformError::PayloadTooLarge(msg) => write!(f, "Payload too large: {}", msg),
            PlatformError::RateLimited(msg) => write!(f, "Rate limited: {}", msg),
            PlatformError::BadPath(msg) => write!(f, "Bad path: {}", msg),
            PlatformError::DeployFailed(msg) => write!(f, "Deploy failed: {}", msg),
            PlatformError::ScriptError(msg) => write!(f, "Script error: {}", msg),
            PlatformError::ScriptTimeout => {
                write!(f, "Script execution timed out (100ms limit)")
            }
            PlatformError::StorageError(msg) => write!(f, "Storage error: {}", msg),
            PlatformError::TlsError(msg) => write!(f, "TLS error: {}", msg),
            PlatformError::Internal(msg) => write!(f, "Internal error: {}", msg),
            PlatformError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl std::error::Error for PlatformError {}

/// Result type for platform operations
pub type Result<T> = std::result::Result<T, PlatformError>;

impl PlatformError {
    /// HTTP status this error renders as
    pub fn status_code(&self) -> StatusCode {
        match self {
            PlatformError::BadRequest(_) | PlatformError::BadPath(_) => StatusCode::BAD_REQUEST,
            PlatformError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            PlatformError::Forbidden(_) => StatusCode::FORBIDDEN,
            PlatformError::NotFound(_) => StatusCode::NOT_FOUND,
            PlatformError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            PlatformError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            PlatformError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PlatformError::DeployFailed(_)
            | PlatformError::ScriptError(_)
            | PlatformError::ScriptTimeout
            | PlatformError::StorageError(_)
            | PlatformError::TlsError(_)
            | PlatformError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PlatformError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        if status == StatusCode::UNAUTHORIZED {
            // Bearer hint so CLI clients know what to present
            return (status, [("WWW-Authenticate", "Bearer")], body).into_response();
        }
        (status, body).into_response()
    }
}

impl From<rusqlite::Error> for PlatformError {
    fn from(err: rusqlite::Error) -> Self {
        PlatformError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for PlatformError {
    fn from(err: serde_json::Error) -> Self {
        PlatformError::BadRequest(err.to_string())
    }
}

impl From<std::io::Error> for PlatformError {
    fn from(err: std::io::Error) -> Self {
        PlatformError::Internal(err.to_string())
    }
}

impl From<bcrypt::BcryptError> for PlatformError {
    fn from(err: bcrypt::BcryptError) -> Self {
        PlatformError::Internal(err.to_string())
    }
}

impl From<zip::result::ZipError> for PlatformError {
    fn from(err: zip::result::ZipError) -> Self {
        PlatformError::DeployFailed(err.to_string())
    }
}
