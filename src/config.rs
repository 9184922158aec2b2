use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Runtime configuration for the platform, resolved once at startup and
/// shared read-only afterwards.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Main domain the dashboard answers on; tenant sites live one label
    /// below it (`<site>.<domain>`)
    pub domain: String,
    /// Listen port
    pub port: u16,
    /// Directory holding the database file and PID file
    pub data_dir: PathBuf,
    /// Permissive CORS and relaxed defaults for local development
    pub dev_mode: bool,
    /// Enables Strict-Transport-Security and production ACME directory
    pub production: bool,
    /// Obtain and renew certificates automatically
    pub tls_enabled: bool,
    /// Contact mailbox for the ACME account
    pub tls_contact: Option<String>,
}

impl AppConfig {
    /// Socket address the HTTP listener binds to
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port)
    }

    /// Path of the SQLite database file
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("cartridge.db")
    }

    /// Path of the PID file written while the server runs
    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("cartridge.pid")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            domain: "localhost".to_string(),
            port: 4698,
            data_dir: PathBuf::from("./data"),
            dev_mode: false,
            production: false,
            tls_enabled: false,
            tls_contact: None,
        }
    }
}
