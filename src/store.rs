use crate::PlatformError;
use log::{debug, info};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Storage-related errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema version mismatch: database is at {found}, binary supports up to {supported}")]
    VersionMismatch { found: i64, supported: i64 },
}

impl From<StoreError> for PlatformError {
    fn from(err: StoreError) -> Self {
        PlatformError::StorageError(err.to_string())
    }
}

/// Schema migrations, applied in order and tracked via `PRAGMA user_version`
const MIGRATIONS: &[&str] = &[
    // v1: initial schema
    "CREATE TABLE files (
        site_id    TEXT NOT NULL,
        path       TEXT NOT NULL,
        content    BLOB NOT NULL,
        size_bytes INTEGER NOT NULL,
        mime_type  TEXT NOT NULL,
        hash       TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (site_id, path)
    );
    CREATE TABLE api_keys (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        name         TEXT NOT NULL,
        key_hash     TEXT NOT NULL,
        scopes       TEXT,
        created_at   TEXT NOT NULL,
        last_used_at TEXT
    );
    CREATE TABLE deployments (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        site_id     TEXT NOT NULL,
        size_bytes  INTEGER NOT NULL,
        file_count  INTEGER NOT NULL,
        deployed_by TEXT NOT NULL,
        created_at  TEXT NOT NULL
    );
    CREATE TABLE kv_store (
        site_id    TEXT NOT NULL,
        key        TEXT NOT NULL,
        value      TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (site_id, key)
    );
    CREATE TABLE env_vars (
        site_id TEXT NOT NULL,
        name    TEXT NOT NULL,
        value   TEXT NOT NULL,
        PRIMARY KEY (site_id, name)
    );
    CREATE TABLE certificates (
        key        TEXT PRIMARY KEY,
        value      BLOB NOT NULL,
        updated_at TEXT NOT NULL
    );",
];

/// Current RFC 3339 UTC timestamp, the format every table stores
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Embedded SQLite store owning every persistent byte of the platform.
///
/// One writer connection behind a mutex serialises all writes; a small pool
/// of read-only connections lets readers proceed concurrently under WAL.
pub struct Store {
    path: PathBuf,
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
}

/// Pooled read-only connection, returned to the pool on drop
pub struct Reader<'a> {
    conn: Option<Connection>,
    store: &'a Store,
}

impl Deref for Reader<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().unwrap()
    }
}

impl Drop for Reader<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut pool = self.store.readers.lock();
            if pool.len() < MAX_POOLED_READERS {
                pool.push(conn);
            }
        }
    }
}

const MAX_POOLED_READERS: usize = 8;

impl Store {
    /// Open (or create) the database file and bring the schema up to date
    ///
    /// # Arguments
    /// * `path` - Path of the database file; the containing directory is
    ///   created with owner-only permissions
    ///
    /// # Returns
    /// * `Result<Store, StoreError>` - The ready store, or a fail-fast error
    ///   when the on-disk schema is newer than this binary
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(dir) = path.parent() {
            create_private_dir(dir)?;
        }

        let writer = Connection::open(&path)?;
        configure_connection(&writer)?;
        set_private_file_mode(&path)?;
        run_migrations(&writer)?;

        info!("Opened store at {}", path.display());

        Ok(Store {
            path,
            writer: Mutex::new(writer),
            readers: Mutex::new(Vec::new()),
        })
    }

    /// Exclusive writer connection; all mutations go through this handle
    pub fn writer(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock()
    }

    /// Read-only connection from the pool (opened on demand)
    pub fn reader(&self) -> Result<Reader<'_>, StoreError> {
        let pooled = self.readers.lock().pop();
        let conn = match pooled {
            Some(conn) => conn,
            None => {
                let conn = Connection::open_with_flags(
                    &self.path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                conn.busy_timeout(Duration::from_secs(5))?;
                debug!("Opened new read connection");
                conn
            }
        };
        Ok(Reader {
            conn: Some(conn),
            store: self,
        })
    }

    /// Liveness probe backing `/health`
    pub fn health(&self) -> Result<(), StoreError> {
        let reader = self.reader()?;
        reader.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    /// Remove every persistent trace of a site (files, KV, env vars) in a
    /// single transaction
    pub fn purge_site(&self, site_id: &str) -> Result<(), StoreError> {
        let mut writer = self.writer();
        let tx = writer.transaction()?;
        tx.execute("DELETE FROM files WHERE site_id = ?1", [site_id])?;
        tx.execute("DELETE FROM kv_store WHERE site_id = ?1", [site_id])?;
        tx.execute("DELETE FROM env_vars WHERE site_id = ?1", [site_id])?;
        tx.commit()?;
        info!("Purged site '{}'", site_id);
        Ok(())
    }
}

fn configure_connection(conn: &Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(())
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    let supported = MIGRATIONS.len() as i64;

    if version > supported {
        return Err(StoreError::VersionMismatch {
            found: version,
            supported,
        });
    }

    for (idx, sql) in MIGRATIONS.iter().enumerate().skip(version as usize) {
        let target = (idx + 1) as i64;
        conn.execute_batch(&format!(
            "BEGIN;\n{}\nPRAGMA user_version = {};\nCOMMIT;",
            sql, target
        ))?;
        info!("Applied store migration v{}", target);
    }

    Ok(())
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)
}

#[cfg(unix)]
fn set_private_file_mode(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_private_file_mode(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
