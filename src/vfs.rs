use crate::store::{now_rfc3339, Store};
use crate::utils::sha256_hex;
use crate::{PlatformError, Result};
use log::{debug, info};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One stored file, keyed by `(site_id, path)`
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub site_id: String,
    pub path: String,
    pub content: Vec<u8>,
    pub size_bytes: u64,
    pub mime_type: String,
    /// SHA-256 hex of `content`; doubles as the strong ETag
    pub hash: String,
    pub updated_at: String,
}

/// Aggregated view of one site for the admin API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteSummary {
    pub site_id: String,
    pub file_count: u64,
    pub size_bytes: u64,
    pub updated_at: String,
}

/// Virtual file system: a typed view over the `files` table.
///
/// A site exists exactly when at least one row references its id; there is
/// no separate site registry.
#[derive(Clone)]
pub struct Vfs {
    store: Arc<Store>,
}

/// Validate a VFS path: relative, forward-slashed, no traversal
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(PlatformError::BadPath("empty path".to_string()));
    }
    if path.starts_with('/') {
        return Err(PlatformError::BadPath(format!(
            "absolute path not allowed: {}",
            path
        )));
    }
    if path.contains('\\') {
        return Err(PlatformError::BadPath(format!(
            "backslash not allowed: {}",
            path
        )));
    }
    if path.contains('\0') {
        return Err(PlatformError::BadPath("NUL byte in path".to_string()));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(PlatformError::BadPath(format!(
            "parent traversal not allowed: {}",
            path
        )));
    }
    Ok(())
}

/// MIME type for a path, by extension, with charset for text types
pub fn mime_for_path(path: &str) -> String {
    let base = mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("application/octet-stream");
    if base.starts_with("text/") {
        format!("{}; charset=utf-8", base)
    } else {
        base.to_string()
    }
}

impl Vfs {
    pub fn new(store: Arc<Store>) -> Self {
        Vfs { store }
    }

    /// Upsert a file; the hash and size are recomputed on every write
    ///
    /// # Arguments
    /// * `site_id` - Owning site
    /// * `path` - Relative forward-slashed path (pre-sanitised by callers)
    /// * `content` - File bytes
    /// * `mime_type` - Stored content type
    pub fn write(&self, site_id: &str, path: &str, content: &[u8], mime_type: &str) -> Result<()> {
        validate_path(path)?;

        let hash = sha256_hex(content);
        let now = now_rfc3339();
        let writer = self.store.writer();
        writer.execute(
            "INSERT INTO files (site_id, path, content, size_bytes, mime_type, hash, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT (site_id, path) DO UPDATE SET
                 content = excluded.content,
                 size_bytes = excluded.size_bytes,
                 mime_type = excluded.mime_type,
                 hash = excluded.hash,
                 updated_at = excluded.updated_at",
            rusqlite::params![site_id, path, content, content.len() as i64, mime_type, hash, now],
        )?;

        debug!("VFS write {}/{} ({} bytes)", site_id, path, content.len());
        Ok(())
    }

    /// Read a file, or `None` when absent
    pub fn read(&self, site_id: &str, path: &str) -> Result<Option<FileEntry>> {
        let reader = self.store.reader().map_err(PlatformError::from)?;
        let entry = reader
            .query_row(
                "SELECT content, size_bytes, mime_type, hash, updated_at
                 FROM files WHERE site_id = ?1 AND path = ?2",
                [site_id, path],
                |row| {
                    Ok(FileEntry {
                        site_id: site_id.to_string(),
                        path: path.to_string(),
                        content: row.get(0)?,
                        size_bytes: row.get::<_, i64>(1)? as u64,
                        mime_type: row.get(2)?,
                        hash: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    /// Whether `(site_id, path)` is stored
    pub fn exists(&self, site_id: &str, path: &str) -> Result<bool> {
        let reader = self.store.reader().map_err(PlatformError::from)?;
        let found: Option<i64> = reader
            .query_row(
                "SELECT 1 FROM files WHERE site_id = ?1 AND path = ?2",
                [site_id, path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Whether any file references this site id
    pub fn site_exists(&self, site_id: &str) -> Result<bool> {
        let reader = self.store.reader().map_err(PlatformError::from)?;
        let found: Option<i64> = reader
            .query_row(
                "SELECT 1 FROM files WHERE site_id = ?1 LIMIT 1",
                [site_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Remove every file of a site in a single transaction
    pub fn delete_site(&self, site_id: &str) -> Result<()> {
        let mut writer = self.store.writer();
        let tx = writer.transaction().map_err(PlatformError::from)?;
        let removed = tx.execute("DELETE FROM files WHERE site_id = ?1", [site_id])?;
        tx.commit().map_err(PlatformError::from)?;
        info!("VFS removed {} files for site '{}'", removed, site_id);
        Ok(())
    }

    /// Per-site aggregates for the admin API, most recently updated first
    pub fn list_sites(&self) -> Result<Vec<SiteSummary>> {
        let reader = self.store.reader().map_err(PlatformError::from)?;
        let mut stmt = reader.prepare(
            "SELECT site_id, COUNT(*), COALESCE(SUM(size_bytes), 0), MAX(updated_at)
             FROM files GROUP BY site_id ORDER BY MAX(updated_at) DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SiteSummary {
                site_id: row.get(0)?,
                file_count: row.get::<_, i64>(1)? as u64,
                size_bytes: row.get::<_, i64>(2)? as u64,
                updated_at: row.get(3)?,
            })
        })?;

        let mut sites = Vec::new();
        for row in rows {
            sites.push(row?);
        }
        Ok(sites)
    }
}
